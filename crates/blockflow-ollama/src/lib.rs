#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

/// Tracing target for client operations
pub const TRACING_TARGET_CLIENT: &str = "blockflow_ollama::client";

mod client;
mod config;
mod error;
mod provider;
mod wire;

pub use crate::client::OllamaClient;
pub use crate::config::OllamaConfig;
pub use crate::error::{Error, Result};
