#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

pub mod definition;
pub mod engine;
mod error;
pub mod schema;
pub mod template;

pub use error::{WorkflowError, WorkflowResult};

/// Tracing target for runtime operations.
pub const TRACING_TARGET: &str = "blockflow_runtime";

/// Tracing target for block execution.
pub const TRACING_TARGET_ENGINE: &str = "blockflow_runtime::engine";
