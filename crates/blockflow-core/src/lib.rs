#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

mod error;
mod health;
mod services;
mod task;

pub mod emb;
pub mod inference;
#[cfg(any(test, feature = "test-utils"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-utils")))]
pub mod mock;

pub use error::{BoxedError, Error, ErrorKind, Result};
pub use health::{ServiceHealth, ServiceStatus};
pub use services::AiServices;
pub use task::{Task, TaskMetadata, TaskPriority};

/// Tracing target for completion operations.
pub const TRACING_TARGET_INFERENCE: &str = "blockflow_core::inference";

/// Tracing target for embedding operations.
pub const TRACING_TARGET_EMB: &str = "blockflow_core::emb";
