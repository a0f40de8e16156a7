#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

mod broadcast;
mod catalog;
mod config;
mod error;
mod job;
mod output;
mod progress;
mod service;
mod store;
mod worker;

pub use broadcast::ProgressBroadcaster;
pub use catalog::{Catalog, InMemoryCatalog};
pub use config::WorkerConfig;
pub use error::{JobError, JobResult};
pub use job::{Job, JobStatus, JobType};
pub use output::{AiOutput, AiOutputStore};
pub use progress::JobSnapshot;
pub use service::JobService;
pub use store::JobStore;
pub use worker::WorkerHandles;

/// Tracing target for job lifecycle operations.
pub const TRACING_TARGET: &str = "blockflow_jobs";

/// Tracing target for the worker pool.
pub const TRACING_TARGET_WORKER: &str = "blockflow_jobs::worker";
