//! Workflow execution engine.
//!
//! - [`Engine`]: runs a workflow's blocks in order against one request text
//! - [`EngineConfig`]: concurrency, timeout and retry settings
//! - [`ExecutionContext`]: per-execution state, cancellation and event sink
//! - [`ExecutionReport`]: block results plus the final bindings or error

mod config;
mod context;
mod executor;
mod result;

pub use config::{EngineConfig, EngineConfigBuilder};
pub use context::{ExecutionContext, ExecutionEvent};
pub use executor::Engine;
pub use result::{BlockResult, BlockState, ExecutionReport};
