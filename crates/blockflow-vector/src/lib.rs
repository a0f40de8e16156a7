#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

mod error;
mod memory;
mod pipeline;
mod record;
mod search;
mod store;

pub use error::{VectorError, VectorResult};
pub use memory::MemoryBackend;
pub use pipeline::{EmbeddingPipeline, QueryTarget};
pub use record::{EmbeddingRecord, EmbeddingStatus, content_hash};
pub use search::{SearchFilter, SearchHit, SearchOptions};
pub use store::{VectorStore, VectorStoreBackend};

/// Tracing target for vector store operations.
pub const TRACING_TARGET: &str = "blockflow_vector";

/// Tracing target for the embedding pipeline.
pub const TRACING_TARGET_PIPELINE: &str = "blockflow_vector::pipeline";
