//! Vector store and embedding pipeline error types.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Result type for vector store operations.
pub type VectorResult<T> = Result<T, VectorError>;

/// Vector store and embedding pipeline errors.
///
/// None of these fail the workflow job that triggered the embedding.
#[derive(Debug, Error)]
pub enum VectorError {
    /// The embedding template rendered to nothing usable.
    #[error("embedding template error: {0}")]
    Template(String),

    /// The embedding service returned an error.
    #[error("embedding service error: {0}")]
    Embedding(#[from] blockflow_core::Error),

    /// The embedding service did not answer in time.
    #[error("embedding request timed out after {}s", .0.as_secs_f32())]
    Timeout(Duration),

    /// The task has no completed embedding to search from.
    #[error("no completed embedding for task {0}")]
    NotIndexed(Uuid),

    /// The query cannot be answered.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Backend-specific failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl VectorError {
    /// Creates a template error.
    pub fn template(message: impl Into<String>) -> Self {
        Self::Template(message.into())
    }

    /// Creates an invalid query error.
    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::InvalidQuery(message.into())
    }

    /// Returns true if retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Embedding(source) => source.is_retryable(),
            Self::Timeout(_) => true,
            _ => false,
        }
    }
}
