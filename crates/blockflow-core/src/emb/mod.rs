//! Embedding abstractions.
//!
//! An [`EmbeddingProvider`] maps a piece of text to a dense vector. The
//! [`EmbeddingService`] wraps it with structured logging.

mod request;
mod response;
mod service;

pub use request::EmbeddingRequest;
pub use response::{EmbeddingResponse, cosine_similarity};
pub use service::EmbeddingService;

use crate::ServiceHealth;
pub use crate::{Error, Result};

/// Trait for embedding backends.
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generates one embedding for the request input.
    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse>;

    /// Reports whether the backend is reachable.
    async fn health_check(&self) -> Result<ServiceHealth>;
}
