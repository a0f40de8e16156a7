//! Embedding service with observability.

use std::fmt;
use std::sync::Arc;

use jiff::Timestamp;

use super::{EmbeddingProvider, EmbeddingRequest, EmbeddingResponse, Result};
use crate::{ServiceHealth, TRACING_TARGET_EMB};

/// Embedding service wrapping a shared [`EmbeddingProvider`].
#[derive(Clone)]
pub struct EmbeddingService {
    provider: Arc<dyn EmbeddingProvider>,
}

impl fmt::Debug for EmbeddingService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingService").finish_non_exhaustive()
    }
}

impl EmbeddingService {
    /// Creates a new embedding service from a provider.
    pub fn from_provider<P>(provider: P) -> Self
    where
        P: EmbeddingProvider + 'static,
    {
        Self {
            provider: Arc::new(provider),
        }
    }

    /// Creates a new embedding service from an already shared provider.
    pub fn from_shared(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { provider }
    }

    /// Generates an embedding.
    pub async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse> {
        let started_at = Timestamp::now();

        tracing::debug!(
            target: TRACING_TARGET_EMB,
            request_id = %request.request_id,
            input_len = request.input.len(),
            "Processing embedding request"
        );

        let result = self.provider.embed(request).await;
        let elapsed = Timestamp::now().duration_since(started_at);

        match &result {
            Ok(response) => {
                tracing::debug!(
                    target: TRACING_TARGET_EMB,
                    request_id = %request.request_id,
                    dimensions = response.dimensions(),
                    elapsed_ms = elapsed.as_millis(),
                    "Embedding generation successful"
                );
            }
            Err(error) => {
                tracing::error!(
                    target: TRACING_TARGET_EMB,
                    request_id = %request.request_id,
                    error = %error,
                    elapsed_ms = elapsed.as_millis(),
                    "Embedding generation failed"
                );
            }
        }

        result
    }

    /// Checks provider health.
    pub async fn health_check(&self) -> Result<ServiceHealth> {
        let result = self.provider.health_check().await;
        if let Err(error) = &result {
            tracing::warn!(
                target: TRACING_TARGET_EMB,
                error = %error,
                "Embedding provider health check failed"
            );
        }

        result
    }
}
