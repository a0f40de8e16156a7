//! Completion service with observability.

use std::fmt;
use std::sync::Arc;

use jiff::Timestamp;

use super::{CompletionProvider, CompletionRequest, CompletionResponse, Result};
use crate::{ServiceHealth, TRACING_TARGET_INFERENCE};

/// Completion service wrapping a shared [`CompletionProvider`].
///
/// Cloning is cheap; every clone talks to the same provider.
#[derive(Clone)]
pub struct CompletionService {
    provider: Arc<dyn CompletionProvider>,
}

impl fmt::Debug for CompletionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionService").finish_non_exhaustive()
    }
}

impl CompletionService {
    /// Creates a new completion service from a provider.
    pub fn from_provider<P>(provider: P) -> Self
    where
        P: CompletionProvider + 'static,
    {
        Self {
            provider: Arc::new(provider),
        }
    }

    /// Creates a new completion service from an already shared provider.
    pub fn from_shared(provider: Arc<dyn CompletionProvider>) -> Self {
        Self { provider }
    }

    /// Runs a completion request.
    pub async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let started_at = Timestamp::now();

        tracing::debug!(
            target: TRACING_TARGET_INFERENCE,
            request_id = %request.request_id,
            model = %request.model,
            prompt_len = request.prompt.len(),
            "Processing completion request"
        );

        let result = self.provider.complete(request).await;
        let elapsed = Timestamp::now().duration_since(started_at);

        match &result {
            Ok(response) => {
                tracing::debug!(
                    target: TRACING_TARGET_INFERENCE,
                    request_id = %request.request_id,
                    prompt_tokens = response.usage.prompt_tokens,
                    completion_tokens = response.usage.completion_tokens,
                    elapsed_ms = elapsed.as_millis(),
                    "Completion successful"
                );
            }
            Err(error) => {
                tracing::error!(
                    target: TRACING_TARGET_INFERENCE,
                    request_id = %request.request_id,
                    error = %error,
                    retryable = error.is_retryable(),
                    elapsed_ms = elapsed.as_millis(),
                    "Completion failed"
                );
            }
        }

        result
    }

    /// Checks provider health.
    pub async fn health_check(&self) -> Result<ServiceHealth> {
        tracing::trace!(target: TRACING_TARGET_INFERENCE, "Checking completion provider health");

        let result = self.provider.health_check().await;
        if let Err(error) = &result {
            tracing::warn!(
                target: TRACING_TARGET_INFERENCE,
                error = %error,
                "Completion provider health check failed"
            );
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::mock::{MockCompletionProvider, MockReply};

    #[tokio::test]
    async fn forwards_to_provider() {
        let provider = MockCompletionProvider::new().with_default_reply(MockReply::text("hi"));
        let service = CompletionService::from_provider(provider.clone());

        let response = service
            .complete(&CompletionRequest::new("test", "say hi"))
            .await
            .unwrap();

        assert_eq!(response.content, "hi");
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn surfaces_provider_errors() {
        let provider = MockCompletionProvider::new()
            .with_default_reply(MockReply::error(ErrorKind::RateLimited, "slow down"));
        let service = CompletionService::from_provider(provider);

        let err = service
            .complete(&CompletionRequest::new("test", "anything"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert!(err.is_retryable());
    }
}
