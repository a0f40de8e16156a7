//! AI service provider configuration.

use anyhow::Context;
use blockflow_core::emb::EmbeddingService;
use blockflow_core::inference::CompletionService;
use blockflow_core::{AiServices, ServiceStatus};
use blockflow_ollama::OllamaClient;

use super::{Cli, ProviderKind};
use crate::TRACING_TARGET_STARTUP;

/// Creates the completion and embedding services selected on the command line.
///
/// # Errors
///
/// Returns an error if the Ollama client cannot be initialized.
pub fn create_ai_services(cli: &Cli) -> anyhow::Result<AiServices> {
    match cli.provider {
        ProviderKind::Ollama => {
            let client =
                OllamaClient::new(cli.ollama.clone()).context("failed to create Ollama client")?;
            Ok(AiServices::new(
                CompletionService::from_provider(client.clone()),
                EmbeddingService::from_provider(client),
            ))
        }
        #[cfg(feature = "mock")]
        ProviderKind::Mock => {
            use blockflow_core::mock::{
                MockCompletionProvider, MockEmbeddingProvider, MockReply, mock_services,
            };

            let completion = MockCompletionProvider::new()
                .with_default_reply(MockReply::text(cli.mock.mock_reply.clone()));
            let embedding = MockEmbeddingProvider::new(cli.mock.mock_embedding_dimensions);
            Ok(mock_services(completion, embedding))
        }
    }
}

/// Logs the health of both providers. Failures are reported, not fatal.
pub async fn check_health(services: &AiServices) {
    let (completion, embedding) = tokio::join!(
        services.completion.health_check(),
        services.embedding.health_check(),
    );

    for (service, result) in [("completion", completion), ("embedding", embedding)] {
        match result {
            Ok(health) if health.status == ServiceStatus::Healthy => {
                tracing::info!(
                    target: TRACING_TARGET_STARTUP,
                    service,
                    response_ms = health.response.map(|d| d.as_millis() as u64),
                    "Provider is healthy"
                );
            }
            Ok(health) => {
                tracing::warn!(
                    target: TRACING_TARGET_STARTUP,
                    service,
                    status = ?health.status,
                    message = health.message.as_deref().unwrap_or_default(),
                    "Provider reports reduced health"
                );
            }
            Err(error) => {
                tracing::warn!(
                    target: TRACING_TARGET_STARTUP,
                    service,
                    error = %error,
                    "Provider health check failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[cfg(feature = "mock")]
    #[tokio::test]
    async fn mock_provider_answers_with_configured_reply() {
        let cli = Cli::try_parse_from([
            "blockflow",
            "--workflow",
            "w.json",
            "--tasks",
            "t.json",
            "--provider",
            "mock",
            "--mock-reply",
            r#"{"label":"billing"}"#,
            "--mock-embedding-dimensions",
            "16",
        ])
        .unwrap();

        let services = create_ai_services(&cli).unwrap();
        let request = blockflow_core::inference::CompletionRequest::new("any", "hello");
        let response = services.completion.complete(&request).await.unwrap();
        assert_eq!(response.content, r#"{"label":"billing"}"#);

        let request = blockflow_core::emb::EmbeddingRequest::new("hello");
        assert_eq!(services.embedding.embed(&request).await.unwrap().embedding.len(), 16);
    }

    #[test]
    fn ollama_provider_rejects_bad_url() {
        let cli = Cli::try_parse_from([
            "blockflow",
            "--workflow",
            "w.json",
            "--tasks",
            "t.json",
            "--ollama-url",
            "ftp://localhost",
        ])
        .unwrap();
        assert!(create_ai_services(&cli).is_err());
    }
}
