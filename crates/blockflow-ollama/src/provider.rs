//! Provider trait implementations.

use blockflow_core::emb::{EmbeddingProvider, EmbeddingRequest, EmbeddingResponse};
use blockflow_core::inference::{
    CompletionProvider, CompletionRequest, CompletionResponse, TokenUsage,
};
use blockflow_core::{ServiceHealth, Result};
use jiff::Timestamp;

use crate::wire::{EmbedRequest, GenerateRequest};
use crate::{Error, OllamaClient};

#[async_trait::async_trait]
impl CompletionProvider for OllamaClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let response = self.post_generate(&GenerateRequest::from(request)).await?;

        let usage = TokenUsage::new(
            response.prompt_eval_count.unwrap_or_default(),
            response.eval_count.unwrap_or_default(),
        );
        let model = response.model.unwrap_or_else(|| request.model.clone());

        Ok(CompletionResponse::new(request.request_id, model, response.response).with_usage(usage))
    }

    async fn health_check(&self) -> Result<ServiceHealth> {
        probe(self).await
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for OllamaClient {
    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse> {
        let model = request
            .model
            .as_deref()
            .unwrap_or(&self.config().embedding_model);

        let body = EmbedRequest {
            model,
            input: &request.input,
        };
        let response = self.post_embed(&body).await?;

        let embedding = response
            .embeddings
            .into_iter()
            .next()
            .filter(|vector| !vector.is_empty())
            .ok_or_else(|| Error::Decode("embedding response contained no vectors".into()))?;

        let model = response.model.unwrap_or_else(|| model.to_string());
        Ok(EmbeddingResponse::new(request.request_id, model, embedding))
    }

    async fn health_check(&self) -> Result<ServiceHealth> {
        probe(self).await
    }
}

async fn probe(client: &OllamaClient) -> Result<ServiceHealth> {
    let started_at = Timestamp::now();
    let outcome = OllamaClient::health_check(client).await;
    let elapsed = Timestamp::now().duration_since(started_at).unsigned_abs();

    Ok(match outcome {
        Ok(()) => ServiceHealth::healthy().with_response_time(elapsed),
        Err(error) => ServiceHealth::unhealthy(error.to_string()).with_response_time(elapsed),
    })
}
