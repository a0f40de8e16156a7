//! Ollama client implementation.

use reqwest::{Client as HttpClient, ClientBuilder, Method, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::wire::{EmbedRequest, EmbedResponse, GenerateRequest, GenerateResponse};
use crate::{Error, OllamaConfig, Result, TRACING_TARGET_CLIENT};

/// Ollama client for the generate and embed endpoints.
///
/// Construction does not contact the server; call
/// [`health_check`](Self::health_check) to verify connectivity.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http_client: HttpClient,
    base_url: Url,
    config: OllamaConfig,
}

impl OllamaClient {
    /// Create a new Ollama client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be created.
    pub fn new(config: OllamaConfig) -> Result<Self> {
        config.validate()?;
        let base_url = config.parsed_base_url()?;

        tracing::debug!(
            target: TRACING_TARGET_CLIENT,
            base_url = %base_url,
            timeout_secs = config.timeout_secs,
            "Creating Ollama client"
        );

        let http_client = ClientBuilder::new()
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .user_agent(format!("blockflow-ollama/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http_client,
            base_url,
            config,
        })
    }

    /// Get the client configuration.
    pub fn config(&self) -> &OllamaConfig {
        &self.config
    }

    /// Check that the server answers `GET /api/tags`.
    pub async fn health_check(&self) -> Result<()> {
        tracing::debug!(target: TRACING_TARGET_CLIENT, "Performing health check");

        let response = self.request(Method::GET, "api/tags")?.send().await?;
        Self::check_status(response).await?;

        tracing::debug!(target: TRACING_TARGET_CLIENT, "Health check successful");
        Ok(())
    }

    pub(crate) async fn post_generate(&self, body: &GenerateRequest<'_>) -> Result<GenerateResponse> {
        self.post_json("api/generate", body).await
    }

    pub(crate) async fn post_embed(&self, body: &EmbedRequest<'_>) -> Result<EmbedResponse> {
        self.post_json("api/embed", body).await
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self.request(Method::POST, path)?.json(body).send().await?;
        let response = Self::check_status(response).await?;

        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Decode(e.to_string()))
    }

    async fn check_status(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        tracing::warn!(
            target: TRACING_TARGET_CLIENT,
            status = status.as_u16(),
            message = %message,
            "Ollama request failed"
        );

        Err(Error::api_error(status, message))
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| Error::invalid_config(format!("Invalid request URL: {}", e)))?;

        let request = self.http_client.request(method, url);
        Ok(match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_from_valid_config() {
        let client = OllamaClient::new(OllamaConfig::default()).unwrap();
        assert_eq!(client.base_url.join("api/embed").unwrap().as_str(), "http://localhost:11434/api/embed");
    }

    #[test]
    fn keeps_path_prefix_of_proxied_base_url() {
        let config = OllamaConfig::default().with_base_url("https://proxy.internal/ollama/");
        let client = OllamaClient::new(config).unwrap();
        assert_eq!(
            client.base_url.join("api/generate").unwrap().as_str(),
            "https://proxy.internal/ollama/api/generate"
        );
    }

    #[test]
    fn rejects_invalid_config() {
        let config = OllamaConfig::default().with_base_url("::nope::");
        assert!(matches!(OllamaClient::new(config), Err(Error::Config(_))));
    }
}
