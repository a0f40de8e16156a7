//! Ollama client configuration.

use std::time::Duration;

#[cfg(feature = "config")]
use clap::Args;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// Configuration for the Ollama client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "config", derive(Args))]
pub struct OllamaConfig {
    /// Base URL of the Ollama server
    #[cfg_attr(
        feature = "config",
        arg(
            long = "ollama-url",
            env = "OLLAMA_URL",
            default_value = "http://localhost:11434"
        )
    )]
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Request timeout in seconds
    #[cfg_attr(
        feature = "config",
        arg(long = "ollama-timeout-secs", env = "OLLAMA_TIMEOUT_SECS", default_value_t = default_timeout_secs())
    )]
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Connection timeout in seconds
    #[cfg_attr(
        feature = "config",
        arg(long = "ollama-connect-timeout-secs", env = "OLLAMA_CONNECT_TIMEOUT_SECS", default_value_t = default_connect_timeout_secs())
    )]
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Model used for embeddings when a request does not name one
    #[cfg_attr(
        feature = "config",
        arg(
            long = "ollama-embedding-model",
            env = "OLLAMA_EMBEDDING_MODEL",
            default_value = "nomic-embed-text"
        )
    )]
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Bearer token for proxied deployments
    #[cfg_attr(
        feature = "config",
        arg(long = "ollama-api-key", env = "OLLAMA_API_KEY", hide_env_values = true)
    )]
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            embedding_model: default_embedding_model(),
            api_key: None,
        }
    }
}

impl OllamaConfig {
    /// Set the base URL.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    /// Set the default embedding model.
    #[must_use]
    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    /// Set the bearer token.
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Request timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Connection timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Parses and validates the base URL.
    pub fn parsed_base_url(&self) -> Result<Url> {
        let url: Url = self
            .base_url
            .parse()
            .map_err(|e| Error::invalid_config(format!("Invalid base URL '{}': {}", self.base_url, e)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::invalid_config(format!(
                "Unsupported URL scheme '{}'",
                url.scheme()
            )));
        }

        Ok(url)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(Error::invalid_config("Timeout must be greater than 0"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(Error::invalid_config("Connect timeout must be greater than 0"));
        }
        if self.embedding_model.trim().is_empty() {
            return Err(Error::invalid_config("Embedding model must not be empty"));
        }
        self.parsed_base_url().map(|_| ())
    }
}
