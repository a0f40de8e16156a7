use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request to embed a single piece of text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// Unique identifier for this request.
    pub request_id: Uuid,
    /// Text to embed.
    pub input: String,
    /// Model override; providers fall back to their configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl EmbeddingRequest {
    /// Creates a new embedding request.
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::now_v7(),
            input: input.into(),
            model: None,
        }
    }

    /// Sets the model to use.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}
