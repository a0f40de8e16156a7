//! Completion request types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sampling parameters forwarded to the model.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Ask the backend to constrain output to JSON.
    #[serde(default)]
    pub json_mode: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

/// A single prompt sent to a completion provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Unique identifier for this request.
    pub request_id: Uuid,
    /// Model name understood by the provider.
    pub model: String,
    /// Fully rendered user prompt.
    pub prompt: String,
    /// Optional system prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub parameters: ModelParameters,
}

impl CompletionRequest {
    /// Creates a new request for the given model and prompt.
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::now_v7(),
            model: model.into(),
            prompt: prompt.into(),
            system_prompt: None,
            parameters: ModelParameters::default(),
        }
    }

    /// Sets the system prompt.
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// Sets the sampling parameters.
    pub fn with_parameters(mut self, parameters: ModelParameters) -> Self {
        self.parameters = parameters;
        self
    }
}
