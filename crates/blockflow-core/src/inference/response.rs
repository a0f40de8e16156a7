//! Completion response types.

use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Token counts reported by the backend.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    /// Creates a new usage record.
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    /// Total tokens consumed.
    pub fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

impl Add for TokenUsage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            prompt_tokens: self.prompt_tokens.saturating_add(rhs.prompt_tokens),
            completion_tokens: self.completion_tokens.saturating_add(rhs.completion_tokens),
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Model output for a [`CompletionRequest`](super::CompletionRequest).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Identifier of the request this answers.
    pub request_id: Uuid,
    /// Raw text produced by the model.
    pub content: String,
    #[serde(default)]
    pub usage: TokenUsage,
    /// Model that produced the output, as reported by the backend.
    pub model: String,
}

impl CompletionResponse {
    /// Creates a response for the given request.
    pub fn new(request_id: Uuid, model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            request_id,
            content: content.into(),
            usage: TokenUsage::default(),
            model: model.into(),
        }
    }

    /// Sets the token usage.
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}
