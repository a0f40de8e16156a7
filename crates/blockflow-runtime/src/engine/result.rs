//! Per-block and per-execution results.

use blockflow_core::inference::TokenUsage;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display};
use uuid::Uuid;

use crate::template::{Bindings, RenderWarning};
use crate::{WorkflowError, WorkflowResult};

/// Lifecycle of a single block within one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Serialize, Deserialize, AsRefStr, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockState {
    Pending,
    Rendering,
    Invoking,
    Validating,
    Done,
    Failed,
}

impl BlockState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Record of one block's execution. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockResult {
    pub block_id: Uuid,
    pub block_name: String,
    pub order: u32,
    /// `Done` or `Failed`.
    pub status: BlockState,
    pub model: String,
    /// Prompt as sent, including any custom instructions.
    pub rendered_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendered_system_prompt: Option<String>,
    /// Raw text of the last model response, if any arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
    /// Structured output when validation passed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<RenderWarning>,
    /// Model invocations made for this block.
    pub attempts: u32,
    /// Wall time spent on the block, including retries.
    pub latency_ms: u64,
    /// Tokens consumed across all attempts.
    pub usage: TokenUsage,
    pub started_at: Timestamp,
    pub completed_at: Timestamp,
}

impl BlockResult {
    pub fn is_done(&self) -> bool {
        self.status == BlockState::Done
    }
}

/// Everything produced by one [`Engine::execute`](super::Engine::execute) call.
#[derive(Debug)]
pub struct ExecutionReport {
    /// One result per attempted block, in execution order. On failure the
    /// last entry is the failed block.
    pub results: Vec<BlockResult>,
    /// Retries performed (transient and validation).
    pub retries: u32,
    /// Final bindings on success, or the error that stopped execution.
    pub outcome: WorkflowResult<Bindings>,
}

impl ExecutionReport {
    pub(crate) fn failed(results: Vec<BlockResult>, retries: u32, error: WorkflowError) -> Self {
        Self {
            results,
            retries,
            outcome: Err(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Returns the error, if execution failed.
    pub fn error(&self) -> Option<&WorkflowError> {
        self.outcome.as_ref().err()
    }

    /// Total tokens consumed by all blocks.
    pub fn usage(&self) -> TokenUsage {
        self.results
            .iter()
            .fold(TokenUsage::default(), |acc, r| acc + r.usage)
    }
}
