//! Workflow error types.

use std::time::Duration;

use thiserror::Error;

/// Result type for workflow operations.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Errors that can occur while defining or executing a workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Workflow definition is invalid.
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    /// Attempted to remove or rewrite a CORE block.
    #[error("block '{block}' is a core block and cannot be removed")]
    ImmutableBlock {
        /// Name of the protected block.
        block: String,
    },

    /// Block output did not satisfy its schema.
    #[error("block '{block}' failed validation: {message}")]
    Validation {
        /// Name of the failing block.
        block: String,
        /// Validation error message.
        message: String,
    },

    /// The inference service returned an error.
    #[error("block '{block}' invocation failed: {source}")]
    Invocation {
        /// Name of the failing block.
        block: String,
        /// Provider error.
        #[source]
        source: blockflow_core::Error,
    },

    /// The inference service did not answer in time.
    #[error("block '{block}' invocation timed out after {}s", .timeout.as_secs_f32())]
    InvocationTimeout {
        /// Name of the failing block.
        block: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// Execution was cancelled.
    #[error(
        "execution cancelled{}",
        .block.as_ref().map(|b| format!(" during block '{b}'")).unwrap_or_default()
    )]
    Cancelled {
        /// Block that was running when cancellation arrived, if any.
        block: Option<String>,
    },

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl WorkflowError {
    /// Returns true if the failure may go away when the same block is invoked again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Invocation { source, .. } => source.is_retryable(),
            Self::InvocationTimeout { .. } => true,
            _ => false,
        }
    }

    /// Returns true if the error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Name of the block the error originated in, if any.
    pub fn block_name(&self) -> Option<&str> {
        match self {
            Self::ImmutableBlock { block }
            | Self::Validation { block, .. }
            | Self::Invocation { block, .. }
            | Self::InvocationTimeout { block, .. } => Some(block),
            Self::Cancelled { block } => block.as_deref(),
            Self::InvalidDefinition(_) | Self::Internal(_) => None,
        }
    }
}
