//! Per-execution context and progress events.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{BlockResult, BlockState};

/// A progress event emitted while a workflow executes.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// A block began. `step` is zero-based.
    BlockStarted {
        step: usize,
        total_steps: usize,
        block_id: Uuid,
        block_name: String,
    },
    /// A block moved to a new state.
    StateChanged { block_name: String, state: BlockState },
    /// The block is waiting for a free invocation slot.
    WaitingForSlot { block_name: String },
    /// A failed attempt will be retried.
    Retrying {
        block_name: String,
        attempt: u32,
        reason: String,
    },
    /// A block finished successfully.
    BlockCompleted {
        step: usize,
        total_steps: usize,
        result: Box<BlockResult>,
    },
    /// A block failed and execution stops.
    BlockFailed {
        step: usize,
        result: Box<BlockResult>,
    },
}

/// State owned by a single execution.
///
/// Nothing in here is shared with other executions; progress leaves the
/// executor only through the optional event channel.
#[derive(Debug)]
pub struct ExecutionContext {
    job_id: Uuid,
    request_text: String,
    custom_instructions: HashMap<String, String>,
    cancel: CancellationToken,
    events: Option<mpsc::UnboundedSender<ExecutionEvent>>,
}

impl ExecutionContext {
    /// Creates a context for running a workflow against `request_text`.
    pub fn new(job_id: Uuid, request_text: impl Into<String>) -> Self {
        Self {
            job_id,
            request_text: request_text.into(),
            custom_instructions: HashMap::new(),
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    /// Adds free-text instructions appended to one block's prompt.
    pub fn with_instructions(mut self, block_name: impl Into<String>, text: impl Into<String>) -> Self {
        self.custom_instructions.insert(block_name.into(), text.into());
        self
    }

    /// Replaces all custom instructions.
    pub fn with_custom_instructions(mut self, instructions: HashMap<String, String>) -> Self {
        self.custom_instructions = instructions;
        self
    }

    /// Uses the given cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Publishes events to the given channel.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn request_text(&self) -> &str {
        &self.request_text
    }

    /// Instructions scoped to the named block.
    pub fn instructions_for(&self, block_name: &str) -> Option<&str> {
        self.custom_instructions
            .get(block_name)
            .map(String::as_str)
            .filter(|text| !text.trim().is_empty())
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn emit(&self, event: ExecutionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}
