//! Job error types.

use blockflow_runtime::WorkflowError;
use blockflow_vector::VectorError;
use thiserror::Error;
use uuid::Uuid;

use crate::job::{JobStatus, JobType};

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Errors returned by the job subsystem.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("task {0} not found")]
    TaskNotFound(Uuid),

    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    /// The task already has a queued or running job of this type.
    #[error("task {task_id} already has an active {job_type} job ({active})")]
    AlreadyActive {
        task_id: Uuid,
        job_type: JobType,
        active: Uuid,
    },

    /// The job reached a terminal state and cannot change any more.
    #[error("job {job_id} is already {status}")]
    Terminal { job_id: Uuid, status: JobStatus },

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    /// The task has never completed a workflow run.
    #[error("task {0} has no AI output")]
    NoOutput(Uuid),

    #[error("embedding is disabled for workflow {0}")]
    EmbeddingDisabled(Uuid),

    #[error("workers are already running")]
    WorkersRunning,

    #[error("job queue is closed")]
    QueueClosed,

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl JobError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if the error refers to something that does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::TaskNotFound(_) | Self::WorkflowNotFound(_) | Self::NoOutput(_)
        )
    }
}
