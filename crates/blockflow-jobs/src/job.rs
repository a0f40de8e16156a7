//! Job records.

use std::collections::HashMap;

use blockflow_runtime::engine::BlockResult;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Lifecycle state of a job.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Serialize, Deserialize, AsRefStr, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Queued or running.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// What a job executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Serialize, Deserialize, AsRefStr, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    /// All blocks of a workflow.
    Workflow,
    /// The post-completion embedding step.
    Embedding,
}

/// One execution attempt against a task.
///
/// Terminal jobs are never modified; a rerun creates a new job that records
/// the job it supersedes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    /// Name of the block (or step) currently running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// One-based number of the current step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_number: Option<usize>,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub retry_count: u32,
    /// Latest human-readable progress message.
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Block at which a workflow job failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_block: Option<String>,
    /// Free-text instructions keyed by block name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom_instructions: HashMap<String, String>,
    /// Block results produced so far, including a failed one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<BlockResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<Uuid>,
    /// Filled in on read from the job that supersedes this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<Uuid>,
    /// Bumped on every change; orders snapshots of the same job.
    pub revision: u64,
    pub created_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
}

impl Job {
    /// Creates a queued job.
    pub fn new(task_id: Uuid, workflow_id: Uuid, job_type: JobType, total_steps: usize) -> Self {
        Self {
            id: Uuid::now_v7(),
            task_id,
            workflow_id,
            job_type,
            status: JobStatus::Queued,
            current_step: None,
            step_number: None,
            completed_steps: 0,
            total_steps,
            retry_count: 0,
            message: "Queued".into(),
            error: None,
            failed_block: None,
            custom_instructions: HashMap::new(),
            results: Vec::new(),
            supersedes: None,
            superseded_by: None,
            revision: 0,
            created_at: Timestamp::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_custom_instructions(mut self, instructions: HashMap<String, String>) -> Self {
        self.custom_instructions = instructions;
        self
    }

    /// Creates the queued job that reruns this one.
    pub fn rerun(&self) -> Self {
        let mut job = Self::new(self.task_id, self.workflow_id, self.job_type, self.total_steps)
            .with_custom_instructions(self.custom_instructions.clone());
        job.supersedes = Some(self.id);
        job
    }

    /// Queue ordering key: creation time, then the time-ordered id.
    pub(crate) fn queue_key(&self) -> (Timestamp, Uuid) {
        (self.created_at, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(JobStatus::Queued.is_active());
        assert!(JobStatus::Running.is_active());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Failed.is_active());
    }

    #[test]
    fn rerun_copies_inputs_and_links_back() {
        let instructions = HashMap::from([("A".to_string(), "be brief".to_string())]);
        let original = Job::new(Uuid::now_v7(), Uuid::now_v7(), JobType::Workflow, 3)
            .with_custom_instructions(instructions.clone());

        let rerun = original.rerun();
        assert_ne!(rerun.id, original.id);
        assert_eq!(rerun.task_id, original.task_id);
        assert_eq!(rerun.total_steps, 3);
        assert_eq!(rerun.custom_instructions, instructions);
        assert_eq!(rerun.supersedes, Some(original.id));
        assert_eq!(rerun.status, JobStatus::Queued);
    }

    #[test]
    fn serializes_enums_in_screaming_snake_case() {
        assert_eq!(serde_json::to_string(&JobType::Embedding).unwrap(), "\"EMBEDDING\"");
        assert_eq!(JobStatus::Running.to_string(), "RUNNING");
    }
}
