//! Job progress snapshots.

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{Job, JobStatus, JobType};

/// Point-in-time progress of a job.
///
/// Polling and streaming consumers receive the same shape, always built by
/// [`JobSnapshot::of`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub task_id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    /// 0..=100; exactly 100 only when completed.
    pub percentage: u8,
    /// Jobs of the same type queued ahead of this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_number: Option<usize>,
    pub total_steps: usize,
    pub retry_count: u32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    /// Known once at least one step has completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_ms: Option<u64>,
    pub revision: u64,
}

impl JobSnapshot {
    /// Builds the snapshot of `job` as of `now`.
    pub fn of(job: &Job, queue_position: Option<usize>, now: Timestamp) -> Self {
        let elapsed_ms = job.started_at.map(|started| {
            let until = job.completed_at.unwrap_or(now);
            millis_between(started, until)
        });

        let remaining_steps = job.total_steps.saturating_sub(job.completed_steps);
        let estimated_remaining_ms = match (job.status, elapsed_ms) {
            (JobStatus::Running, Some(elapsed)) if job.completed_steps > 0 => {
                let per_step = elapsed / job.completed_steps as u64;
                Some(per_step.saturating_mul(remaining_steps as u64))
            }
            _ => None,
        };

        Self {
            job_id: job.id,
            task_id: job.task_id,
            job_type: job.job_type,
            status: job.status,
            percentage: percentage(job.completed_steps, job.total_steps, job.status),
            queue_position,
            current_step: job.current_step.clone(),
            step_number: job.step_number,
            total_steps: job.total_steps,
            retry_count: job.retry_count,
            message: job.message.clone(),
            error: job.error.clone(),
            elapsed_ms,
            estimated_remaining_ms,
            revision: job.revision,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Completed share of the steps, held below 100 until the job completes.
pub(crate) fn percentage(completed_steps: usize, total_steps: usize, status: JobStatus) -> u8 {
    if status == JobStatus::Completed {
        return 100;
    }
    if total_steps == 0 {
        return 0;
    }

    let share = completed_steps.min(total_steps) * 100 / total_steps;
    u8::try_from(share.min(99)).unwrap_or(99)
}

fn millis_between(start: Timestamp, end: Timestamp) -> u64 {
    let elapsed = end.duration_since(start);
    if elapsed.is_negative() {
        return 0;
    }
    u64::try_from(elapsed.unsigned_abs().as_millis()).unwrap_or(u64::MAX)
}
