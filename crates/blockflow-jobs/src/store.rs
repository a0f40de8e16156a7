//! In-memory job store.

use std::collections::HashMap;

use blockflow_runtime::engine::BlockResult;
use jiff::Timestamp;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::TRACING_TARGET;
use crate::error::{JobError, JobResult};
use crate::job::{Job, JobStatus};

/// Holds every job and performs all state transitions.
///
/// Each transition runs under one write lock, so readers never observe a
/// half-applied change and terminal jobs stay untouched.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a queued job unless the task already has an active job of
    /// the same type.
    pub async fn insert(&self, job: Job) -> JobResult<Job> {
        let mut jobs = self.jobs.write().await;

        if let Some(active) = jobs.values().find(|other| {
            other.task_id == job.task_id && other.job_type == job.job_type && other.status.is_active()
        }) {
            return Err(JobError::AlreadyActive {
                task_id: job.task_id,
                job_type: job.job_type,
                active: active.id,
            });
        }

        tracing::debug!(
            target: TRACING_TARGET,
            job_id = %job.id,
            task_id = %job.task_id,
            job_type = %job.job_type,
            "Job queued"
        );

        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    /// Returns a job with its `superseded_by` link filled in.
    pub async fn get(&self, job_id: Uuid) -> JobResult<Job> {
        let jobs = self.jobs.read().await;
        let mut job = jobs.get(&job_id).cloned().ok_or(JobError::NotFound(job_id))?;
        job.superseded_by = superseded_by(&jobs, job_id);
        Ok(job)
    }

    /// All jobs of a task, oldest first.
    pub async fn for_task(&self, task_id: Uuid) -> Vec<Job> {
        let jobs = self.jobs.read().await;
        let mut found: Vec<Job> = jobs
            .values()
            .filter(|job| job.task_id == task_id)
            .cloned()
            .map(|mut job| {
                job.superseded_by = superseded_by(&jobs, job.id);
                job
            })
            .collect();
        found.sort_by_key(Job::queue_key);
        found
    }

    /// Number of queued jobs of the same type created before `job`.
    ///
    /// `None` unless the job itself is queued.
    pub async fn queue_position(&self, job: &Job) -> Option<usize> {
        if job.status != JobStatus::Queued {
            return None;
        }

        let key = job.queue_key();
        let jobs = self.jobs.read().await;
        let ahead = jobs
            .values()
            .filter(|other| {
                other.status == JobStatus::Queued
                    && other.job_type == job.job_type
                    && other.queue_key() < key
            })
            .count();
        Some(ahead)
    }

    /// Moves a queued job to running.
    pub async fn start(&self, job_id: Uuid) -> JobResult<Job> {
        self.transition(job_id, |job| {
            match job.status {
                JobStatus::Queued => {}
                status if status.is_terminal() => {
                    return Err(JobError::Terminal { job_id, status });
                }
                from => {
                    return Err(JobError::InvalidTransition {
                        job_id,
                        from,
                        to: JobStatus::Running,
                    });
                }
            }
            job.status = JobStatus::Running;
            job.started_at = Some(Timestamp::now());
            job.message = "Started".into();
            Ok(())
        })
        .await
    }

    /// Applies a progress update to a running job.
    pub async fn update<F>(&self, job_id: Uuid, apply: F) -> JobResult<Job>
    where
        F: FnOnce(&mut Job),
    {
        self.transition(job_id, |job| {
            if job.status != JobStatus::Running {
                return Err(JobError::InvalidTransition {
                    job_id,
                    from: job.status,
                    to: JobStatus::Running,
                });
            }
            apply(job);
            Ok(())
        })
        .await
    }

    /// Marks a running job completed.
    pub async fn complete(&self, job_id: Uuid, results: Vec<BlockResult>, retries: u32) -> JobResult<Job> {
        self.transition(job_id, |job| {
            if job.status != JobStatus::Running {
                return Err(JobError::InvalidTransition {
                    job_id,
                    from: job.status,
                    to: JobStatus::Completed,
                });
            }
            job.status = JobStatus::Completed;
            job.completed_steps = job.total_steps;
            job.current_step = None;
            job.step_number = None;
            job.retry_count = job.retry_count.max(retries);
            job.message = "Completed".into();
            job.results = results;
            job.completed_at = Some(Timestamp::now());
            Ok(())
        })
        .await
    }

    /// Marks a queued or running job failed.
    pub async fn fail(
        &self,
        job_id: Uuid,
        error: impl Into<String>,
        failed_block: Option<String>,
        results: Option<Vec<BlockResult>>,
        retries: u32,
    ) -> JobResult<Job> {
        let error = error.into();
        self.transition(job_id, |job| {
            if job.status.is_terminal() {
                return Err(JobError::Terminal {
                    job_id,
                    status: job.status,
                });
            }
            job.status = JobStatus::Failed;
            job.retry_count = job.retry_count.max(retries);
            job.message = match &failed_block {
                Some(block) => format!("Failed at block '{block}'"),
                None => "Failed".into(),
            };
            job.error = Some(error);
            job.failed_block = failed_block;
            if let Some(results) = results {
                job.results = results;
            }
            job.completed_at = Some(Timestamp::now());
            Ok(())
        })
        .await
    }

    /// Fails the job only if it is still queued.
    ///
    /// Returns `None` when the job has already left the queue.
    pub async fn fail_if_queued(&self, job_id: Uuid, error: impl Into<String>) -> JobResult<Option<Job>> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&job_id).ok_or(JobError::NotFound(job_id))?;
        if job.status != JobStatus::Queued {
            return Ok(None);
        }

        job.status = JobStatus::Failed;
        job.error = Some(error.into());
        job.message = "Cancelled before start".into();
        job.completed_at = Some(Timestamp::now());
        job.revision += 1;
        Ok(Some(job.clone()))
    }

    async fn transition<F>(&self, job_id: Uuid, apply: F) -> JobResult<Job>
    where
        F: FnOnce(&mut Job) -> JobResult<()>,
    {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&job_id).ok_or(JobError::NotFound(job_id))?;
        apply(job)?;
        job.revision += 1;
        Ok(job.clone())
    }
}

fn superseded_by(jobs: &HashMap<Uuid, Job>, job_id: Uuid) -> Option<Uuid> {
    jobs.values()
        .filter(|other| other.supersedes == Some(job_id))
        .map(|other| other.id)
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobType;

    fn workflow_job(task_id: Uuid) -> Job {
        Job::new(task_id, Uuid::nil(), JobType::Workflow, 2)
    }

    #[tokio::test]
    async fn one_active_job_per_task_and_type() {
        let store = JobStore::new();
        let task_id = Uuid::now_v7();
        let first = store.insert(workflow_job(task_id)).await.unwrap();

        let error = store.insert(workflow_job(task_id)).await.unwrap_err();
        assert!(matches!(error, JobError::AlreadyActive { active, .. } if active == first.id));

        store
            .insert(Job::new(task_id, Uuid::nil(), JobType::Embedding, 1))
            .await
            .unwrap();

        store.start(first.id).await.unwrap();
        store.complete(first.id, Vec::new(), 0).await.unwrap();
        store.insert(workflow_job(task_id)).await.unwrap();
    }

    #[tokio::test]
    async fn queue_positions_follow_creation_order() {
        let store = JobStore::new();
        let a = store.insert(workflow_job(Uuid::now_v7())).await.unwrap();
        let b = store.insert(workflow_job(Uuid::now_v7())).await.unwrap();
        let c = store.insert(workflow_job(Uuid::now_v7())).await.unwrap();
        let other_type = store
            .insert(Job::new(Uuid::now_v7(), Uuid::nil(), JobType::Embedding, 1))
            .await
            .unwrap();

        assert_eq!(store.queue_position(&a).await, Some(0));
        assert_eq!(store.queue_position(&b).await, Some(1));
        assert_eq!(store.queue_position(&c).await, Some(2));
        assert_eq!(store.queue_position(&other_type).await, Some(0));

        store.fail_if_queued(a.id, "cancelled").await.unwrap();
        let started = store.start(b.id).await.unwrap();
        assert_eq!(store.queue_position(&started).await, None);
        assert_eq!(store.queue_position(&c).await, Some(0));
    }

    #[tokio::test]
    async fn terminal_jobs_reject_transitions() {
        let store = JobStore::new();
        let job = store.insert(workflow_job(Uuid::now_v7())).await.unwrap();
        store.start(job.id).await.unwrap();
        let failed = store
            .fail(job.id, "boom", Some("A".into()), None, 2)
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.retry_count, 2);
        assert_eq!(failed.failed_block.as_deref(), Some("A"));

        assert!(matches!(
            store.start(job.id).await,
            Err(JobError::Terminal { .. })
        ));
        assert!(store.complete(job.id, Vec::new(), 0).await.is_err());
        assert!(store.update(job.id, |j| j.completed_steps = 1).await.is_err());
        assert_eq!(store.fail_if_queued(job.id, "late").await.unwrap(), None);
        assert_eq!(store.get(job.id).await.unwrap(), failed);
    }

    #[tokio::test]
    async fn revisions_increase_with_every_change() {
        let store = JobStore::new();
        let job = store.insert(workflow_job(Uuid::now_v7())).await.unwrap();
        let started = store.start(job.id).await.unwrap();
        let updated = store.update(job.id, |j| j.completed_steps = 1).await.unwrap();
        let done = store.complete(job.id, Vec::new(), 0).await.unwrap();

        assert!(job.revision < started.revision);
        assert!(started.revision < updated.revision);
        assert!(updated.revision < done.revision);
        assert_eq!(done.completed_steps, 2);
    }

    #[tokio::test]
    async fn rerun_link_is_derived_on_read() {
        let store = JobStore::new();
        let task_id = Uuid::now_v7();
        let original = store.insert(workflow_job(task_id)).await.unwrap();
        store.start(original.id).await.unwrap();
        store.fail(original.id, "boom", None, None, 0).await.unwrap();

        let rerun = store.insert(original.rerun()).await.unwrap();

        let reloaded = store.get(original.id).await.unwrap();
        assert_eq!(reloaded.superseded_by, Some(rerun.id));
        let history = store.for_task(task_id).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, original.id);
        assert_eq!(history[1].supersedes, Some(original.id));
    }
}
