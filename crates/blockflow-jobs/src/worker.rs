//! Worker pool executing queued jobs.

use std::sync::Arc;

use blockflow_core::Task;
use blockflow_runtime::WorkflowError;
use blockflow_runtime::engine::{ExecutionContext, ExecutionEvent};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::TRACING_TARGET_WORKER;
use crate::error::{JobError, JobResult};
use crate::job::{Job, JobType};
use crate::service::Shared;

/// Name of the single step of an embedding job.
const EMBEDDING_STEP: &str = "embedding";

/// Handles for the background worker pool.
///
/// Dropping the handles leaves the workers running; call
/// [`shutdown`](Self::shutdown) or [`abort_all`](Self::abort_all) first.
pub struct WorkerHandles {
    dispatcher: JoinHandle<()>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    jobs: CancellationToken,
}

impl WorkerHandles {
    /// Spawns the dispatcher that feeds queued jobs to worker tasks.
    pub(crate) fn spawn(shared: Arc<Shared>) -> JobResult<Self> {
        let receiver = shared.take_receiver().ok_or(JobError::WorkersRunning)?;
        let shutdown = CancellationToken::new();
        let jobs = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracing::info!(
            target: TRACING_TARGET_WORKER,
            max_running_jobs = shared.config.max_running_jobs,
            "Starting job workers"
        );

        let dispatcher = Dispatcher {
            semaphore: shared.config.create_semaphore(),
            shared,
            receiver,
            shutdown: shutdown.clone(),
            jobs: jobs.clone(),
            tracker: tracker.clone(),
        };

        Ok(Self {
            dispatcher: tokio::spawn(dispatcher.run()),
            tracker,
            shutdown,
            jobs,
        })
    }

    /// Stops taking jobs from the queue.
    ///
    /// Running jobs finish normally; queued jobs stay queued.
    pub fn shutdown(&self) {
        tracing::info!(
            target: TRACING_TARGET_WORKER,
            in_flight = self.tracker.len(),
            "Initiating graceful shutdown of job workers"
        );
        self.shutdown.cancel();
    }

    /// Stops taking jobs and cancels every running job.
    ///
    /// Cancelled jobs end `FAILED` with a cancellation error.
    pub fn abort_all(&self) {
        tracing::warn!(
            target: TRACING_TARGET_WORKER,
            in_flight = self.tracker.len(),
            "Cancelling all running jobs"
        );
        self.shutdown.cancel();
        self.jobs.cancel();
    }

    /// Returns true while the dispatcher is taking jobs.
    pub fn is_running(&self) -> bool {
        !self.dispatcher.is_finished()
    }

    /// Number of jobs currently executing.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Waits for the dispatcher and every job it started.
    pub async fn wait_all(self) -> JobResult<()> {
        self.dispatcher
            .await
            .map_err(|e| JobError::internal(format!("job dispatcher panicked: {e}")))?;
        self.tracker.close();
        self.tracker.wait().await;
        Ok(())
    }
}

impl std::fmt::Debug for WorkerHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandles")
            .field("running", &self.is_running())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

struct Dispatcher {
    shared: Arc<Shared>,
    receiver: mpsc::UnboundedReceiver<Uuid>,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
    jobs: CancellationToken,
    tracker: TaskTracker,
}

impl Dispatcher {
    async fn run(mut self) {
        loop {
            // A slot is taken before dequeuing so no job leaves the queue
            // without a worker to run it.
            let permit = tokio::select! {
                biased;

                () = self.shutdown.cancelled() => break,

                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::error!(
                            target: TRACING_TARGET_WORKER,
                            "Semaphore closed, stopping workers"
                        );
                        break;
                    }
                },
            };

            let job_id = tokio::select! {
                biased;

                () = self.shutdown.cancelled() => break,

                next = self.receiver.recv() => match next {
                    Some(job_id) => job_id,
                    None => break,
                },
            };

            let cancel = self.jobs.child_token();
            self.shared.register(job_id, cancel.clone());

            let job = match self.shared.jobs.start(job_id).await {
                Ok(job) => job,
                Err(error) => {
                    self.shared.unregister(job_id);
                    tracing::debug!(
                        target: TRACING_TARGET_WORKER,
                        job_id = %job_id,
                        reason = %error,
                        "Skipping job that is no longer queued"
                    );
                    continue;
                }
            };
            self.shared.publish(&job).await;

            let shared = self.shared.clone();
            self.tracker.spawn(async move {
                // Hold the slot until the job is finished.
                let _permit = permit;
                shared.run_job(job, cancel).await;
                shared.unregister(job_id);
            });
        }

        tracing::info!(
            target: TRACING_TARGET_WORKER,
            "Shutdown requested, stopping job workers"
        );
        self.tracker.close();
        self.shared.return_receiver(self.receiver);
    }
}

impl Shared {
    /// Runs one job to a terminal state. Never returns an error.
    async fn run_job(&self, job: Job, cancel: CancellationToken) {
        tracing::info!(
            target: TRACING_TARGET_WORKER,
            job_id = %job.id,
            task_id = %job.task_id,
            job_type = %job.job_type,
            "Processing job"
        );

        let outcome = match job.job_type {
            JobType::Workflow => self.run_workflow(&job, cancel).await,
            JobType::Embedding => self.run_embedding(&job, cancel).await,
        };

        if let Err(error) = outcome {
            tracing::error!(
                target: TRACING_TARGET_WORKER,
                job_id = %job.id,
                error = %error,
                "Job could not run"
            );
            if job.job_type == JobType::Embedding {
                self.mark_embedding_failed(job.task_id, &error.to_string()).await;
            }
            self.finish_failed(job.id, error.to_string(), None, None, 0).await;
        }
    }

    async fn run_workflow(&self, job: &Job, cancel: CancellationToken) -> JobResult<()> {
        let task = self.task(job.task_id).await?;
        let workflow = self.workflow(job.workflow_id).await?;

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let ctx = ExecutionContext::new(job.id, task.text.clone())
            .with_custom_instructions(job.custom_instructions.clone())
            .with_cancellation(cancel)
            .with_events(events_tx);

        // The context owns the only sender, so the drain ends with execution.
        let execute = self.engine.execute(&workflow, ctx);
        let drain = async {
            while let Some(event) = events_rx.recv().await {
                self.apply_event(job.id, event).await;
            }
        };
        let (report, ()) = tokio::join!(execute, drain);

        match report.outcome {
            Ok(bindings) => {
                let output = self
                    .outputs
                    .publish(task.id, job.id, workflow.id, &bindings, report.results.clone())
                    .await;

                if workflow.embedding.enabled {
                    match self.queue_embedding(&task, workflow.id).await {
                        Ok(_) => {}
                        Err(JobError::AlreadyActive { active, .. }) => {
                            // The active embedding job re-checks the latest version when it ends.
                            tracing::debug!(
                                target: TRACING_TARGET_WORKER,
                                job_id = %job.id,
                                task_id = %task.id,
                                active = %active,
                                "Embedding job already active, deferring to it"
                            );
                        }
                        Err(error) => {
                            tracing::warn!(
                                target: TRACING_TARGET_WORKER,
                                job_id = %job.id,
                                task_id = %task.id,
                                error = %error,
                                "Could not queue embedding job"
                            );
                        }
                    }
                }

                let done = self.jobs.complete(job.id, report.results, report.retries).await?;
                tracing::info!(
                    target: TRACING_TARGET_WORKER,
                    job_id = %job.id,
                    task_id = %task.id,
                    version = output.version,
                    retries = done.retry_count,
                    "Job completed"
                );
                self.publish(&done).await;
            }
            Err(error) => {
                let failed_block = error.block_name().map(str::to_owned);
                if error.is_cancelled() {
                    tracing::warn!(
                        target: TRACING_TARGET_WORKER,
                        job_id = %job.id,
                        block = ?failed_block,
                        "Job cancelled"
                    );
                } else {
                    tracing::error!(
                        target: TRACING_TARGET_WORKER,
                        job_id = %job.id,
                        block = ?failed_block,
                        error = %error,
                        "Job failed"
                    );
                }
                self.finish_failed(
                    job.id,
                    error.to_string(),
                    failed_block,
                    Some(report.results),
                    report.retries,
                )
                .await;
            }
        }

        Ok(())
    }

    async fn run_embedding(&self, job: &Job, cancel: CancellationToken) -> JobResult<()> {
        let task = self.task(job.task_id).await?;
        let workflow = self.workflow(job.workflow_id).await?;
        let output = self
            .outputs
            .latest(job.task_id)
            .await
            .ok_or(JobError::NoOutput(job.task_id))?;

        let running = self
            .jobs
            .update(job.id, |job| {
                job.current_step = Some(EMBEDDING_STEP.into());
                job.step_number = Some(1);
                job.message = "Generating embedding".into();
            })
            .await?;
        self.publish(&running).await;

        let bindings = output.bindings(task.text.clone());
        let indexed_version = output.version;
        let indexed = tokio::select! {
            biased;

            () = cancel.cancelled() => Err(JobError::from(WorkflowError::Cancelled { block: None })),

            result = self.pipeline.index(task.id, task.metadata.clone(), &workflow.embedding, &bindings) => {
                result.map_err(JobError::from)
            }
        };

        match indexed {
            Ok(record) => {
                let done = self.jobs.complete(job.id, Vec::new(), 0).await?;
                tracing::info!(
                    target: TRACING_TARGET_WORKER,
                    job_id = %job.id,
                    task_id = %task.id,
                    dimensions = record.dimensions,
                    "Embedding job completed"
                );
                self.publish(&done).await;
            }
            Err(error) => {
                tracing::warn!(
                    target: TRACING_TARGET_WORKER,
                    job_id = %job.id,
                    task_id = %task.id,
                    error = %error,
                    "Embedding job failed"
                );
                let cancelled = matches!(&error, JobError::Workflow(e) if e.is_cancelled());
                self.mark_embedding_failed(task.id, &error.to_string()).await;
                self.finish_failed(job.id, error.to_string(), None, None, 0).await;
                if cancelled {
                    return Ok(());
                }
            }
        }

        self.embed_newer_output(&task, indexed_version).await;
        Ok(())
    }

    /// Queues another embedding job if a newer output was published while
    /// `indexed_version` was being embedded.
    async fn embed_newer_output(&self, task: &Task, indexed_version: u32) {
        let Some(latest) = self.outputs.latest(task.id).await else {
            return;
        };
        if latest.version <= indexed_version {
            return;
        }

        let enabled = match self.workflow(latest.workflow_id).await {
            Ok(workflow) => workflow.embedding.enabled,
            Err(_) => false,
        };
        if !enabled {
            return;
        }

        match self.queue_embedding(task, latest.workflow_id).await {
            Ok(job) => {
                tracing::info!(
                    target: TRACING_TARGET_WORKER,
                    job_id = %job.id,
                    task_id = %task.id,
                    version = latest.version,
                    "Queued embedding for newer output"
                );
            }
            Err(JobError::AlreadyActive { .. }) => {}
            Err(error) => {
                tracing::warn!(
                    target: TRACING_TARGET_WORKER,
                    task_id = %task.id,
                    version = latest.version,
                    error = %error,
                    "Could not queue embedding for newer output"
                );
            }
        }
    }

    /// Folds an execution event into the job record and broadcasts it.
    async fn apply_event(&self, job_id: Uuid, event: ExecutionEvent) {
        let updated = self
            .jobs
            .update(job_id, move |job| match event {
                ExecutionEvent::BlockStarted {
                    step, block_name, ..
                } => {
                    job.step_number = Some(step + 1);
                    job.message = format!("Running block '{block_name}'");
                    job.current_step = Some(block_name);
                }
                ExecutionEvent::StateChanged { block_name, state } => {
                    job.message = format!("Block '{block_name}' is {}", state.as_ref().to_lowercase());
                }
                ExecutionEvent::WaitingForSlot { block_name } => {
                    job.message = format!("Block '{block_name}' is waiting for an inference slot");
                }
                ExecutionEvent::Retrying {
                    block_name,
                    attempt,
                    reason,
                } => {
                    job.retry_count += 1;
                    job.message = format!("Retrying block '{block_name}' after attempt {attempt}: {reason}");
                }
                ExecutionEvent::BlockCompleted { step, result, .. } => {
                    job.completed_steps = job.completed_steps.max(step + 1);
                    job.message = format!("Block '{}' done", result.block_name);
                    job.results.push(*result);
                }
                ExecutionEvent::BlockFailed { result, .. } => {
                    job.message = format!("Block '{}' failed", result.block_name);
                    job.results.push(*result);
                }
            })
            .await;

        match updated {
            Ok(job) => self.publish(&job).await,
            Err(error) => {
                tracing::trace!(
                    target: TRACING_TARGET_WORKER,
                    job_id = %job_id,
                    error = %error,
                    "Dropped progress event"
                );
            }
        }
    }
}
