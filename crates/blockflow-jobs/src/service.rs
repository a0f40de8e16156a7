//! Job service facade.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use blockflow_core::Task;
use blockflow_runtime::WorkflowError;
use blockflow_runtime::definition::WorkflowDefinition;
use blockflow_runtime::engine::{BlockResult, Engine};
use blockflow_vector::{
    EmbeddingPipeline, EmbeddingRecord, QueryTarget, SearchFilter, SearchHit, SearchOptions,
};
use futures::Stream;
use jiff::Timestamp;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::TRACING_TARGET;
use crate::broadcast::ProgressBroadcaster;
use crate::catalog::Catalog;
use crate::config::WorkerConfig;
use crate::error::{JobError, JobResult};
use crate::job::{Job, JobType};
use crate::output::{AiOutput, AiOutputStore};
use crate::progress::JobSnapshot;
use crate::store::JobStore;
use crate::worker::WorkerHandles;

/// State shared between the service handle and the workers.
pub(crate) struct Shared {
    pub(crate) engine: Engine,
    pub(crate) pipeline: EmbeddingPipeline,
    pub(crate) catalog: Arc<dyn Catalog>,
    pub(crate) jobs: JobStore,
    pub(crate) outputs: AiOutputStore,
    pub(crate) broadcaster: ProgressBroadcaster,
    pub(crate) config: WorkerConfig,
    queue_tx: mpsc::UnboundedSender<Uuid>,
    /// Present while no dispatcher owns it.
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Uuid>>>,
    /// Serializes store insertion with queue order.
    admission: tokio::sync::Mutex<()>,
    running: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl Shared {
    pub(crate) async fn task(&self, task_id: Uuid) -> JobResult<Task> {
        self.catalog
            .task(task_id)
            .await?
            .ok_or(JobError::TaskNotFound(task_id))
    }

    pub(crate) async fn workflow(&self, workflow_id: Uuid) -> JobResult<WorkflowDefinition> {
        self.catalog
            .workflow(workflow_id)
            .await?
            .ok_or(JobError::WorkflowNotFound(workflow_id))
    }

    /// Broadcasts the current snapshot of `job`.
    pub(crate) async fn publish(&self, job: &Job) {
        let position = self.jobs.queue_position(job).await;
        self.broadcaster
            .publish(JobSnapshot::of(job, position, Timestamp::now()))
            .await;
    }

    /// Stores a new job and hands it to the workers.
    async fn queue_job(&self, job: Job) -> JobResult<Job> {
        self.admit(job, None).await
    }

    /// Queues an embedding job for the task and marks its record pending.
    pub(crate) async fn queue_embedding(&self, task: &Task, workflow_id: Uuid) -> JobResult<Job> {
        self.admit(Job::new(task.id, workflow_id, JobType::Embedding, 1), Some(task))
            .await
    }

    async fn admit(&self, job: Job, embed: Option<&Task>) -> JobResult<Job> {
        let job = {
            let _admission = self.admission.lock().await;
            let job = self.jobs.insert(job).await?;

            // The record must be pending before any worker can pick the job up.
            if let Some(task) = embed
                && let Err(error) = self.pipeline.mark_pending(task.id, task.metadata.clone()).await
            {
                tracing::warn!(
                    target: TRACING_TARGET,
                    job_id = %job.id,
                    task_id = %task.id,
                    error = %error,
                    "Could not mark embedding pending"
                );
            }

            if self.queue_tx.send(job.id).is_err() {
                let _ = self.jobs.fail_if_queued(job.id, JobError::QueueClosed.to_string()).await;
                return Err(JobError::QueueClosed);
            }
            job
        };

        tracing::info!(
            target: TRACING_TARGET,
            job_id = %job.id,
            task_id = %job.task_id,
            job_type = %job.job_type,
            "Job submitted"
        );
        self.publish(&job).await;
        Ok(job)
    }

    /// Moves a job to `FAILED` and broadcasts the result.
    pub(crate) async fn finish_failed(
        &self,
        job_id: Uuid,
        error: String,
        failed_block: Option<String>,
        results: Option<Vec<BlockResult>>,
        retries: u32,
    ) {
        match self.jobs.fail(job_id, error, failed_block, results, retries).await {
            Ok(job) => self.publish(&job).await,
            Err(error) => {
                tracing::error!(
                    target: TRACING_TARGET,
                    job_id = %job_id,
                    error = %error,
                    "Could not record job failure"
                );
            }
        }
    }

    pub(crate) async fn mark_embedding_failed(&self, task_id: Uuid, error: &str) {
        if let Err(e) = self.pipeline.mark_failed(task_id, error).await {
            tracing::error!(
                target: TRACING_TARGET,
                task_id = %task_id,
                error = %e,
                "Could not record embedding failure"
            );
        }
    }

    pub(crate) fn register(&self, job_id: Uuid, cancel: CancellationToken) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id, cancel);
    }

    pub(crate) fn unregister(&self, job_id: Uuid) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&job_id);
    }

    fn cancel_running(&self, job_id: Uuid) -> bool {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        match running.get(&job_id) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<Uuid>> {
        self.queue_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn return_receiver(&self, receiver: mpsc::UnboundedReceiver<Uuid>) {
        *self.queue_rx.lock().unwrap_or_else(PoisonError::into_inner) = Some(receiver);
    }
}

/// Entry point for submitting, observing and cancelling jobs.
///
/// Cheap to clone; every clone shares the same queue, stores and workers.
#[derive(Clone)]
pub struct JobService {
    inner: Arc<Shared>,
}

impl JobService {
    /// Creates a service. Workers are started separately with
    /// [`spawn_workers`](Self::spawn_workers).
    pub fn new(
        engine: Engine,
        pipeline: EmbeddingPipeline,
        catalog: Arc<dyn Catalog>,
        config: WorkerConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let inner = Shared {
            engine,
            pipeline: pipeline.with_timeout(config.embedding_timeout()),
            catalog,
            jobs: JobStore::new(),
            outputs: AiOutputStore::new(),
            broadcaster: ProgressBroadcaster::new(config.progress_capacity),
            config,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            admission: tokio::sync::Mutex::new(()),
            running: Mutex::new(HashMap::new()),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Starts the worker pool.
    ///
    /// Fails with [`JobError::WorkersRunning`] while a previous pool is still
    /// dispatching.
    pub fn spawn_workers(&self) -> JobResult<WorkerHandles> {
        WorkerHandles::spawn(self.inner.clone())
    }

    /// Queues a workflow run for a task and returns the job id.
    pub async fn submit(
        &self,
        task_id: Uuid,
        workflow_id: Uuid,
        custom_instructions: HashMap<String, String>,
    ) -> JobResult<Uuid> {
        self.inner.task(task_id).await?;
        let workflow = self.inner.workflow(workflow_id).await?;
        workflow.validate()?;

        let job = Job::new(task_id, workflow_id, JobType::Workflow, workflow.total_steps())
            .with_custom_instructions(custom_instructions);
        Ok(self.inner.queue_job(job).await?.id)
    }

    /// Queues a new job repeating `job_id`.
    ///
    /// The new job records the one it supersedes; the original is left as it
    /// was.
    pub async fn reprocess(&self, job_id: Uuid) -> JobResult<Uuid> {
        let original = self.inner.jobs.get(job_id).await?;
        let task = self.inner.task(original.task_id).await?;
        let workflow = self.inner.workflow(original.workflow_id).await?;

        let job = match original.job_type {
            JobType::Workflow => {
                workflow.validate()?;
                let mut job = original.rerun();
                job.total_steps = workflow.total_steps();
                self.inner.queue_job(job).await?
            }
            JobType::Embedding => {
                self.check_embeddable(&task, &workflow).await?;
                self.inner.admit(original.rerun(), Some(&task)).await?
            }
        };

        tracing::info!(
            target: TRACING_TARGET,
            job_id = %job.id,
            supersedes = %job_id,
            "Job reprocessing requested"
        );
        Ok(job.id)
    }

    /// Queues an embedding job over the task's latest output.
    pub async fn submit_embedding(&self, task_id: Uuid, workflow_id: Uuid) -> JobResult<Uuid> {
        let task = self.inner.task(task_id).await?;
        let workflow = self.inner.workflow(workflow_id).await?;
        self.check_embeddable(&task, &workflow).await?;
        Ok(self.inner.queue_embedding(&task, workflow_id).await?.id)
    }

    async fn check_embeddable(&self, task: &Task, workflow: &WorkflowDefinition) -> JobResult<()> {
        if !workflow.embedding.enabled {
            return Err(JobError::EmbeddingDisabled(workflow.id));
        }
        if self.inner.outputs.latest(task.id).await.is_none() {
            return Err(JobError::NoOutput(task.id));
        }
        Ok(())
    }

    /// Cancels a queued or running job.
    ///
    /// A queued job fails at once. A running job has its in-flight work
    /// aborted and reaches `FAILED` as soon as its worker notices; the
    /// returned job may still show `RUNNING`.
    pub async fn cancel(&self, job_id: Uuid) -> JobResult<Job> {
        let job = self.inner.jobs.get(job_id).await?;
        if job.status.is_terminal() {
            return Err(JobError::Terminal {
                job_id,
                status: job.status,
            });
        }

        let reason = WorkflowError::Cancelled { block: None }.to_string();
        if let Some(cancelled) = self.inner.jobs.fail_if_queued(job_id, reason.as_str()).await? {
            tracing::info!(
                target: TRACING_TARGET,
                job_id = %job_id,
                "Queued job cancelled"
            );
            if cancelled.job_type == JobType::Embedding {
                self.inner.mark_embedding_failed(cancelled.task_id, &reason).await;
            }
            self.inner.publish(&cancelled).await;
            return Ok(cancelled);
        }

        if self.inner.cancel_running(job_id) {
            tracing::info!(
                target: TRACING_TARGET,
                job_id = %job_id,
                "Running job cancellation requested"
            );
        }
        self.inner.jobs.get(job_id).await
    }

    /// Current progress of a job.
    pub async fn snapshot(&self, job_id: Uuid) -> JobResult<JobSnapshot> {
        let job = self.inner.jobs.get(job_id).await?;
        let position = self.inner.jobs.queue_position(&job).await;
        Ok(JobSnapshot::of(&job, position, Timestamp::now()))
    }

    /// Streams progress of a job, starting with its current snapshot.
    ///
    /// The stream ends after the terminal snapshot. Snapshots are never
    /// repeated or delivered out of order.
    pub async fn subscribe(
        &self,
        job_id: Uuid,
    ) -> JobResult<impl Stream<Item = JobSnapshot> + Send + 'static> {
        let mut receiver = self.inner.broadcaster.subscribe(job_id).await;
        let current = match self.snapshot(job_id).await {
            Ok(current) => current,
            Err(error) => {
                self.inner.broadcaster.release(job_id).await;
                return Err(error);
            }
        };
        if current.is_terminal() {
            self.inner.broadcaster.release(job_id).await;
        }

        let service = self.clone();
        Ok(async_stream::stream! {
            let mut last = current.revision;
            let done = current.is_terminal();
            yield current;

            if !done {
                loop {
                    match receiver.recv().await {
                        Ok(snapshot) if snapshot.revision <= last => continue,
                        Ok(snapshot) => {
                            last = snapshot.revision;
                            let terminal = snapshot.is_terminal();
                            yield snapshot;
                            if terminal {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::trace!(
                                target: TRACING_TARGET,
                                job_id = %job_id,
                                skipped,
                                "Progress subscriber lagged"
                            );
                        }
                        Err(RecvError::Closed) => {
                            // Channel dropped without a terminal snapshot reaching us.
                            if let Ok(latest) = service.snapshot(job_id).await
                                && latest.revision > last
                            {
                                yield latest;
                            }
                            break;
                        }
                    }
                }
            }
        })
    }

    pub async fn get_job(&self, job_id: Uuid) -> JobResult<Job> {
        self.inner.jobs.get(job_id).await
    }

    /// Every job of a task, oldest first.
    pub async fn jobs_for_task(&self, task_id: Uuid) -> Vec<Job> {
        self.inner.jobs.for_task(task_id).await
    }

    /// Latest AI output version of a task.
    pub async fn latest_output(&self, task_id: Uuid) -> JobResult<AiOutput> {
        self.inner
            .outputs
            .latest(task_id)
            .await
            .ok_or(JobError::NoOutput(task_id))
    }

    /// A specific AI output version of a task.
    pub async fn output_version(&self, task_id: Uuid, version: u32) -> Option<AiOutput> {
        self.inner.outputs.version(task_id, version).await
    }

    pub async fn embedding_record(&self, task_id: Uuid) -> JobResult<Option<EmbeddingRecord>> {
        Ok(self.inner.pipeline.record(task_id).await?)
    }

    /// Ranks indexed tasks by similarity to `target`.
    ///
    /// Metadata filters are checked against the task as the catalog holds it
    /// now, not the copy stored with its embedding.
    pub async fn search_similar(
        &self,
        target: QueryTarget,
        options: SearchOptions,
    ) -> JobResult<Vec<SearchHit>> {
        if options.filter.is_empty() {
            return Ok(self.inner.pipeline.search(target, options).await?);
        }

        let limit = options.limit;
        let filter = options.filter.clone();
        let unfiltered = SearchOptions {
            limit: usize::MAX,
            filter: SearchFilter::default(),
            ..options
        };
        let candidates = self.inner.pipeline.search(target, unfiltered).await?;

        let mut hits = Vec::with_capacity(limit.min(candidates.len()));
        for hit in candidates {
            if hits.len() >= limit {
                break;
            }
            let Some(task) = self.inner.catalog.task(hit.task_id).await? else {
                continue;
            };
            if filter.matches(&task.metadata) {
                hits.push(hit);
            }
        }
        Ok(hits)
    }
}

impl std::fmt::Debug for JobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobService")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use blockflow_core::emb::EmbeddingService;
    use blockflow_core::{ErrorKind, TaskMetadata};
    use blockflow_core::inference::CompletionService;
    use blockflow_core::mock::{MockCompletionProvider, MockEmbeddingProvider, MockReply};
    use blockflow_runtime::definition::{BlockDefinition, EmbeddingConfig};
    use blockflow_runtime::engine::EngineConfig;
    use blockflow_vector::{EmbeddingStatus, MemoryBackend, VectorStore, content_hash};
    use futures::StreamExt;
    use serde_json::{Value, json};

    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::job::JobStatus;

    const WAIT: Duration = Duration::from_secs(10);

    struct Harness {
        service: JobService,
        provider: MockCompletionProvider,
        catalog: Arc<InMemoryCatalog>,
    }

    impl Harness {
        fn new(provider: MockCompletionProvider) -> Self {
            Self::with_embedder(provider, MockEmbeddingProvider::new(64), 3)
        }

        fn with_embedder(
            provider: MockCompletionProvider,
            embedder: MockEmbeddingProvider,
            max_retries: u32,
        ) -> Self {
            let config = EngineConfig::builder()
                .retry_delay_ms(0u64)
                .max_retries(max_retries)
                .build()
                .unwrap();
            let engine = Engine::new(config, CompletionService::from_provider(provider.clone()));
            let pipeline = EmbeddingPipeline::new(
                EmbeddingService::from_provider(embedder),
                VectorStore::new(MemoryBackend::new()),
            );
            let catalog = Arc::new(InMemoryCatalog::new());
            let service = JobService::new(
                engine,
                pipeline,
                catalog.clone(),
                WorkerConfig::default().with_max_running_jobs(2),
            );

            Self {
                service,
                provider,
                catalog,
            }
        }

        async fn add_task(&self, text: &str) -> Uuid {
            let task = Task::new(text);
            let id = task.id;
            self.catalog.insert_task(task).await;
            id
        }

        async fn add_workflow(&self, workflow: WorkflowDefinition) -> Uuid {
            let id = workflow.id;
            self.catalog.insert_workflow(workflow).await;
            id
        }

        async fn submit(&self, task_id: Uuid, workflow_id: Uuid) -> Uuid {
            self.service
                .submit(task_id, workflow_id, HashMap::new())
                .await
                .unwrap()
        }

        async fn wait_terminal(&self, job_id: Uuid) -> Vec<JobSnapshot> {
            let stream = self.service.subscribe(job_id).await.unwrap();
            tokio::time::timeout(WAIT, stream.collect::<Vec<_>>())
                .await
                .unwrap()
        }

        async fn wait_for_calls(&self, count: usize) {
            tokio::time::timeout(WAIT, async {
                while self.provider.call_count() < count {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
        }

        async fn wait_for_embedding_jobs(&self, task_id: Uuid, count: usize) -> Vec<Job> {
            tokio::time::timeout(WAIT, async {
                loop {
                    let jobs: Vec<Job> = self
                        .service
                        .jobs_for_task(task_id)
                        .await
                        .into_iter()
                        .filter(|job| job.job_type == JobType::Embedding)
                        .collect();
                    if jobs.len() >= count {
                        return jobs;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap()
        }

        async fn wait_for_record(&self, task_id: Uuid, status: EmbeddingStatus) {
            tokio::time::timeout(WAIT, async {
                loop {
                    let record = self.service.embedding_record(task_id).await.unwrap();
                    if record.is_some_and(|record| record.status == status) {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
        }

        async fn embedding_job(&self, task_id: Uuid) -> Job {
            self.service
                .jobs_for_task(task_id)
                .await
                .into_iter()
                .rev()
                .find(|job| job.job_type == JobType::Embedding)
                .unwrap()
        }
    }

    fn label_schema() -> Value {
        json!({
            "type": "object",
            "properties": { "label": { "type": "string" } },
            "required": ["label"]
        })
    }

    fn abc_workflow() -> WorkflowDefinition {
        let a = BlockDefinition::new("A", "Classify: {{REQUEST_TEXT}}").with_output_schema(label_schema());
        let b = BlockDefinition::new("B", "Expand {{A.label}}")
            .with_output_schema(json!({
                "type": "object",
                "properties": { "detail": { "type": "string" } },
                "required": ["detail"]
            }))
            .depends_on(&a);
        let c = BlockDefinition::new("C", "Combine {{A.label}} and {{B.detail}}")
            .with_output_schema(json!({ "type": "string" }))
            .depends_on(&a)
            .depends_on(&b);
        WorkflowDefinition::new("abc").with_block(a).with_block(b).with_block(c)
    }

    fn abc_provider() -> MockCompletionProvider {
        MockCompletionProvider::new()
            .with_rule(
                "Classify",
                [
                    MockReply::text("not json yet"),
                    MockReply::text(r#"{"label":"greeting"}"#),
                ],
            )
            .with_rule("Expand", [MockReply::text(r#"{"detail":"a friendly hello"}"#)])
            .with_rule("Combine", [MockReply::text("All good.")])
    }

    fn single_block_workflow() -> WorkflowDefinition {
        WorkflowDefinition::new("single").with_block(
            BlockDefinition::new("A", "Classify: {{REQUEST_TEXT}}").with_output_schema(label_schema()),
        )
    }

    fn label_provider() -> MockCompletionProvider {
        MockCompletionProvider::new().with_default_reply(MockReply::text(r#"{"label":"account"}"#))
    }

    #[tokio::test]
    async fn abc_workflow_completes_with_one_retry() {
        let harness = Harness::new(abc_provider());
        let task_id = harness.add_task("hello").await;
        let workflow_id = harness.add_workflow(abc_workflow()).await;

        let job_id = harness.submit(task_id, workflow_id).await;
        let stream = harness.service.subscribe(job_id).await.unwrap();
        let handles = harness.service.spawn_workers().unwrap();
        let snapshots: Vec<JobSnapshot> = tokio::time::timeout(WAIT, stream.collect()).await.unwrap();

        let last = snapshots.last().unwrap();
        assert_eq!(last.status, JobStatus::Completed);
        assert_eq!(last.percentage, 100);
        assert_eq!(last.retry_count, 1);

        let percentages: Vec<u8> = snapshots.iter().map(|s| s.percentage).collect();
        assert!(percentages.windows(2).all(|pair| pair[0] <= pair[1]), "{percentages:?}");
        assert_eq!(percentages.iter().filter(|p| **p == 100).count(), 1);
        let revisions: Vec<u64> = snapshots.iter().map(|s| s.revision).collect();
        assert!(revisions.windows(2).all(|pair| pair[0] < pair[1]));

        let job = harness.service.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.results.len(), 3);
        assert_eq!(job.completed_steps, 3);

        let output = harness.service.latest_output(task_id).await.unwrap();
        assert_eq!(output.version, 1);
        assert_eq!(output.job_id, job_id);
        assert_eq!(output.outputs["A"], json!({ "label": "greeting" }));

        assert_eq!(harness.service.embedding_record(task_id).await.unwrap(), None);
        assert_eq!(harness.service.jobs_for_task(task_id).await.len(), 1);
        assert_eq!(harness.service.snapshot(job_id).await.unwrap(), *last);

        handles.shutdown();
        handles.wait_all().await.unwrap();
    }

    #[tokio::test]
    async fn one_active_job_per_task() {
        let harness = Harness::new(label_provider());
        let task_id = harness.add_task("hello").await;
        let workflow_id = harness.add_workflow(single_block_workflow()).await;

        let first = harness.submit(task_id, workflow_id).await;
        let error = harness
            .service
            .submit(task_id, workflow_id, HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(error, JobError::AlreadyActive { active, .. } if active == first));
    }

    #[tokio::test]
    async fn submit_checks_task_and_workflow() {
        let harness = Harness::new(label_provider());
        let task_id = harness.add_task("hello").await;
        let workflow_id = harness.add_workflow(single_block_workflow()).await;
        let empty_id = harness.add_workflow(WorkflowDefinition::new("empty")).await;

        let missing = Uuid::now_v7();
        assert!(matches!(
            harness.service.submit(missing, workflow_id, HashMap::new()).await,
            Err(JobError::TaskNotFound(id)) if id == missing
        ));
        assert!(matches!(
            harness.service.submit(task_id, missing, HashMap::new()).await,
            Err(JobError::WorkflowNotFound(id)) if id == missing
        ));
        assert!(matches!(
            harness.service.submit(task_id, empty_id, HashMap::new()).await,
            Err(JobError::Workflow(WorkflowError::InvalidDefinition(_)))
        ));
        assert!(harness.service.jobs_for_task(task_id).await.is_empty());
    }

    #[tokio::test]
    async fn cancelled_queued_job_never_runs() {
        let harness = Harness::new(label_provider());
        let workflow_id = harness.add_workflow(single_block_workflow()).await;
        let first_task = harness.add_task("first request").await;
        let second_task = harness.add_task("second request").await;
        let third_task = harness.add_task("third request").await;

        let first = harness.submit(first_task, workflow_id).await;
        let second = harness.submit(second_task, workflow_id).await;
        let third = harness.submit(third_task, workflow_id).await;

        let positions = [
            harness.service.snapshot(first).await.unwrap().queue_position,
            harness.service.snapshot(second).await.unwrap().queue_position,
            harness.service.snapshot(third).await.unwrap().queue_position,
        ];
        assert_eq!(positions, [Some(0), Some(1), Some(2)]);

        let cancelled = harness.service.cancel(first).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Failed);
        assert!(cancelled.error.unwrap().contains("cancelled"));
        assert_eq!(harness.service.snapshot(second).await.unwrap().queue_position, Some(0));
        assert!(matches!(
            harness.service.cancel(first).await,
            Err(JobError::Terminal { .. })
        ));

        let handles = harness.service.spawn_workers().unwrap();
        assert_eq!(harness.wait_terminal(second).await.last().unwrap().status, JobStatus::Completed);
        assert_eq!(harness.wait_terminal(third).await.last().unwrap().status, JobStatus::Completed);

        assert_eq!(harness.provider.calls_matching("first request"), 0);
        assert_eq!(harness.service.get_job(first).await.unwrap().status, JobStatus::Failed);

        handles.shutdown();
        handles.wait_all().await.unwrap();
    }

    #[tokio::test]
    async fn cancelling_running_job_aborts_invocation() {
        let provider = MockCompletionProvider::new()
            .with_rule("Classify", [MockReply::Hang])
            .with_rule("Expand", [MockReply::text(r#"{"detail":"x"}"#)]);
        let harness = Harness::new(provider);
        let task_id = harness.add_task("hello").await;
        let workflow_id = harness.add_workflow(abc_workflow()).await;

        let job_id = harness.submit(task_id, workflow_id).await;
        let handles = harness.service.spawn_workers().unwrap();
        harness.wait_for_calls(1).await;

        harness.service.cancel(job_id).await.unwrap();
        let last = harness.wait_terminal(job_id).await.pop().unwrap();
        assert_eq!(last.status, JobStatus::Failed);
        assert!(last.error.unwrap().contains("cancelled"));

        let job = harness.service.get_job(job_id).await.unwrap();
        assert_eq!(job.failed_block.as_deref(), Some("A"));
        assert_eq!(harness.provider.calls_matching("Expand"), 0);
        assert!(harness.service.latest_output(task_id).await.is_err());

        handles.shutdown();
        handles.wait_all().await.unwrap();
    }

    #[tokio::test]
    async fn transient_failure_is_retried_to_completion() {
        let provider = MockCompletionProvider::new().with_default_replies([
            MockReply::error(ErrorKind::ServiceUnavailable, "model loading"),
            MockReply::text(r#"{"label":"account"}"#),
        ]);
        let harness = Harness::new(provider);
        let task_id = harness.add_task("hello").await;
        let workflow_id = harness.add_workflow(single_block_workflow()).await;

        let job_id = harness.submit(task_id, workflow_id).await;
        let handles = harness.service.spawn_workers().unwrap();
        let last = harness.wait_terminal(job_id).await.pop().unwrap();

        assert_eq!(last.status, JobStatus::Completed);
        assert!(last.retry_count > 0);
        assert_eq!(harness.provider.call_count(), 2);

        handles.shutdown();
        handles.wait_all().await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_retries_fail_with_last_error() {
        let provider = MockCompletionProvider::new()
            .with_default_reply(MockReply::error(ErrorKind::RateLimited, "slow down"));
        let harness = Harness::with_embedder(provider, MockEmbeddingProvider::new(8), 2);
        let task_id = harness.add_task("hello").await;
        let workflow_id = harness.add_workflow(single_block_workflow()).await;

        let job_id = harness.submit(task_id, workflow_id).await;
        let handles = harness.service.spawn_workers().unwrap();
        let last = harness.wait_terminal(job_id).await.pop().unwrap();

        assert_eq!(last.status, JobStatus::Failed);
        assert_eq!(last.retry_count, 2);
        assert!(last.error.unwrap().contains("slow down"));
        assert_eq!(harness.provider.call_count(), 3);

        let job = harness.service.get_job(job_id).await.unwrap();
        assert_eq!(job.failed_block.as_deref(), Some("A"));
        assert_eq!(job.results.len(), 1);
        assert!(!job.results[0].is_done());

        handles.shutdown();
        handles.wait_all().await.unwrap();
    }

    #[tokio::test]
    async fn reprocess_creates_superseding_job() {
        let harness = Harness::new(label_provider());
        let task_id = harness.add_task("hello").await;
        let workflow_id = harness.add_workflow(single_block_workflow()).await;
        let handles = harness.service.spawn_workers().unwrap();

        let original = harness.submit(task_id, workflow_id).await;
        harness.wait_terminal(original).await;

        let rerun = harness.service.reprocess(original).await.unwrap();
        assert_ne!(rerun, original);
        assert_eq!(harness.wait_terminal(rerun).await.pop().unwrap().status, JobStatus::Completed);

        let output = harness.service.latest_output(task_id).await.unwrap();
        assert_eq!(output.version, 2);
        assert_eq!(output.job_id, rerun);
        assert_eq!(harness.service.output_version(task_id, 1).await.unwrap().job_id, original);

        let original = harness.service.get_job(original).await.unwrap();
        assert_eq!(original.status, JobStatus::Completed);
        assert_eq!(original.superseded_by, Some(rerun));
        assert_eq!(harness.service.get_job(rerun).await.unwrap().supersedes, Some(original.id));

        handles.shutdown();
        handles.wait_all().await.unwrap();
    }

    #[tokio::test]
    async fn completed_jobs_are_embedded_and_searchable() {
        let embedder = MockEmbeddingProvider::new(3)
            .with_vector("reset my password", vec![1.0, 0.0, 0.0])
            .with_vector("password reset help", vec![0.9, 0.1, 0.0])
            .with_vector("invoice overdue", vec![0.0, 0.0, 1.0]);
        let harness = Harness::with_embedder(label_provider(), embedder, 3);
        let workflow = single_block_workflow().with_embedding(EmbeddingConfig::enabled("{{REQUEST_TEXT}}"));
        let workflow_id = harness.add_workflow(workflow).await;
        let handles = harness.service.spawn_workers().unwrap();

        let mut tasks = Vec::new();
        for text in ["reset my password", "password reset help", "invoice overdue"] {
            let task_id = harness.add_task(text).await;
            let job_id = harness.submit(task_id, workflow_id).await;
            assert_eq!(harness.wait_terminal(job_id).await.pop().unwrap().status, JobStatus::Completed);

            let embedding = harness.embedding_job(task_id).await;
            let last = harness.wait_terminal(embedding.id).await.pop().unwrap();
            assert_eq!(last.status, JobStatus::Completed);
            assert_eq!(last.percentage, 100);
            tasks.push(task_id);
        }

        let record = harness.service.embedding_record(tasks[0]).await.unwrap().unwrap();
        assert_eq!(record.status, EmbeddingStatus::Completed);
        assert_eq!(record.dimensions, 3);

        let hits = harness
            .service
            .search_similar(QueryTarget::Task(tasks[0]), SearchOptions::new(5))
            .await
            .unwrap();
        assert_eq!(hits[0].task_id, tasks[1]);
        assert!(hits.iter().all(|hit| hit.task_id != tasks[0]));
        assert!(hits.windows(2).all(|pair| pair[0].score >= pair[1].score));

        handles.shutdown();
        handles.wait_all().await.unwrap();
    }

    #[tokio::test]
    async fn embedding_failure_leaves_workflow_completed() {
        let embedder = MockEmbeddingProvider::new(8).with_failure("broken", ErrorKind::InvalidInput);
        let harness = Harness::with_embedder(label_provider(), embedder, 3);
        let workflow = single_block_workflow().with_embedding(EmbeddingConfig::enabled("{{REQUEST_TEXT}}"));
        let workflow_id = harness.add_workflow(workflow).await;
        let task_id = harness.add_task("broken request").await;
        let handles = harness.service.spawn_workers().unwrap();

        let job_id = harness.submit(task_id, workflow_id).await;
        assert_eq!(harness.wait_terminal(job_id).await.pop().unwrap().status, JobStatus::Completed);

        let embedding = harness.embedding_job(task_id).await;
        let last = harness.wait_terminal(embedding.id).await.pop().unwrap();
        assert_eq!(last.status, JobStatus::Failed);
        assert!(last.error.is_some());

        assert_eq!(harness.service.get_job(job_id).await.unwrap().status, JobStatus::Completed);
        let record = harness.service.embedding_record(task_id).await.unwrap().unwrap();
        assert_eq!(record.status, EmbeddingStatus::Failed);
        assert!(record.vector.is_empty());

        handles.shutdown();
        handles.wait_all().await.unwrap();
    }

    #[tokio::test]
    async fn output_published_during_embedding_is_embedded_next() {
        let provider = MockCompletionProvider::new().with_default_replies([
            MockReply::text(r#"{"label":"old"}"#),
            MockReply::text(r#"{"label":"new"}"#),
        ]);
        let embedder = MockEmbeddingProvider::new(16).with_delay(Duration::from_millis(800));
        let harness = Harness::with_embedder(provider, embedder, 3);
        let workflow = single_block_workflow()
            .with_embedding(EmbeddingConfig::enabled("{{REQUEST_TEXT}} {{A.label}}"));
        let workflow_id = harness.add_workflow(workflow).await;
        let task_id = harness.add_task("hello").await;
        let handles = harness.service.spawn_workers().unwrap();

        let first = harness.submit(task_id, workflow_id).await;
        harness.wait_terminal(first).await;
        let first_embedding = harness.embedding_job(task_id).await;
        harness.wait_for_record(task_id, EmbeddingStatus::Processing).await;

        let rerun = harness.service.reprocess(first).await.unwrap();
        assert_eq!(harness.wait_terminal(rerun).await.pop().unwrap().status, JobStatus::Completed);
        assert_eq!(
            harness.service.get_job(first_embedding.id).await.unwrap().status,
            JobStatus::Running
        );
        let latest = harness.service.latest_output(task_id).await.unwrap();
        assert_eq!(latest.outputs["A"], json!({ "label": "new" }));

        let embeddings = harness.wait_for_embedding_jobs(task_id, 2).await;
        assert_eq!(embeddings[0].id, first_embedding.id);
        let last = harness.wait_terminal(embeddings[1].id).await.pop().unwrap();
        assert_eq!(last.status, JobStatus::Completed);

        let record = harness.service.embedding_record(task_id).await.unwrap().unwrap();
        assert_eq!(record.status, EmbeddingStatus::Completed);
        assert_eq!(record.content_hash, Some(content_hash("hello new")));

        handles.shutdown();
        handles.wait_all().await.unwrap();
        assert_eq!(harness.wait_for_embedding_jobs(task_id, 2).await.len(), 2);
    }

    #[tokio::test]
    async fn embedding_disabled_after_queueing_fails_the_record() {
        let harness = Harness::new(label_provider());
        let workflow = single_block_workflow().with_embedding(EmbeddingConfig::enabled("{{REQUEST_TEXT}}"));
        let workflow_id = harness.add_workflow(workflow.clone()).await;
        let task_id = harness.add_task("hello").await;

        let handles = harness.service.spawn_workers().unwrap();
        let job_id = harness.submit(task_id, workflow_id).await;
        harness.wait_terminal(job_id).await;
        let automatic = harness.embedding_job(task_id).await;
        harness.wait_terminal(automatic.id).await;
        handles.shutdown();
        handles.wait_all().await.unwrap();

        let regenerated = harness.service.submit_embedding(task_id, workflow_id).await.unwrap();
        let record = harness.service.embedding_record(task_id).await.unwrap().unwrap();
        assert_eq!(record.status, EmbeddingStatus::Pending);

        let mut disabled = workflow;
        disabled.embedding = EmbeddingConfig::default();
        harness.catalog.insert_workflow(disabled).await;

        let handles = harness.service.spawn_workers().unwrap();
        let last = harness.wait_terminal(regenerated).await.pop().unwrap();
        assert_eq!(last.status, JobStatus::Failed);

        let record = harness.service.embedding_record(task_id).await.unwrap().unwrap();
        assert_eq!(record.status, EmbeddingStatus::Failed);
        assert!(record.error.unwrap().contains("disabled"));

        handles.shutdown();
        handles.wait_all().await.unwrap();
    }

    #[tokio::test]
    async fn search_filters_use_current_task_metadata() {
        let embedder = MockEmbeddingProvider::new(3)
            .with_vector("reset my password", vec![1.0, 0.0, 0.0])
            .with_vector("password reset help", vec![0.9, 0.1, 0.0])
            .with_vector("forgot my password", vec![0.8, 0.2, 0.0]);
        let harness = Harness::with_embedder(label_provider(), embedder, 3);
        let workflow = single_block_workflow().with_embedding(EmbeddingConfig::enabled("{{REQUEST_TEXT}}"));
        let workflow_id = harness.add_workflow(workflow).await;
        let handles = harness.service.spawn_workers().unwrap();

        let mut tasks = Vec::new();
        for text in ["reset my password", "password reset help", "forgot my password"] {
            let task = Task::new(text).with_metadata(TaskMetadata::default().with_status("open"));
            harness.catalog.insert_task(task.clone()).await;
            let job_id = harness.submit(task.id, workflow_id).await;
            harness.wait_terminal(job_id).await;
            let embedding = harness.embedding_job(task.id).await;
            assert_eq!(harness.wait_terminal(embedding.id).await.pop().unwrap().status, JobStatus::Completed);
            tasks.push(task);
        }

        let mut closed = tasks[1].clone();
        closed.metadata = TaskMetadata::default().with_status("closed");
        harness.catalog.insert_task(closed).await;

        let open = harness
            .service
            .search_similar(
                QueryTarget::Task(tasks[0].id),
                SearchOptions::new(1).with_filter(SearchFilter::new().with_status("open")),
            )
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].task_id, tasks[2].id);

        let closed = harness
            .service
            .search_similar(
                QueryTarget::Task(tasks[0].id),
                SearchOptions::new(5).with_filter(SearchFilter::new().with_status("closed")),
            )
            .await
            .unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].task_id, tasks[1].id);

        handles.shutdown();
        handles.wait_all().await.unwrap();
    }

    #[tokio::test]
    async fn submit_embedding_requires_enabled_config_and_output() {
        let harness = Harness::new(label_provider());
        let task_id = harness.add_task("hello").await;
        let disabled = harness.add_workflow(single_block_workflow()).await;
        let enabled = harness
            .add_workflow(single_block_workflow().with_embedding(EmbeddingConfig::enabled("{{REQUEST_TEXT}}")))
            .await;

        assert!(matches!(
            harness.service.submit_embedding(task_id, disabled).await,
            Err(JobError::EmbeddingDisabled(id)) if id == disabled
        ));
        assert!(matches!(
            harness.service.submit_embedding(task_id, enabled).await,
            Err(JobError::NoOutput(id)) if id == task_id
        ));

        let handles = harness.service.spawn_workers().unwrap();
        let job_id = harness.submit(task_id, enabled).await;
        harness.wait_terminal(job_id).await;
        let automatic = harness.embedding_job(task_id).await;
        harness.wait_terminal(automatic.id).await;

        let regenerated = harness.service.submit_embedding(task_id, enabled).await.unwrap();
        let last = harness.wait_terminal(regenerated).await.pop().unwrap();
        assert_eq!(last.status, JobStatus::Completed);
        assert_ne!(regenerated, automatic.id);

        handles.shutdown();
        handles.wait_all().await.unwrap();
    }

    #[tokio::test]
    async fn workers_can_restart_after_shutdown() {
        let harness = Harness::new(label_provider());
        let task_id = harness.add_task("hello").await;
        let workflow_id = harness.add_workflow(single_block_workflow()).await;

        let handles = harness.service.spawn_workers().unwrap();
        assert!(matches!(
            harness.service.spawn_workers(),
            Err(JobError::WorkersRunning)
        ));
        handles.shutdown();
        handles.wait_all().await.unwrap();

        let job_id = harness.submit(task_id, workflow_id).await;
        let handles = harness.service.spawn_workers().unwrap();
        assert_eq!(harness.wait_terminal(job_id).await.pop().unwrap().status, JobStatus::Completed);

        handles.shutdown();
        handles.wait_all().await.unwrap();
    }

    #[tokio::test]
    async fn abort_all_fails_running_jobs() {
        let harness = Harness::new(MockCompletionProvider::new().with_default_reply(MockReply::Hang));
        let task_id = harness.add_task("hello").await;
        let workflow_id = harness.add_workflow(single_block_workflow()).await;

        let job_id = harness.submit(task_id, workflow_id).await;
        let handles = harness.service.spawn_workers().unwrap();
        harness.wait_for_calls(1).await;

        handles.abort_all();
        tokio::time::timeout(WAIT, handles.wait_all()).await.unwrap().unwrap();

        let job = harness.service.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn subscribing_to_unknown_job_fails() {
        let harness = Harness::new(label_provider());
        let missing = Uuid::now_v7();
        assert!(matches!(
            harness.service.subscribe(missing).await,
            Err(JobError::NotFound(id)) if id == missing
        ));
        assert_eq!(harness.service.inner.broadcaster.channel_count().await, 0);
    }
}
