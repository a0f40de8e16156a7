//! Runs a workflow over a batch of tasks and collects per-task reports.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::pin::pin;

use anyhow::Context;
use blockflow_core::{Task, TaskMetadata};
use blockflow_jobs::{JobError, JobService, JobSnapshot, JobStatus, JobType};
use blockflow_runtime::definition::WorkflowDefinition;
use blockflow_vector::{EmbeddingStatus, QueryTarget, SearchHit, SearchOptions, VectorError};
use futures::StreamExt;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::TRACING_TARGET_PROGRESS;

/// One entry of the tasks file.
#[derive(Debug, Deserialize)]
struct TaskInput {
    text: String,
    #[serde(default)]
    metadata: TaskMetadata,
}

/// Outcome of one task.
#[derive(Debug, Serialize)]
pub struct TaskReport {
    pub task_id: Uuid,
    pub text: String,
    pub job_id: Uuid,
    pub status: JobStatus,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_block: Option<String>,
    /// Structured output keyed by block name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<EmbeddingStatus>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub similar: Vec<SearchHit>,
}

/// Reads and validates a workflow definition.
pub async fn load_workflow(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read workflow file {}", path.display()))?;
    let workflow: WorkflowDefinition = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse workflow file {}", path.display()))?;
    workflow
        .validate()
        .with_context(|| format!("workflow '{}' is invalid", workflow.name))?;
    Ok(workflow)
}

/// Reads the tasks file, assigning every task a fresh id.
pub async fn load_tasks(path: &Path) -> anyhow::Result<Vec<Task>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read tasks file {}", path.display()))?;
    parse_tasks(&raw).with_context(|| format!("failed to parse tasks file {}", path.display()))
}

fn parse_tasks(raw: &str) -> anyhow::Result<Vec<Task>> {
    let inputs: Vec<TaskInput> = serde_json::from_str(raw)?;
    if inputs.is_empty() {
        anyhow::bail!("no tasks to process");
    }
    Ok(inputs
        .into_iter()
        .map(|input| Task::new(input.text).with_metadata(input.metadata))
        .collect())
}

/// Submits every task, follows the jobs to completion and ranks similar tasks.
///
/// The tasks and the workflow must already be in the service's catalog.
pub async fn run_batch(
    service: &JobService,
    workflow: &WorkflowDefinition,
    tasks: &[Task],
    instructions: HashMap<String, String>,
    search: SearchOptions,
) -> anyhow::Result<Vec<TaskReport>> {
    let mut submitted = Vec::with_capacity(tasks.len());
    for task in tasks {
        let job_id = service
            .submit(task.id, workflow.id, instructions.clone())
            .await
            .with_context(|| format!("failed to submit task {}", task.id))?;
        submitted.push((task, job_id));
    }

    let finished = join_all(
        submitted
            .iter()
            .map(|(task, job_id)| follow_task(service, task.id, *job_id, workflow.embedding.enabled)),
    )
    .await;

    let mut reports = Vec::with_capacity(tasks.len());
    for ((task, job_id), last) in submitted.into_iter().zip(finished) {
        let last = last?;
        let job = service.get_job(job_id).await?;
        let outputs = match service.latest_output(task.id).await {
            Ok(output) => output.outputs,
            Err(JobError::NoOutput(_)) => BTreeMap::new(),
            Err(error) => return Err(error.into()),
        };
        let embedding = service
            .embedding_record(task.id)
            .await?
            .map(|record| record.status);
        let similar = if embedding == Some(EmbeddingStatus::Completed) {
            similar_tasks(service, task.id, search.clone()).await?
        } else {
            Vec::new()
        };

        reports.push(TaskReport {
            task_id: task.id,
            text: task.text.clone(),
            job_id,
            status: last.status,
            retry_count: last.retry_count,
            error: job.error,
            failed_block: job.failed_block,
            outputs,
            embedding,
            similar,
        });
    }

    Ok(reports)
}

/// Waits for the workflow job and, when one was queued, the embedding job.
async fn follow_task(
    service: &JobService,
    task_id: Uuid,
    job_id: Uuid,
    embedding_enabled: bool,
) -> anyhow::Result<JobSnapshot> {
    let last = follow_job(service, job_id).await?;
    if embedding_enabled && last.status == JobStatus::Completed {
        let embedding_job = service
            .jobs_for_task(task_id)
            .await
            .into_iter()
            .rev()
            .find(|job| job.job_type == JobType::Embedding);
        if let Some(job) = embedding_job {
            follow_job(service, job.id).await?;
        }
    }
    Ok(last)
}

/// Logs every progress snapshot of a job and returns the terminal one.
async fn follow_job(service: &JobService, job_id: Uuid) -> anyhow::Result<JobSnapshot> {
    let mut stream = pin!(service.subscribe(job_id).await?);
    let mut last = None;
    while let Some(snapshot) = stream.next().await {
        tracing::info!(
            target: TRACING_TARGET_PROGRESS,
            job_id = %snapshot.job_id,
            job_type = %snapshot.job_type,
            status = %snapshot.status,
            percentage = snapshot.percentage,
            step = ?snapshot.step_number,
            total_steps = snapshot.total_steps,
            queue_position = ?snapshot.queue_position,
            eta_ms = ?snapshot.estimated_remaining_ms,
            "{}",
            snapshot.message
        );
        last = Some(snapshot);
    }
    last.with_context(|| format!("no progress received for job {job_id}"))
}

async fn similar_tasks(
    service: &JobService,
    task_id: Uuid,
    options: SearchOptions,
) -> anyhow::Result<Vec<SearchHit>> {
    match service.search_similar(QueryTarget::Task(task_id), options).await {
        Ok(hits) => Ok(hits),
        Err(JobError::Vector(VectorError::NotIndexed(_))) => Ok(Vec::new()),
        Err(error) => Err(error.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use blockflow_core::emb::EmbeddingService;
    use blockflow_core::inference::CompletionService;
    use blockflow_core::mock::{MockCompletionProvider, MockEmbeddingProvider, MockReply};
    use blockflow_jobs::{InMemoryCatalog, WorkerConfig};
    use blockflow_runtime::definition::{BlockDefinition, EmbeddingConfig};
    use blockflow_runtime::engine::{Engine, EngineConfig};
    use blockflow_vector::{EmbeddingPipeline, MemoryBackend, VectorStore};
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_tasks_with_optional_metadata() {
        let tasks = parse_tasks(
            r#"[
                { "text": "reset my password" },
                { "text": "invoice overdue", "metadata": { "status": "open", "priority": "high" } }
            ]"#,
        )
        .unwrap();

        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].metadata, TaskMetadata::default());
        assert_eq!(tasks[1].metadata.status.as_deref(), Some("open"));
        assert_ne!(tasks[0].id, tasks[1].id);

        assert!(parse_tasks("[]").is_err());
        assert!(parse_tasks(r#"[{ "metadata": {} }]"#).is_err());
    }

    #[tokio::test]
    async fn batch_reports_outputs_and_similar_tasks() {
        let completion = MockCompletionProvider::new()
            .with_rule("invoice", [MockReply::text(r#"{"label":"billing"}"#)])
            .with_default_reply(MockReply::text(r#"{"label":"account"}"#));
        let embedding = MockEmbeddingProvider::new(256);

        let workflow = WorkflowDefinition::new("triage")
            .with_block(
                BlockDefinition::new("classify", "Classify: {{REQUEST_TEXT}}").with_output_schema(json!({
                    "type": "object",
                    "properties": { "label": { "type": "string" } },
                    "required": ["label"]
                })),
            )
            .with_embedding(EmbeddingConfig::enabled("{{REQUEST_TEXT}} {{classify.label}}"));
        let tasks = vec![
            Task::new("reset my password"),
            Task::new("password reset please"),
            Task::new("invoice overdue"),
        ];

        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.insert_workflow(workflow.clone()).await;
        for task in &tasks {
            catalog.insert_task(task.clone()).await;
        }

        let engine_config = EngineConfig::builder().retry_delay_ms(0u64).build().unwrap();
        let service = JobService::new(
            Engine::new(engine_config, CompletionService::from_provider(completion)),
            EmbeddingPipeline::new(
                EmbeddingService::from_provider(embedding),
                VectorStore::new(MemoryBackend::new()),
            ),
            catalog,
            WorkerConfig::default(),
        );
        let handles = service.spawn_workers().unwrap();

        let reports = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            run_batch(&service, &workflow, &tasks, HashMap::new(), SearchOptions::new(2)),
        )
        .await
        .unwrap()
        .unwrap();

        handles.shutdown();
        handles.wait_all().await.unwrap();

        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.status == JobStatus::Completed));
        assert!(reports.iter().all(|r| r.embedding == Some(EmbeddingStatus::Completed)));
        assert_eq!(reports[2].outputs["classify"], json!({ "label": "billing" }));

        let first = &reports[0];
        assert_eq!(first.similar.len(), 2);
        assert_eq!(first.similar[0].task_id, tasks[1].id);
        assert!(first.similar.iter().all(|hit| hit.task_id != first.task_id));
    }
}
