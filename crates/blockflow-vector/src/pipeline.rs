//! Post-completion embedding and similarity search.

use std::time::Duration;

use blockflow_core::TaskMetadata;
use blockflow_core::emb::{EmbeddingRequest, EmbeddingResponse, EmbeddingService};
use blockflow_runtime::definition::EmbeddingConfig;
use blockflow_runtime::template::{self, Bindings};
use uuid::Uuid;

use crate::TRACING_TARGET_PIPELINE;
use crate::error::{VectorError, VectorResult};
use crate::record::{EmbeddingRecord, EmbeddingStatus};
use crate::search::{SearchHit, SearchOptions};
use crate::store::VectorStore;

/// Default timeout for one embedding request.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// What a similarity search is anchored on.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryTarget {
    /// A raw query vector.
    Vector(Vec<f32>),
    /// The stored embedding of a task. The task itself is never returned.
    Task(Uuid),
    /// Free text, embedded with the pipeline's model first.
    Text(String),
}

/// Renders embedding templates, stores vectors and answers similarity queries.
#[derive(Debug, Clone)]
pub struct EmbeddingPipeline {
    embedding: EmbeddingService,
    store: VectorStore,
    timeout: Duration,
    model: Option<String>,
}

impl EmbeddingPipeline {
    /// Creates a pipeline over an embedding service and a vector store.
    pub fn new(embedding: EmbeddingService, store: VectorStore) -> Self {
        Self {
            embedding,
            store,
            timeout: DEFAULT_TIMEOUT,
            model: None,
        }
    }

    /// Sets the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the model used when a workflow does not name one.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn store(&self) -> &VectorStore {
        &self.store
    }

    /// Returns the current record of a task.
    pub async fn record(&self, task_id: Uuid) -> VectorResult<Option<EmbeddingRecord>> {
        self.store.get(task_id).await
    }

    /// Records that an embedding has been requested for the task.
    pub async fn mark_pending(&self, task_id: Uuid, metadata: TaskMetadata) -> VectorResult<EmbeddingRecord> {
        let record = EmbeddingRecord::pending(task_id, metadata);
        self.store.upsert(record.clone()).await?;
        Ok(record)
    }

    /// Fails the task's record if it is still `PENDING` or `PROCESSING`.
    ///
    /// Returns true if a record was moved to `FAILED`. Finished records are
    /// left as they are.
    pub async fn mark_failed(&self, task_id: Uuid, error: impl Into<String>) -> VectorResult<bool> {
        match self.store.get(task_id).await? {
            Some(record) if record.is_in_progress() => {
                self.store.upsert(record.fail(error)).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Renders `config.template` over `bindings`, embeds it and stores the vector.
    ///
    /// A disabled configuration is refused without touching the store. Any
    /// other failure is recorded as a `FAILED` record before being returned.
    pub async fn index(
        &self,
        task_id: Uuid,
        metadata: TaskMetadata,
        config: &EmbeddingConfig,
        bindings: &Bindings,
    ) -> VectorResult<EmbeddingRecord> {
        if !config.enabled {
            return Err(VectorError::template("embedding is disabled for this workflow"));
        }

        let record = EmbeddingRecord::pending(task_id, metadata).with_status(EmbeddingStatus::Processing);
        self.store.upsert(record.clone()).await?;

        match self.embed_rendered(task_id, config, bindings).await {
            Ok((text, response)) => {
                let record = record.complete(response.embedding, response.model, &text);
                self.store.upsert(record.clone()).await?;

                tracing::info!(
                    target: TRACING_TARGET_PIPELINE,
                    task_id = %task_id,
                    dimensions = record.dimensions,
                    "Task embedding stored"
                );
                Ok(record)
            }
            Err(error) => {
                tracing::warn!(
                    target: TRACING_TARGET_PIPELINE,
                    task_id = %task_id,
                    error = %error,
                    "Task embedding failed"
                );

                if let Err(store_error) = self.store.upsert(record.fail(error.to_string())).await {
                    tracing::error!(
                        target: TRACING_TARGET_PIPELINE,
                        task_id = %task_id,
                        error = %store_error,
                        "Failed to record embedding failure"
                    );
                }
                Err(error)
            }
        }
    }

    async fn embed_rendered(
        &self,
        task_id: Uuid,
        config: &EmbeddingConfig,
        bindings: &Bindings,
    ) -> VectorResult<(String, EmbeddingResponse)> {
        let rendered = template::render(&config.template, bindings);
        if rendered.has_unresolved() {
            tracing::warn!(
                target: TRACING_TARGET_PIPELINE,
                task_id = %task_id,
                warnings = rendered.warnings.len(),
                "Embedding template has unresolved placeholders"
            );
        }

        let text = rendered.text.trim();
        if text.is_empty() {
            return Err(VectorError::template("embedding template rendered to empty text"));
        }

        let model = config.model.as_deref().or(self.model.as_deref());
        let response = self.embed_text(text, model).await?;
        Ok((text.to_owned(), response))
    }

    async fn embed_text(&self, text: &str, model: Option<&str>) -> VectorResult<EmbeddingResponse> {
        let mut request = EmbeddingRequest::new(text);
        if let Some(model) = model {
            request = request.with_model(model);
        }

        let response = tokio::time::timeout(self.timeout, self.embedding.embed(&request))
            .await
            .map_err(|_| VectorError::Timeout(self.timeout))??;

        if response.embedding.is_empty() {
            return Err(VectorError::Embedding(
                blockflow_core::Error::external_error().with_message("embedding service returned an empty vector"),
            ));
        }
        Ok(response)
    }

    /// Ranks stored tasks by cosine similarity to `target`.
    pub async fn search(&self, target: QueryTarget, options: SearchOptions) -> VectorResult<Vec<SearchHit>> {
        let (vector, options) = match target {
            QueryTarget::Vector(vector) => (vector, options),
            QueryTarget::Task(task_id) => {
                let record = self
                    .store
                    .get(task_id)
                    .await?
                    .filter(EmbeddingRecord::is_searchable)
                    .ok_or(VectorError::NotIndexed(task_id))?;
                (record.vector, options.excluding(task_id))
            }
            QueryTarget::Text(text) => {
                if text.trim().is_empty() {
                    return Err(VectorError::invalid_query("query text is empty"));
                }
                let response = self.embed_text(&text, self.model.as_deref()).await?;
                (response.embedding, options)
            }
        };

        self.store.query(&vector, &options).await
    }
}
