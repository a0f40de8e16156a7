//! Vector store trait and wrapper.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::TRACING_TARGET;
use crate::error::VectorResult;
use crate::record::EmbeddingRecord;
use crate::search::{SearchHit, SearchOptions};

/// Trait for vector store backends.
#[async_trait]
pub trait VectorStoreBackend: Send + Sync {
    /// Replaces the task's record in one atomic write.
    async fn upsert(&self, record: EmbeddingRecord) -> VectorResult<()>;

    /// Gets the current record of a task.
    async fn get(&self, task_id: Uuid) -> VectorResult<Option<EmbeddingRecord>>;

    /// Deletes the record of a task. Returns true if one existed.
    async fn delete(&self, task_id: Uuid) -> VectorResult<bool>;

    /// Ranks searchable records against `query`.
    ///
    /// Implementations apply `options.filter` and `options.exclude` before
    /// scoring, drop hits below `options.threshold`, and return at most
    /// `options.limit` hits ordered by [`SearchHit`] ranking.
    async fn query(&self, query: &[f32], options: &SearchOptions) -> VectorResult<Vec<SearchHit>>;
}

/// Vector store wrapping a shared backend.
#[derive(Clone)]
pub struct VectorStore {
    backend: Arc<dyn VectorStoreBackend>,
}

impl VectorStore {
    /// Creates a new vector store from a backend.
    pub fn new<B>(backend: B) -> Self
    where
        B: VectorStoreBackend + 'static,
    {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// Replaces the task's record.
    pub async fn upsert(&self, record: EmbeddingRecord) -> VectorResult<()> {
        tracing::debug!(
            target: TRACING_TARGET,
            task_id = %record.task_id,
            status = %record.status,
            dimensions = record.dimensions,
            "Upserting embedding record"
        );
        self.backend.upsert(record).await
    }

    /// Gets the current record of a task.
    pub async fn get(&self, task_id: Uuid) -> VectorResult<Option<EmbeddingRecord>> {
        self.backend.get(task_id).await
    }

    /// Deletes the record of a task.
    pub async fn delete(&self, task_id: Uuid) -> VectorResult<bool> {
        tracing::debug!(
            target: TRACING_TARGET,
            task_id = %task_id,
            "Deleting embedding record"
        );
        self.backend.delete(task_id).await
    }

    /// Ranks stored vectors against `query`.
    pub async fn query(&self, query: &[f32], options: &SearchOptions) -> VectorResult<Vec<SearchHit>> {
        tracing::debug!(
            target: TRACING_TARGET,
            dimensions = query.len(),
            limit = options.limit,
            threshold = options.threshold,
            "Searching vectors"
        );
        let hits = self.backend.query(query, options).await?;
        tracing::trace!(target: TRACING_TARGET, hits = hits.len(), "Search finished");
        Ok(hits)
    }
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore").finish_non_exhaustive()
    }
}
