//! In-process vector backend scored by cosine similarity.

use std::collections::HashMap;

use async_trait::async_trait;
use blockflow_core::emb::cosine_similarity;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{VectorError, VectorResult};
use crate::record::EmbeddingRecord;
use crate::search::{SearchHit, SearchOptions};
use crate::store::VectorStoreBackend;

/// Brute-force backend holding every record in memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<Uuid, EmbeddingRecord>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records in any status.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl VectorStoreBackend for MemoryBackend {
    async fn upsert(&self, record: EmbeddingRecord) -> VectorResult<()> {
        self.records.write().await.insert(record.task_id, record);
        Ok(())
    }

    async fn get(&self, task_id: Uuid) -> VectorResult<Option<EmbeddingRecord>> {
        Ok(self.records.read().await.get(&task_id).cloned())
    }

    async fn delete(&self, task_id: Uuid) -> VectorResult<bool> {
        Ok(self.records.write().await.remove(&task_id).is_some())
    }

    async fn query(&self, query: &[f32], options: &SearchOptions) -> VectorResult<Vec<SearchHit>> {
        if query.is_empty() {
            return Err(VectorError::invalid_query("query vector is empty"));
        }
        if options.limit == 0 {
            return Ok(Vec::new());
        }

        let records = self.records.read().await;
        let mut hits = Vec::new();
        for record in records.values() {
            if !record.is_searchable()
                || options.exclude == Some(record.task_id)
                || !options.filter.matches(&record.metadata)
            {
                continue;
            }
            // Vectors from a different model have other dimensions and never score.
            if let Some(score) = cosine_similarity(query, &record.vector)
                && score >= options.threshold
            {
                hits.push(SearchHit::new(record.task_id, score));
            }
        }

        hits.sort_by(SearchHit::rank);
        hits.truncate(options.limit);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use blockflow_core::{TaskMetadata, TaskPriority};

    use super::*;
    use crate::record::EmbeddingStatus;
    use crate::search::SearchFilter;

    fn completed(vector: Vec<f32>, metadata: TaskMetadata) -> EmbeddingRecord {
        EmbeddingRecord::pending(Uuid::now_v7(), metadata).complete(vector, "test", "text")
    }

    #[tokio::test]
    async fn ranks_by_descending_score_above_threshold() {
        let backend = MemoryBackend::new();
        let close = completed(vec![1.0, 0.1], TaskMetadata::default());
        let medium = completed(vec![1.0, 1.0], TaskMetadata::default());
        let far = completed(vec![0.0, 1.0], TaskMetadata::default());
        for record in [&close, &medium, &far] {
            backend.upsert(record.clone()).await.unwrap();
        }

        let hits = backend
            .query(&[1.0, 0.0], &SearchOptions::new(10).with_threshold(0.5))
            .await
            .unwrap();

        let ids: Vec<Uuid> = hits.iter().map(|h| h.task_id).collect();
        assert_eq!(ids, [close.task_id, medium.task_id]);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(hits.iter().all(|h| h.score >= 0.5));
    }

    #[tokio::test]
    async fn filters_apply_before_limit() {
        let backend = MemoryBackend::new();
        let high = TaskMetadata::default().with_priority(TaskPriority::High);

        // The two best matches are filtered out; the limit must still be filled.
        for _ in 0..2 {
            backend.upsert(completed(vec![1.0, 0.0], TaskMetadata::default())).await.unwrap();
        }
        let wanted = completed(vec![0.5, 0.5], high.clone());
        backend.upsert(wanted.clone()).await.unwrap();

        let options = SearchOptions::new(1)
            .with_filter(SearchFilter::new().with_priority(TaskPriority::High));
        let hits = backend.query(&[1.0, 0.0], &options).await.unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].task_id, wanted.task_id);
    }

    #[tokio::test]
    async fn skips_excluded_and_unfinished_records() {
        let backend = MemoryBackend::new();
        let own = completed(vec![1.0, 0.0], TaskMetadata::default());
        let other = completed(vec![0.9, 0.1], TaskMetadata::default());
        let pending = EmbeddingRecord::pending(Uuid::now_v7(), TaskMetadata::default());
        let failed = completed(vec![1.0, 0.0], TaskMetadata::default()).fail("boom");
        for record in [&own, &other, &pending, &failed] {
            backend.upsert(record.clone()).await.unwrap();
        }

        let hits = backend
            .query(&own.vector, &SearchOptions::new(5).excluding(own.task_id))
            .await
            .unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].task_id, other.task_id);
        assert_eq!(backend.len().await, 4);
    }

    #[tokio::test]
    async fn upsert_overwrites_the_task_record() {
        let backend = MemoryBackend::new();
        let record = completed(vec![1.0, 0.0], TaskMetadata::default());
        let task_id = record.task_id;
        backend.upsert(record.clone()).await.unwrap();
        backend
            .upsert(record.with_status(EmbeddingStatus::Processing))
            .await
            .unwrap();

        let stored = backend.get(task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, EmbeddingStatus::Processing);
        assert_eq!(backend.len().await, 1);
        assert!(backend.delete(task_id).await.unwrap());
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn ignores_vectors_of_other_dimensions() {
        let backend = MemoryBackend::new();
        backend.upsert(completed(vec![1.0, 0.0, 0.0], TaskMetadata::default())).await.unwrap();
        let matching = completed(vec![1.0, 0.0], TaskMetadata::default());
        backend.upsert(matching.clone()).await.unwrap();

        let hits = backend.query(&[1.0, 0.0], &SearchOptions::default()).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].task_id, matching.task_id);

        let error = backend.query(&[], &SearchOptions::default()).await.unwrap_err();
        assert!(matches!(error, VectorError::InvalidQuery(_)));
    }
}
