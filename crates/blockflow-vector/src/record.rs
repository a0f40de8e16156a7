//! Embedding records.

use blockflow_core::TaskMetadata;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Lifecycle of a task's embedding.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Serialize, Deserialize, AsRefStr, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EmbeddingStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

/// The current embedding of one task.
///
/// A task has at most one record; every write replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub task_id: Uuid,
    pub status: EmbeddingStatus,
    /// Empty unless the record has been completed at least once.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vector: Vec<f32>,
    /// Task attributes as they were when the record was written.
    #[serde(default)]
    pub metadata: TaskMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub dimensions: usize,
    /// Hex SHA-256 of the embedded text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: Timestamp,
}

impl EmbeddingRecord {
    /// Creates a pending record with no vector.
    pub fn pending(task_id: Uuid, metadata: TaskMetadata) -> Self {
        Self {
            task_id,
            status: EmbeddingStatus::Pending,
            vector: Vec::new(),
            metadata,
            model: None,
            dimensions: 0,
            content_hash: None,
            error: None,
            updated_at: Timestamp::now(),
        }
    }

    /// Moves the record to `status`, clearing any previous error.
    pub fn with_status(mut self, status: EmbeddingStatus) -> Self {
        self.status = status;
        self.error = None;
        self.updated_at = Timestamp::now();
        self
    }

    /// Completes the record with a fresh vector.
    pub fn complete(mut self, vector: Vec<f32>, model: impl Into<String>, text: &str) -> Self {
        self.dimensions = vector.len();
        self.vector = vector;
        self.model = Some(model.into());
        self.content_hash = Some(content_hash(text));
        self.with_status(EmbeddingStatus::Completed)
    }

    /// Marks the record failed. Any previous vector is dropped.
    pub fn fail(mut self, error: impl Into<String>) -> Self {
        self.vector.clear();
        self.dimensions = 0;
        self.status = EmbeddingStatus::Failed;
        self.error = Some(error.into());
        self.updated_at = Timestamp::now();
        self
    }

    /// Returns true while an embedding job still owns the record.
    pub fn is_in_progress(&self) -> bool {
        matches!(self.status, EmbeddingStatus::Pending | EmbeddingStatus::Processing)
    }

    /// Returns true if the record can take part in similarity search.
    pub fn is_searchable(&self) -> bool {
        self.status == EmbeddingStatus::Completed && !self.vector.is_empty()
    }
}

/// Hex-encoded SHA-256 of `text`.
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}
