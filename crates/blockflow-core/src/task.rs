//! Task records as supplied by task storage.

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Priority assigned to a task by its author.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Task attributes used to narrow similarity searches.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Free-form status label owned by task storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Exercise (tenant) the task belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exercise_id: Option<Uuid>,
    /// Task priority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
}

impl TaskMetadata {
    /// Sets the status label.
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Sets the exercise id.
    pub fn with_exercise(mut self, exercise_id: Uuid) -> Self {
        self.exercise_id = Some(exercise_id);
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// An inbound text task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task id, time-ordered (v7).
    pub id: Uuid,
    /// The request text the workflow runs against.
    pub text: String,
    /// Searchable metadata.
    #[serde(default)]
    pub metadata: TaskMetadata,
    /// When the task was created.
    pub created_at: Timestamp,
}

impl Task {
    /// Creates a new task with a fresh time-ordered id.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            text: text.into(),
            metadata: TaskMetadata::default(),
            created_at: Timestamp::now(),
        }
    }

    /// Replaces the task metadata.
    pub fn with_metadata(mut self, metadata: TaskMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}
