//! Similarity search options and results.

use std::cmp::Ordering;

use blockflow_core::{TaskMetadata, TaskPriority};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Restricts search candidates by task metadata.
///
/// Applied before scoring, so `limit` counts only matching tasks.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exercise_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
}

impl SearchFilter {
    /// Creates an empty filter that matches every task.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_exercise(mut self, exercise_id: Uuid) -> Self {
        self.exercise_id = Some(exercise_id);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Returns true if no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Returns true if every set field equals the task's value.
    pub fn matches(&self, metadata: &TaskMetadata) -> bool {
        let status = self
            .status
            .as_deref()
            .is_none_or(|s| metadata.status.as_deref().is_some_and(|m| m.eq_ignore_ascii_case(s)));
        let exercise = self.exercise_id.is_none_or(|e| metadata.exercise_id == Some(e));
        let priority = self.priority.is_none_or(|p| metadata.priority == Some(p));

        status && exercise && priority
    }
}

/// Parameters of a similarity query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    /// Maximum number of hits.
    pub limit: usize,
    /// Minimum cosine similarity a hit must reach.
    #[serde(default)]
    pub threshold: f32,
    #[serde(default)]
    pub filter: SearchFilter,
    /// Task left out of the results, typically the query task itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Uuid>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            threshold: 0.0,
            filter: SearchFilter::default(),
            exclude: None,
        }
    }
}

impl SearchOptions {
    /// Creates options returning at most `limit` hits.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_filter(mut self, filter: SearchFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn excluding(mut self, task_id: Uuid) -> Self {
        self.exclude = Some(task_id);
        self
    }
}

/// One ranked search result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub task_id: Uuid,
    /// Cosine similarity to the query.
    pub score: f32,
}

impl SearchHit {
    pub fn new(task_id: Uuid, score: f32) -> Self {
        Self { task_id, score }
    }

    /// Ranking order: higher score first, then the more recent task id.
    pub(crate) fn rank(a: &Self, b: &Self) -> Ordering {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.task_id.cmp(&a.task_id))
    }
}
