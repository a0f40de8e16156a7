//! Read access to tasks and workflow definitions.

use std::collections::HashMap;

use async_trait::async_trait;
use blockflow_core::Task;
use blockflow_runtime::definition::WorkflowDefinition;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::JobResult;

/// Source of tasks and workflow definitions.
///
/// The job subsystem only reads through this trait and never writes back.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn task(&self, task_id: Uuid) -> JobResult<Option<Task>>;

    async fn workflow(&self, workflow_id: Uuid) -> JobResult<Option<WorkflowDefinition>>;
}

/// Catalog held in memory, used by the CLI and tests.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    tasks: RwLock<HashMap<Uuid, Task>>,
    workflows: RwLock<HashMap<Uuid, WorkflowDefinition>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a task.
    pub async fn insert_task(&self, task: Task) {
        self.tasks.write().await.insert(task.id, task);
    }

    /// Adds or replaces a workflow.
    pub async fn insert_workflow(&self, workflow: WorkflowDefinition) {
        self.workflows.write().await.insert(workflow.id, workflow);
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn task(&self, task_id: Uuid) -> JobResult<Option<Task>> {
        Ok(self.tasks.read().await.get(&task_id).cloned())
    }

    async fn workflow(&self, workflow_id: Uuid) -> JobResult<Option<WorkflowDefinition>> {
        Ok(self.workflows.read().await.get(&workflow_id).cloned())
    }
}
