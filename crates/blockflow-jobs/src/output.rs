//! Versioned AI output per task.

use std::collections::{BTreeMap, HashMap};

use blockflow_runtime::engine::BlockResult;
use blockflow_runtime::template::Bindings;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::TRACING_TARGET;

/// Snapshot of every block result of one completed workflow job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiOutput {
    pub task_id: Uuid,
    /// Starts at 1 and increases by one per completed run.
    pub version: u32,
    pub job_id: Uuid,
    pub workflow_id: Uuid,
    /// Structured output keyed by block name.
    pub outputs: BTreeMap<String, Value>,
    pub results: Vec<BlockResult>,
    pub created_at: Timestamp,
}

impl AiOutput {
    /// Rebuilds template bindings from this output.
    pub fn bindings(&self, request_text: impl Into<String>) -> Bindings {
        self.outputs
            .iter()
            .fold(Bindings::new(request_text), |bindings, (name, value)| {
                bindings.with_output(name.clone(), value.clone())
            })
    }
}

/// Stores every version; readers see only fully written versions.
#[derive(Debug, Default)]
pub struct AiOutputStore {
    versions: RwLock<HashMap<Uuid, Vec<AiOutput>>>,
}

impl AiOutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the next version for the task in one write.
    pub async fn publish(
        &self,
        task_id: Uuid,
        job_id: Uuid,
        workflow_id: Uuid,
        bindings: &Bindings,
        results: Vec<BlockResult>,
    ) -> AiOutput {
        let outputs = bindings
            .outputs()
            .map(|(name, value)| (name.to_owned(), value.clone()))
            .collect();

        let mut versions = self.versions.write().await;
        let history = versions.entry(task_id).or_default();
        let version = history.last().map_or(1, |latest| latest.version + 1);

        let output = AiOutput {
            task_id,
            version,
            job_id,
            workflow_id,
            outputs,
            results,
            created_at: Timestamp::now(),
        };
        history.push(output.clone());

        tracing::debug!(
            target: TRACING_TARGET,
            task_id = %task_id,
            job_id = %job_id,
            version,
            "AI output published"
        );
        output
    }

    /// Latest version for the task.
    pub async fn latest(&self, task_id: Uuid) -> Option<AiOutput> {
        self.versions
            .read()
            .await
            .get(&task_id)
            .and_then(|history| history.last().cloned())
    }

    /// A specific version for the task.
    pub async fn version(&self, task_id: Uuid, version: u32) -> Option<AiOutput> {
        self.versions
            .read()
            .await
            .get(&task_id)
            .and_then(|history| history.iter().find(|o| o.version == version).cloned())
    }
}
