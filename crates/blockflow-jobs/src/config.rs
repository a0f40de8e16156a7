//! Worker pool configuration.

use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "config")]
use clap::Args;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

/// Default maximum number of jobs running at once.
const DEFAULT_MAX_RUNNING_JOBS: usize = 4;

/// Default embedding request timeout in seconds.
const DEFAULT_EMBEDDING_TIMEOUT_SECS: u64 = 60;

/// Default number of snapshots buffered per progress subscriber.
const DEFAULT_PROGRESS_CAPACITY: usize = 64;

/// Configuration for the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "config", derive(Args))]
pub struct WorkerConfig {
    /// Maximum number of jobs in the RUNNING state at once.
    #[cfg_attr(
        feature = "config",
        arg(
            long = "max-running-jobs",
            env = "MAX_RUNNING_JOBS",
            default_value_t = DEFAULT_MAX_RUNNING_JOBS
        )
    )]
    #[serde(default = "WorkerConfig::default_max_running_jobs")]
    pub max_running_jobs: usize,

    /// Timeout for one embedding request, in seconds.
    #[cfg_attr(
        feature = "config",
        arg(
            long = "embedding-timeout-secs",
            env = "EMBEDDING_TIMEOUT_SECS",
            default_value_t = DEFAULT_EMBEDDING_TIMEOUT_SECS
        )
    )]
    #[serde(default = "WorkerConfig::default_embedding_timeout_secs")]
    pub embedding_timeout_secs: u64,

    /// Snapshots buffered per job for live subscribers.
    #[cfg_attr(
        feature = "config",
        arg(
            long = "progress-capacity",
            env = "PROGRESS_CAPACITY",
            default_value_t = DEFAULT_PROGRESS_CAPACITY
        )
    )]
    #[serde(default = "WorkerConfig::default_progress_capacity")]
    pub progress_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_running_jobs: DEFAULT_MAX_RUNNING_JOBS,
            embedding_timeout_secs: DEFAULT_EMBEDDING_TIMEOUT_SECS,
            progress_capacity: DEFAULT_PROGRESS_CAPACITY,
        }
    }
}

impl WorkerConfig {
    /// Creates a config with the given running-job limit.
    pub fn with_max_running_jobs(mut self, max_running_jobs: usize) -> Self {
        self.max_running_jobs = max_running_jobs;
        self
    }

    pub fn with_embedding_timeout(mut self, timeout: Duration) -> Self {
        self.embedding_timeout_secs = timeout.as_secs();
        self
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding_timeout_secs.max(1))
    }

    fn default_max_running_jobs() -> usize {
        DEFAULT_MAX_RUNNING_JOBS
    }

    fn default_embedding_timeout_secs() -> u64 {
        DEFAULT_EMBEDDING_TIMEOUT_SECS
    }

    fn default_progress_capacity() -> usize {
        DEFAULT_PROGRESS_CAPACITY
    }

    /// Creates the semaphore bounding running jobs.
    pub(crate) fn create_semaphore(&self) -> Arc<Semaphore> {
        Arc::new(Semaphore::new(self.max_running_jobs.max(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_defaults() {
        let config: WorkerConfig = serde_json::from_str(r#"{ "max_running_jobs": 2 }"#).unwrap();
        assert_eq!(config.max_running_jobs, 2);
        assert_eq!(config.embedding_timeout(), Duration::from_secs(60));
        assert_eq!(config.progress_capacity, 64);
    }

    #[test]
    fn semaphore_has_at_least_one_permit() {
        let config = WorkerConfig::default().with_max_running_jobs(0);
        assert_eq!(config.create_semaphore().available_permits(), 1);
    }
}
