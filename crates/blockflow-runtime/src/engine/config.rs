//! Engine configuration.

use std::time::Duration;

#[cfg(feature = "config")]
use clap::Args;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};

/// Configuration for the block executor.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[cfg_attr(feature = "config", derive(Args))]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct EngineConfig {
    /// Maximum number of model invocations in flight across all jobs.
    #[cfg_attr(
        feature = "config",
        arg(long = "max-concurrent-invocations", env = "MAX_CONCURRENT_INVOCATIONS", default_value_t = 4)
    )]
    #[builder(default = "4")]
    #[serde(default = "default_max_concurrent_invocations")]
    pub max_concurrent_invocations: usize,

    /// Timeout for a single model invocation, in seconds.
    #[cfg_attr(
        feature = "config",
        arg(long = "invocation-timeout-secs", env = "INVOCATION_TIMEOUT_SECS", default_value_t = 120)
    )]
    #[builder(default = "120")]
    #[serde(default = "default_invocation_timeout_secs")]
    pub invocation_timeout_secs: u64,

    /// Transient-failure retries allowed per job.
    #[cfg_attr(
        feature = "config",
        arg(long = "max-retries", env = "MAX_RETRIES", default_value_t = 3)
    )]
    #[builder(default = "3")]
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before retrying a transient failure, in milliseconds.
    #[cfg_attr(
        feature = "config",
        arg(long = "retry-delay-ms", env = "RETRY_DELAY_MS", default_value_t = 1000)
    )]
    #[builder(default = "1000")]
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Extra attempts per block after a schema validation failure.
    #[cfg_attr(
        feature = "config",
        arg(long = "validation-retries", env = "VALIDATION_RETRIES", default_value_t = 1)
    )]
    #[builder(default = "1")]
    #[serde(default = "default_validation_retries")]
    pub validation_retries: u32,
}

fn default_max_concurrent_invocations() -> usize {
    4
}

fn default_invocation_timeout_secs() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_validation_retries() -> u32 {
    1
}

impl EngineConfig {
    /// Returns a builder with default values.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Per-invocation timeout.
    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }

    /// Delay before a transient retry.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl EngineConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_invocations == Some(0) {
            return Err("max_concurrent_invocations must be at least 1".into());
        }
        if self.invocation_timeout_secs == Some(0) {
            return Err("invocation_timeout_secs must be at least 1".into());
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_invocations: default_max_concurrent_invocations(),
            invocation_timeout_secs: default_invocation_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            validation_retries: default_validation_retries(),
        }
    }
}
