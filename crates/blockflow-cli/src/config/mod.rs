//! CLI configuration management.
//!
//! ```text
//! Cli
//! ├── workflow, tasks          # input files
//! ├── instructions             # per-block custom instructions
//! ├── similar_limit/threshold  # similarity report
//! ├── provider: ProviderKind   # ollama | mock
//! ├── engine: EngineConfig     # invocation slots, timeouts, retries
//! ├── worker: WorkerConfig     # running jobs, embedding timeout
//! ├── ollama: OllamaConfig     # Ollama endpoint and embedding model
//! └── mock: MockConfig         # offline provider (feature-gated)
//! ```
//!
//! All configuration can be provided via CLI arguments or environment variables.

mod provider;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process;

use anyhow::Context;
use blockflow_jobs::WorkerConfig;
use blockflow_ollama::OllamaConfig;
use blockflow_runtime::engine::EngineConfig;
use blockflow_vector::SearchOptions;
#[cfg(feature = "mock")]
use clap::Args;
use clap::{Parser, ValueEnum};
pub use provider::{check_health, create_ai_services};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::{TRACING_TARGET_CONFIG, TRACING_TARGET_STARTUP};

/// Backend answering completion and embedding requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Ollama-compatible HTTP server.
    Ollama,
    /// Scripted in-process provider.
    #[cfg(feature = "mock")]
    Mock,
}

/// Offline provider settings.
#[cfg(feature = "mock")]
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct MockConfig {
    /// Reply returned for every completion request
    #[arg(long = "mock-reply", env = "MOCK_REPLY", default_value = "{}")]
    pub mock_reply: String,

    /// Size of the vectors produced by the mock embedding provider
    #[arg(
        long = "mock-embedding-dimensions",
        env = "MOCK_EMBEDDING_DIMENSIONS",
        default_value_t = 64
    )]
    pub mock_embedding_dimensions: usize,
}

/// Complete CLI configuration.
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(name = "blockflow")]
#[command(about = "Run an AI block workflow over a batch of tasks")]
#[command(version)]
pub struct Cli {
    /// Workflow definition (JSON)
    #[arg(long, env = "BLOCKFLOW_WORKFLOW")]
    pub workflow: PathBuf,

    /// Tasks to process (JSON array of objects with `text` and optional `metadata`)
    #[arg(long, env = "BLOCKFLOW_TASKS")]
    pub tasks: PathBuf,

    /// Extra instructions for one block, as `BLOCK=TEXT` (repeatable)
    #[arg(long = "instruction", value_name = "BLOCK=TEXT", value_parser = parse_instruction)]
    #[serde(default)]
    pub instructions: Vec<(String, String)>,

    /// Number of similar tasks reported per task
    #[arg(long = "similar-limit", env = "SIMILAR_LIMIT", default_value_t = 3)]
    pub similar_limit: usize,

    /// Minimum cosine similarity of a reported similar task
    #[arg(long = "similarity-threshold", env = "SIMILARITY_THRESHOLD", default_value_t = 0.0)]
    pub similarity_threshold: f32,

    /// Completion and embedding backend
    #[arg(long, value_enum, env = "AI_PROVIDER", default_value_t = ProviderKind::Ollama)]
    pub provider: ProviderKind,

    /// Block executor configuration.
    #[clap(flatten)]
    pub engine: EngineConfig,

    /// Worker pool configuration.
    #[clap(flatten)]
    pub worker: WorkerConfig,

    /// Ollama configuration for completions and embeddings.
    #[clap(flatten)]
    pub ollama: OllamaConfig,

    /// Mock provider configuration.
    #[cfg(feature = "mock")]
    #[clap(flatten)]
    pub mock: MockConfig,
}

impl Cli {
    /// Loads environment variables from .env file (if enabled) and parses CLI arguments.
    pub fn init() -> Self {
        Self::load_dotenv();
        Self::parse()
    }

    #[cfg(feature = "dotenv")]
    fn load_dotenv() {
        if let Err(err) = dotenvy::dotenv()
            && !err.not_found()
        {
            eprintln!("Warning: failed to load .env file: {err}");
        }
    }

    #[cfg(not(feature = "dotenv"))]
    fn load_dotenv() {}

    /// Initializes tracing with environment-based filtering.
    pub fn init_tracing() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    /// Rebuilds the engine configuration through its validating builder.
    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        EngineConfig::builder()
            .max_concurrent_invocations(self.engine.max_concurrent_invocations)
            .invocation_timeout_secs(self.engine.invocation_timeout_secs)
            .max_retries(self.engine.max_retries)
            .retry_delay_ms(self.engine.retry_delay_ms)
            .validation_retries(self.engine.validation_retries)
            .build()
            .context("invalid engine configuration")
    }

    /// Validates the remaining configuration values.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker.max_running_jobs == 0 {
            anyhow::bail!("max running jobs must be at least 1");
        }
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            anyhow::bail!(
                "similarity threshold must be between -1 and 1, got {}",
                self.similarity_threshold
            );
        }
        Ok(())
    }

    /// Custom instructions keyed by block name.
    pub fn custom_instructions(&self) -> HashMap<String, String> {
        self.instructions.iter().cloned().collect()
    }

    pub fn search_options(&self) -> SearchOptions {
        SearchOptions::new(self.similar_limit).with_threshold(self.similarity_threshold)
    }

    /// Logs configuration (no sensitive information).
    pub fn log(&self) {
        tracing::debug!(
            target: TRACING_TARGET_STARTUP,
            version = env!("CARGO_PKG_VERSION"),
            pid = process::id(),
            arch = std::env::consts::ARCH,
            os = std::env::consts::OS,
            features = ?Self::enabled_features(),
            "Build information"
        );

        tracing::info!(
            target: TRACING_TARGET_CONFIG,
            workflow = %self.workflow.display(),
            tasks = %self.tasks.display(),
            provider = ?self.provider,
            instructions = self.instructions.len(),
            "Input configuration"
        );

        tracing::info!(
            target: TRACING_TARGET_CONFIG,
            max_concurrent_invocations = self.engine.max_concurrent_invocations,
            invocation_timeout_secs = self.engine.invocation_timeout_secs,
            max_retries = self.engine.max_retries,
            retry_delay_ms = self.engine.retry_delay_ms,
            validation_retries = self.engine.validation_retries,
            max_running_jobs = self.worker.max_running_jobs,
            embedding_timeout_secs = self.worker.embedding_timeout_secs,
            "Execution configuration"
        );

        if self.provider == ProviderKind::Ollama {
            tracing::info!(
                target: TRACING_TARGET_CONFIG,
                base_url = %self.ollama.base_url,
                embedding_model = %self.ollama.embedding_model,
                timeout_secs = self.ollama.timeout_secs,
                "Ollama configuration"
            );
        }
    }

    /// Returns a list of enabled compile-time features.
    fn enabled_features() -> Vec<&'static str> {
        [
            cfg!(feature = "dotenv").then_some("dotenv"),
            cfg!(feature = "mock").then_some("mock"),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// Parses `BLOCK=TEXT`.
fn parse_instruction(value: &str) -> Result<(String, String), String> {
    let (block, text) = value
        .split_once('=')
        .ok_or_else(|| format!("expected BLOCK=TEXT, got '{value}'"))?;
    let block = block.trim();
    if block.is_empty() {
        return Err("block name must not be empty".into());
    }
    Ok((block.to_owned(), text.to_owned()))
}
