#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

mod batch;
mod config;
mod signal;

use std::process;
use std::sync::Arc;

use anyhow::Context;
use blockflow_jobs::{InMemoryCatalog, JobService};
use blockflow_runtime::engine::Engine;
use blockflow_vector::{EmbeddingPipeline, MemoryBackend, VectorStore};

use crate::config::{Cli, check_health, create_ai_services};

// Tracing target constants
pub const TRACING_TARGET_STARTUP: &str = "blockflow_cli::startup";
pub const TRACING_TARGET_SHUTDOWN: &str = "blockflow_cli::shutdown";
pub const TRACING_TARGET_CONFIG: &str = "blockflow_cli::config";
pub const TRACING_TARGET_PROGRESS: &str = "blockflow_cli::progress";

#[tokio::main]
async fn main() {
    let Err(error) = run().await else {
        tracing::info!(
            target: TRACING_TARGET_SHUTDOWN,
            "Application terminated successfully"
        );
        process::exit(0);
    };

    if tracing::enabled!(tracing::Level::ERROR) {
        tracing::error!(
            target: TRACING_TARGET_SHUTDOWN,
            error = %error,
            "Application terminated with error"
        );
    } else {
        eprintln!("Error: {error:#}");
    }

    process::exit(1);
}

/// Main application entry point.
async fn run() -> anyhow::Result<()> {
    let cli = Cli::init();
    Cli::init_tracing();
    cli.log();

    let engine_config = cli.engine_config()?;
    cli.validate()?;

    let services = create_ai_services(&cli).context("failed to create AI services")?;
    check_health(&services).await;

    let workflow = batch::load_workflow(&cli.workflow).await?;
    let tasks = batch::load_tasks(&cli.tasks).await?;

    let catalog = Arc::new(InMemoryCatalog::new());
    catalog.insert_workflow(workflow.clone()).await;
    for task in &tasks {
        catalog.insert_task(task.clone()).await;
    }

    let pipeline = EmbeddingPipeline::new(
        services.embedding.clone(),
        VectorStore::new(MemoryBackend::new()),
    );
    let engine = Engine::new(engine_config, services.completion.clone());
    let service = JobService::new(engine, pipeline, catalog, cli.worker.clone());
    let handles = service
        .spawn_workers()
        .context("failed to start job workers")?;

    let batch = batch::run_batch(
        &service,
        &workflow,
        &tasks,
        cli.custom_instructions(),
        cli.search_options(),
    );

    let reports = tokio::select! {
        reports = batch => reports,
        () = signal::shutdown_signal() => {
            handles.abort_all();
            handles.wait_all().await?;
            anyhow::bail!("interrupted before all tasks finished");
        }
    };

    handles.shutdown();
    handles.wait_all().await?;

    let reports = reports?;
    let rendered = serde_json::to_string_pretty(&reports).context("failed to render report")?;
    println!("{rendered}");

    Ok(())
}
