//! wavemark-hl - High-Level Audio Analysis Worker
//!
//! Pulls classification jobs, runs the native low-level extractor over
//! each audio input, classifies the resulting feature document with the
//! configured bank of pre-trained models, and submits structured results
//! with retry-safe semantics.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wavemark_common::events::EventBus;

use wavemark_hl::coordinator::JobCoordinator;
use wavemark_hl::engine::ClassificationEngine;
use wavemark_hl::extractor::ExtractorClient;
use wavemark_hl::queue::{Job, MemoryQueue};
use wavemark_hl::registry::ModelRegistry;
use wavemark_hl::{build_router, AppState};

/// Command-line arguments
#[derive(Debug, Parser)]
#[command(name = "wavemark-hl", version, about = "High-level audio analysis worker")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Audio files to enqueue at startup (standalone batch mode)
    inputs: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    info!("Starting wavemark-hl (High-Level Analysis) worker");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Step 1: Resolve and load configuration
    let config =
        wavemark_common::config::load_worker_config(cli.config.as_deref(), "WAVEMARK_CONFIG")?;

    // Step 2: Publish the model bank
    let event_bus = EventBus::new(256);
    let registry = Arc::new(ModelRegistry::new().with_event_bus(event_bus.clone()));
    if config.model_dir.is_dir() {
        let loaded = registry.load_dir(&config.model_dir).await?;
        info!(
            model_dir = %config.model_dir.display(),
            loaded,
            "Model registry initialized"
        );
    } else {
        warn!(
            model_dir = %config.model_dir.display(),
            "Model directory missing, starting with an empty registry"
        );
    }

    // Step 3: Feature extractor client
    let extractor = ExtractorClient::from_config(&config);
    if !extractor.probe() {
        warn!(
            extractor = %config.extractor_path.display(),
            "Extractor binary not runnable, every extraction will fail"
        );
    }

    // Step 4: Job queue (in-process; real deployments swap in their own
    // source and sink behind the traits)
    let queue = Arc::new(MemoryQueue::new());
    for input in &cli.inputs {
        let job = Job::new(input.clone(), Vec::new());
        info!(job_id = %job.id, audio = %input.display(), "Enqueued job");
        queue.push(job);
    }

    // Step 5: Coordinator and executor pool
    let bind_addr = config.bind_addr.clone();
    let coordinator = JobCoordinator::new(
        config,
        extractor,
        ClassificationEngine::new(Arc::clone(&registry)),
        queue.clone(),
        queue,
        event_bus.clone(),
    );
    let runner = tokio::spawn(Arc::clone(&coordinator).run());

    // Step 6: Status HTTP surface
    let state = AppState::new(Arc::clone(&coordinator), registry, event_bus);
    state.spawn_error_tracker();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on http://{}", bind_addr);
    info!("Health check: http://{}/health", bind_addr);
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    // Run until interrupted, then stop the pool between pulls
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    coordinator.shutdown_token().cancel();
    let _ = runner.await;
    server.abort();

    Ok(())
}
