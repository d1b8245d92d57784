//! Photolab API server binary
//!
//! Run with: cargo run -p photolab --bin photolab-server

use clap::Parser;
use photolab::{
    config::PhotolabConfig,
    processing::{spawn_workers, JobQueue, ResultSink},
    server::{state::AppState, PhotolabServer},
    storage::JobDatabase,
    Mode,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "photolab-server")]
#[command(about = "Background removal API with batch processing", version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Do not run batch workers inside the API process
    #[arg(long)]
    no_workers: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "photolab=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = PhotolabConfig::load(cli.config.as_deref())?;

    tracing::info!("Configuration loaded");
    tracing::info!("  - Queue database: {}", config.queue.database_path.display());
    tracing::info!("  - Max upload: {} bytes, max dimension: {}px", config.images.max_upload_bytes, config.images.max_dimension);
    tracing::info!("  - Result storage: {:?}", config.storage.backend);

    let database = Arc::new(JobDatabase::open(&config.queue.database_path)?);
    let sink = Arc::new(ResultSink::from_config(&config.storage));
    let mut queue = JobQueue::new(Arc::clone(&database), config.queue.clone());
    if let Some(store) = sink.object_store() {
        queue = queue.with_result_store(store);
    }
    let queue = Arc::new(queue);
    let state = AppState::from_config(config.clone(), Arc::clone(&queue))?;

    for mode in [Mode::Quality, Mode::Fast] {
        let provider = state.providers().for_mode(mode);
        match provider.health_check().await {
            Ok(true) => tracing::info!("Provider {} ({} mode) is reachable", provider.name(), mode),
            _ => tracing::warn!("Provider {} ({} mode) is not reachable", provider.name(), mode),
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = queue.spawn_maintenance(shutdown_rx.clone());

    let workers = if config.server.embedded_workers && !cli.no_workers {
        let count = config.worker.worker_count();
        tracing::info!("Starting {} embedded batch workers", count);
        spawn_workers(
            "api",
            count,
            Arc::clone(&queue),
            Arc::clone(state.providers()),
            Arc::clone(&sink),
            config.worker.item_failure,
            shutdown_rx.clone(),
        )
    } else {
        tracing::info!("Embedded workers disabled; run photolab-worker to process batches");
        Vec::new()
    };

    let server = PhotolabServer::new(state.clone());
    tracing::info!("API: http://{}  (info at /api/info)", server.address());

    let ready = state.clone();
    server
        .start(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown requested");
            ready.set_ready(false);
        })
        .await?;

    // Workers finish their current job before exiting
    let _ = shutdown_tx.send(true);
    for handle in workers {
        if let Err(e) = handle.await {
            tracing::error!("Worker task failed: {}", e);
        }
    }
    let _ = maintenance.await;

    queue.shutdown()?;
    tracing::info!("Queue database checkpointed, bye");

    Ok(())
}
