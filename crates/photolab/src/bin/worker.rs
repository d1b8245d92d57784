//! Standalone batch worker binary
//!
//! Shares the queue database with the API server; any number of worker
//! processes may run against the same file.
//!
//! Run with: cargo run -p photolab --bin photolab-worker

use clap::Parser;
use photolab::{
    config::PhotolabConfig,
    processing::{spawn_workers, JobQueue, ResultSink},
    providers::ProviderSet,
    storage::JobDatabase,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "photolab-worker")]
#[command(about = "Process queued background removal batches", version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of worker loops (overrides worker.concurrency)
    #[arg(short = 'n', long)]
    concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "photolab=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = PhotolabConfig::load(cli.config.as_deref())?;
    if let Some(concurrency) = cli.concurrency {
        config.worker.concurrency = Some(concurrency);
    }

    let database = Arc::new(JobDatabase::open(&config.queue.database_path)?);
    let providers = Arc::new(ProviderSet::from_config(&config.providers)?);
    let sink = Arc::new(ResultSink::from_config(&config.storage));
    let mut queue = JobQueue::new(database, config.queue.clone());
    if let Some(store) = sink.object_store() {
        queue = queue.with_result_store(store);
    }
    let queue = Arc::new(queue);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let count = config.worker.worker_count();
    tracing::info!(
        "Starting {} batch workers on {}",
        count,
        config.queue.database_path.display()
    );

    let workers = spawn_workers(
        "worker",
        count,
        Arc::clone(&queue),
        providers,
        sink,
        config.worker.item_failure,
        shutdown_rx,
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested, waiting for running jobs");
    let _ = shutdown_tx.send(true);

    for handle in workers {
        if let Err(e) = handle.await {
            tracing::error!("Worker task failed: {}", e);
        }
    }

    queue.shutdown()?;
    Ok(())
}
