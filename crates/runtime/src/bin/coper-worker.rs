//! coper-worker: runs runner loops against the configured broker and
//! coordination store until SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use coper_core::config::{load_dotenv, Config};
use coper_runtime::{OperatorRegistry, RunnerPool};

// ── CLI ─────────────────────────────────────────────────────────────

/// Coper worker: executes dispatched task-graph nodes.
#[derive(Parser, Debug)]
#[command(name = "coper-worker", version, about)]
struct Cli {
    /// Config profile; keys resolve as `<PROFILE>_<KEY>` first.
    #[arg(long, env = "COPER_PROFILE")]
    profile: Option<String>,

    /// Number of runner loops. Overrides WORKER_CONCURRENCY.
    #[arg(long)]
    concurrency: Option<u32>,

    /// Messages fetched per poll. Overrides WORKER_POLL_BATCH.
    #[arg(long)]
    poll_batch: Option<u32>,

    /// Seconds to wait for runners to drain on shutdown.
    /// Overrides WORKER_SHUTDOWN_TIMEOUT_SECS.
    #[arg(long)]
    shutdown_timeout: Option<u64>,
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match cli.profile.as_deref() {
        Some(profile) => Config::for_profile(profile),
        None => Config::from_env(),
    };
    if let Some(concurrency) = cli.concurrency {
        config.worker.concurrency = concurrency;
    }
    if let Some(poll_batch) = cli.poll_batch {
        config.worker.poll_batch = poll_batch;
    }
    if let Some(timeout) = cli.shutdown_timeout {
        config.worker.shutdown_timeout_secs = timeout;
    }
    config.validate()?;
    config.log_summary();

    let registry = Arc::new(OperatorRegistry::with_builtins());
    info!(operators = registry.len(), "operator registry loaded");

    let pool = RunnerPool::new(config.clone(), registry)
        .start()
        .await?;
    info!(
        runners = pool.len(),
        shutdown_timeout = ?Duration::from_secs(config.worker.shutdown_timeout_secs),
        "coper-worker running"
    );

    pool.run_until_signal().await?;
    info!("coper-worker shutdown complete");
    Ok(())
}
