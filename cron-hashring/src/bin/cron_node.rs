//! Standalone cron node.
//!
//! Joins the `CROND_SERVICE` group and runs a single distributed job on the
//! `CROND_JOB_SPEC` schedule. Start several copies against the same Redis to
//! watch ownership move as nodes come and go.
//!
//! Run: REDIS_URL=redis://127.0.0.1:6379 cargo run -p cron-hashring --bin cron-node

use cron_hashring::{Backend, CrondConfig, JobRegistry, JobType};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_SERVICE: &str = "cron-node";
const DEFAULT_JOB_SPEC: &str = "* * * * *";

async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                tracing::info!("Received Ctrl+C, shutting down");
            }
            _ = terminate.recv() => tracing::info!("Received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        tracing::info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}

fn init_tracing() {
    // JSON in production for log aggregation
    let is_production = std::env::var("NODE_ENV").unwrap_or_default() == "production";
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if is_production {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let service = std::env::var("CROND_SERVICE").unwrap_or_else(|_| DEFAULT_SERVICE.into());
    let spec = std::env::var("CROND_JOB_SPEC").unwrap_or_else(|_| DEFAULT_JOB_SPEC.into());
    let config = CrondConfig::from_env()?;
    let backend = Backend::from_env()?;

    tracing::info!(
        service = %service,
        backend = %backend,
        update_interval_ms = config.update_interval.as_millis() as u64,
        lazy_pick = config.lazy_pick,
        "Starting cron node"
    );

    let driver = backend.connect().await?;
    let crond = JobRegistry::new(&service, driver, config).await?;

    crond.start().await?;
    let node = crond
        .node_pool()
        .node_handle()
        .ok_or("node not registered after start")?;

    let runs = Arc::new(AtomicU64::new(0));
    let job_runs = runs.clone();
    crond.add_func("heartbeat", JobType::Distributed, &spec, move || {
        let n = job_runs.fetch_add(1, Ordering::Relaxed) + 1;
        let node_id = node.id();
        async move {
            tracing::info!(node_id = %node_id, run = n, "Heartbeat ran on this node");
        }
    })?;
    tracing::info!(node_id = ?crond.node_id(), spec = %spec, "Cron node ready");

    wait_for_shutdown_signal().await?;
    crond.stop();

    tracing::info!(runs = runs.load(Ordering::Relaxed), "Cron node stopped");
    Ok(())
}
