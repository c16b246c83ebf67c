//! Skvil-Piertotum worker
//!
//! Standalone worker process: registers with the broker, keeps its
//! registration alive, and shuts down gracefully. A standalone process has
//! no coding-agent runtime behind it, so it runs with the [`NoSampling`]
//! provider; with `AUTO_PROCESS=true` the autonomous loop disables itself
//! on its first poll. Embedding hosts construct [`WorkerRuntime`] with a
//! real sampling provider instead.

use anyhow::Result;
use clap::Parser;
use skvil_piertotum::config::WorkerConfig;
use skvil_piertotum::worker::lifecycle::WorkerRuntime;
use skvil_piertotum::worker::sampling::NoSampling;
use std::sync::Arc;
use tracing::{error, info};

/// Skvil-Piertotum worker - broker sidecar for one coding-agent instance
#[derive(Parser)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("skvil_piertotum=info".parse()?),
        )
        .init();
    Args::parse();

    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid worker configuration");
            return Err(err.into());
        }
    };
    info!(agent = %config.agent_id, broker = %config.broker_url, "starting worker");

    let runtime = WorkerRuntime::start(config, Arc::new(NoSampling)).await;

    shutdown_signal().await;
    info!("shutdown signal received");
    runtime.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
