//! Skvil-Piertotum broker
//!
//! Central coordination server: REST surface, stale-agent reaper, and the
//! interactive operator console, all over one shared state engine.

use anyhow::Result;
use clap::Parser;
use skvil_piertotum::broker::state::BrokerState;
use skvil_piertotum::broker::{console, reaper, rest_api};
use skvil_piertotum::config::BrokerConfig;
use skvil_piertotum::time_provider::system_time_provider;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Skvil-Piertotum broker - coordination hub for coding-agent instances
#[derive(Parser)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Listen port (BROKER_PORT takes precedence; default 4800)
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("skvil_piertotum=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = BrokerConfig::from_env(args.port);

    let state = Arc::new(BrokerState::new(system_time_provider()));
    let shutdown = CancellationToken::new();
    let reaper_task = reaper::spawn(
        state.clone(),
        config.reaper_period,
        config.stale_threshold,
        shutdown.clone(),
    );
    let console_task = console::spawn(state.clone(), shutdown.clone());

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(addr = %listener.local_addr()?, "broker listening");

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_shutdown.cancel();
    });

    rest_api::serve(listener, rest_api::create_app(state), shutdown.clone()).await?;

    shutdown.cancel();
    let _ = reaper_task.await;
    let _ = console_task.await;
    info!("broker stopped");
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
