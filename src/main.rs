// =============================================================================
// tapeflow — live US-equity trade ingestion and fan-out service
// =============================================================================
//
// Maintains an in-memory, deduplicated, time-classified view of today's and
// the next session's trades from a live WebSocket feed plus a resumable REST
// backfill, and serves it to subscribers over gRPC streaming and a REST API.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregate;
mod api;
mod backfill;
mod calendar;
mod feed;
mod live_model;
mod rpc;
mod runtime_config;
mod scheduler;
mod supervisor;
mod timeframe;
mod types;
mod universe;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::runtime_config::RuntimeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("tapeflow starting up");

    let config_path =
        std::env::var("TAPEFLOW_CONFIG").unwrap_or_else(|_| "tapeflow.json".into());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();

    // ── 2. Run the supervisor until a signal or a fatal error ────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(8);
    let mut supervisor = tokio::spawn(supervisor::run(config, shutdown_tx.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received; stopping gracefully");
            let _ = shutdown_tx.send(());
            match supervisor.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %format!("{e:#}"), "supervisor exited with error"),
                Err(e) => error!(error = %e, "supervisor panicked"),
            }
        }
        result = &mut supervisor => {
            // Startup fatals and background failures land here.
            result.context("supervisor panicked")??;
        }
    }

    info!("tapeflow shut down complete");
    Ok(())
}
