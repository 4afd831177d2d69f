// =============================================================================
// Lifecycle Supervisor — ordered startup, readiness, shutdown fan-out
// =============================================================================
//
// Start order: calendar + universe (startup fatal on error) → live model
// with the initial cutoff → stream ingester → readiness → backfill pool,
// day-switch scheduler, REST and gRPC listeners, status line. Listeners
// bind only after the stream is live.
//
// Transient errors never reach this level; components absorb them. What
// arrives here is either a startup fatal (surfaced before readiness) or a
// background task failing/panicking, which triggers a full shutdown.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::api::{self, ApiContext};
use crate::backfill::pool::BackfillPool;
use crate::backfill::BackfillCache;
use crate::calendar::TradingCalendar;
use crate::feed::{stream, FeedRestClient};
use crate::live_model::LiveModel;
use crate::rpc::{self, TradeStreamService};
use crate::runtime_config::RuntimeConfig;
use crate::scheduler;
use crate::timeframe;
use crate::universe::SymbolUniverse;

/// Status-line period.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Run the whole service until shutdown. Returns `Err` for startup fatals
/// and for background tasks that fail outside an ordered shutdown.
pub async fn run(config: RuntimeConfig, shutdown: broadcast::Sender<()>) -> Result<()> {
    config.validate()?;

    let calendar = Arc::new(TradingCalendar::load(&config.data_dir)?);
    let universe = Arc::new(SymbolUniverse::load(&config.data_dir)?);
    if universe.is_empty() {
        anyhow::bail!("symbol universe is empty");
    }

    let dates = Arc::new(RwLock::new(scheduler::initial_dates(
        timeframe::now_et().naive_local(),
        &calendar,
    )));
    let initial_cutoff = timeframe::today_cutoff_ms(dates.read().current);
    let model = Arc::new(LiveModel::new(initial_cutoff));
    info!(
        date = %dates.read().current,
        cutoff = initial_cutoff,
        "live model constructed"
    );

    let mut tasks: JoinSet<(&'static str, Result<()>)> = JoinSet::new();

    // --- Stream ingester (gates readiness) -----------------------------------
    let (ready_tx, ready_rx) = oneshot::channel();
    {
        let endpoint = config.stream_endpoint.clone();
        let api_key = config.credentials.key.clone();
        let universe = universe.clone();
        let model = model.clone();
        let shutdown_rx = shutdown.subscribe();
        tasks.spawn(async move {
            (
                "ingester",
                stream::run_ingester(endpoint, api_key, universe, model, shutdown_rx, ready_tx)
                    .await,
            )
        });
    }

    // Nothing binds until the stream is live.
    tokio::select! {
        ready = ready_rx => {
            ready.context("ingester exited before the stream became ready")?;
        }
        Some(joined) = tasks.join_next() => {
            let (name, result) = joined.context("ingester task panicked")?;
            let detail = match result {
                Err(e) => format!("{e:#}"),
                Ok(()) => "exited".to_string(),
            };
            anyhow::bail!("{name} failed before readiness: {detail}");
        }
    }
    info!("trade stream live; starting backfill, scheduler, and listeners");

    // --- Backfill pool --------------------------------------------------------
    let cache = Arc::new(BackfillCache::new(&config.data_dir));
    {
        let client = Arc::new(FeedRestClient::new(
            config.rest_endpoint.clone(),
            config.credentials.key.clone(),
            config.credentials.secret.clone(),
        ));
        let pool = Arc::new(BackfillPool::new(
            client,
            cache.clone(),
            universe.clone(),
            model.clone(),
            dates.clone(),
            config.backfill_workers,
            config.backfill_rate_ms,
        ));
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            pool.run(shutdown).await;
            ("backfill", Ok(()))
        });
    }

    // --- Day-switch scheduler -------------------------------------------------
    {
        let model = model.clone();
        let cache = cache.clone();
        let calendar = calendar.clone();
        let dates = dates.clone();
        let shutdown_rx = shutdown.subscribe();
        tasks.spawn(async move {
            scheduler::run_scheduler(model, cache, calendar, dates, shutdown_rx).await;
            ("scheduler", Ok(()))
        });
    }

    // --- REST listener ---------------------------------------------------------
    {
        let ctx = Arc::new(ApiContext {
            model: model.clone(),
            universe: universe.clone(),
            calendar: calendar.clone(),
            dates: dates.clone(),
            started_at: Instant::now(),
        });
        let app = api::router(ctx);
        let listener = tokio::net::TcpListener::bind(&config.http_listen)
            .await
            .with_context(|| format!("failed to bind HTTP listener on {}", config.http_listen))?;
        info!(addr = %config.http_listen, "REST API listening");

        let mut shutdown_rx = shutdown.subscribe();
        tasks.spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .context("REST server failed");
            ("rest", result)
        });
    }

    // --- gRPC fan-out ----------------------------------------------------------
    {
        let addr: std::net::SocketAddr = config
            .grpc_listen
            .parse()
            .with_context(|| format!("invalid grpc_listen address {}", config.grpc_listen))?;
        let service = TradeStreamService::new(model.clone(), shutdown.clone());
        let shutdown_rx = shutdown.subscribe();
        tasks.spawn(async move { ("grpc", rpc::serve(addr, service, shutdown_rx).await) });
    }

    // --- Status line -----------------------------------------------------------
    {
        let model = model.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tasks.spawn(async move {
            let mut interval = tokio::time::interval(STATUS_INTERVAL);
            interval.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => return ("status", Ok(())),
                    _ = interval.tick() => {
                        let (today_index, today_ex_index, next_index, next_ex_index) =
                            model.counts();
                        info!(
                            today_index,
                            today_ex_index,
                            next_index,
                            next_ex_index,
                            seen = model.seen_count(),
                            subscribers = model.subscriber_count(),
                            "live model status"
                        );
                        if let Err(violation) = model.self_check() {
                            error!(%violation, "live model invariant violated");
                        }
                    }
                }
            }
        });
    }

    // --- Supervision ------------------------------------------------------------
    let mut failure: Option<anyhow::Error> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(()))) => info!(task = name, "task finished"),
            Ok((name, Err(e))) => {
                error!(task = name, error = %format!("{e:#}"), "task failed; shutting down");
                failure.get_or_insert(e.context(format!("{name} task failed")));
                let _ = shutdown.send(());
            }
            Err(e) => {
                error!(error = %e, "background task panicked; shutting down");
                failure.get_or_insert(anyhow::anyhow!("background task panicked: {e}"));
                let _ = shutdown.send(());
            }
        }
    }

    model.close_all_subscribers();
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
