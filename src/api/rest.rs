// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Read-only views over the Live Model for dashboards: snapshot dumps,
// bucket counts, per-symbol session statistics, and the tier-grouped movers
// selection. All endpoints live under `/api/v1/`.
//
// CORS is configured permissively for development; tighten the allowed
// origins in production.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::aggregate::{self, SymbolStats};
use crate::calendar::TradingCalendar;
use crate::live_model::LiveModel;
use crate::scheduler::SharedDates;
use crate::timeframe;
use crate::types::{Tier, TradeRecord};
use crate::universe::SymbolUniverse;

/// Shared state for every handler.
pub struct ApiContext {
    pub model: Arc<LiveModel>,
    pub universe: Arc<SymbolUniverse>,
    pub calendar: Arc<TradingCalendar>,
    pub dates: SharedDates,
    pub started_at: Instant,
}

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(ctx: Arc<ApiContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/counts", get(counts))
        .route("/api/v1/trades/today", get(trades_today))
        .route("/api/v1/trades/next", get(trades_next))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/movers", get(movers))
        .layer(cors)
        .with_state(ctx)
}

// =============================================================================
// Health & counts
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_s: u64,
    seen: usize,
    subscribers: usize,
    cutoff_et_ms: i64,
}

async fn health(State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_s: ctx.started_at.elapsed().as_secs(),
        seen: ctx.model.seen_count(),
        subscribers: ctx.model.subscriber_count(),
        cutoff_et_ms: ctx.model.cutoff_et_ms(),
    })
}

#[derive(Serialize)]
struct CountsResponse {
    today_index: usize,
    today_ex_index: usize,
    next_index: usize,
    next_ex_index: usize,
    seen: usize,
}

async fn counts(State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    let (today_index, today_ex_index, next_index, next_ex_index) = ctx.model.counts();
    Json(CountsResponse {
        today_index,
        today_ex_index,
        next_index,
        next_ex_index,
        seen: ctx.model.seen_count(),
    })
}

// =============================================================================
// Snapshot dumps
// =============================================================================

#[derive(Deserialize)]
struct TradesQuery {
    /// Drop index-constituent trades from the response.
    #[serde(default)]
    ex_index_only: bool,
}

#[derive(Serialize)]
struct TradesResponse {
    index: Vec<TradeRecord>,
    ex_index: Vec<TradeRecord>,
}

async fn trades_today(
    State(ctx): State<Arc<ApiContext>>,
    Query(query): Query<TradesQuery>,
) -> impl IntoResponse {
    let (index, ex_index) = ctx.model.today_snapshot();
    Json(TradesResponse {
        index: if query.ex_index_only { Vec::new() } else { index },
        ex_index,
    })
}

async fn trades_next(
    State(ctx): State<Arc<ApiContext>>,
    Query(query): Query<TradesQuery>,
) -> impl IntoResponse {
    let (index, ex_index) = ctx.model.next_snapshot();
    Json(TradesResponse {
        index: if query.ex_index_only { Vec::new() } else { index },
        ex_index,
    })
}

// =============================================================================
// Aggregated statistics
// =============================================================================

#[derive(Deserialize)]
struct StatsQuery {
    /// `today` (default) or `next`.
    day: Option<String>,
}

impl ApiContext {
    /// Aggregate one day-bucket's records. The session start anchors the
    /// hourly profiles at that date's 04:00 pre-market open.
    fn day_stats(&self, next: bool) -> BTreeMap<String, SymbolStats> {
        let (index, ex_index) = if next {
            self.model.next_snapshot()
        } else {
            self.model.today_snapshot()
        };

        let session_date = {
            let d = self.dates.read();
            if next {
                self.calendar.next_trading_day(d.current)
            } else {
                d.current
            }
        };
        let session_start = timeframe::pre_market_start_ms(session_date);

        let mut records = index;
        records.extend(ex_index);
        aggregate::aggregate_trades(&records, Some(session_start))
    }
}

async fn stats(
    State(ctx): State<Arc<ApiContext>>,
    Query(query): Query<StatsQuery>,
) -> impl IntoResponse {
    let next = matches!(query.day.as_deref(), Some("next"));
    Json(ctx.day_stats(next))
}

// =============================================================================
// Movers
// =============================================================================

#[derive(Serialize)]
struct MoversResponse {
    tiers: BTreeMap<Tier, Vec<String>>,
}

async fn movers(State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    let today = ctx.day_stats(false);
    let next = ctx.day_stats(true);
    let tiers = aggregate::select_movers(&today, &next, ctx.universe.tiers());
    Json(MoversResponse { tiers })
}
