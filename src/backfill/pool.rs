// =============================================================================
// Backfill Pool — bounded, rate-limited per-symbol history workers
// =============================================================================
//
// Fills [previous trading day 16:00 ET, now] for every symbol in universe
// order, resuming from the per-symbol cache across restarts. A fixed worker
// count bounds concurrency and a shared ticker bounds fetch starts to one
// per `rate` interval; together they cap external API load.
//
// The whole universe is re-scanned every five minutes. The WebSocket covers
// the live gap, so coverage between rescans only improves. Inserts go
// through `add_batch`, which does not notify subscribers: backfilled trades
// reach subscribers via the snapshot phase of the fan-out protocol.
// =============================================================================

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::backfill::BackfillCache;
use crate::feed::wire::WireTrade;
use crate::feed::FeedRestClient;
use crate::live_model::LiveModel;
use crate::scheduler::SharedDates;
use crate::timeframe;
use crate::types::{parse_numeric_id, DedupKey, TradeRecord};
use crate::universe::{SymbolEntry, SymbolUniverse};

/// Full-universe rescan period.
const RESCAN_INTERVAL: Duration = Duration::from_secs(300);

pub struct BackfillPool {
    client: Arc<FeedRestClient>,
    cache: Arc<BackfillCache>,
    universe: Arc<SymbolUniverse>,
    model: Arc<LiveModel>,
    dates: SharedDates,
    workers: usize,
    rate: Duration,
}

impl BackfillPool {
    pub fn new(
        client: Arc<FeedRestClient>,
        cache: Arc<BackfillCache>,
        universe: Arc<SymbolUniverse>,
        model: Arc<LiveModel>,
        dates: SharedDates,
        workers: usize,
        rate_ms: u64,
    ) -> Self {
        Self {
            client,
            cache,
            universe,
            model,
            dates,
            workers: workers.max(1),
            rate: Duration::from_millis(rate_ms.max(1)),
        }
    }

    /// Run scan-sleep cycles until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: broadcast::Sender<()>) {
        let mut shutdown_rx = shutdown.subscribe();
        loop {
            info!(symbols = self.universe.len(), "backfill scan starting");
            self.clone().run_scan(&shutdown).await;
            debug!("backfill scan complete");

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("backfill pool stopping on shutdown");
                    return;
                }
                _ = tokio::time::sleep(RESCAN_INTERVAL) => {}
            }
        }
    }

    /// One pass over the whole universe: workers pull symbols from a shared
    /// queue in universe order, pacing fetch starts on a shared ticker.
    async fn run_scan(self: Arc<Self>, shutdown: &broadcast::Sender<()>) {
        let queue: Arc<Mutex<VecDeque<SymbolEntry>>> = Arc::new(Mutex::new(
            self.universe.entries().iter().cloned().collect(),
        ));
        let ticker = Arc::new(tokio::sync::Mutex::new(tokio::time::interval(self.rate)));

        let mut handles = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let pool = self.clone();
            let queue = queue.clone();
            let ticker = ticker.clone();
            let mut shutdown_rx = shutdown.subscribe();

            handles.push(tokio::spawn(async move {
                loop {
                    // Stop picking new symbols once shutdown is requested;
                    // an in-flight fetch below still runs to completion.
                    if !matches!(
                        shutdown_rx.try_recv(),
                        Err(broadcast::error::TryRecvError::Empty)
                    ) {
                        return;
                    }

                    let Some(entry) = queue.lock().pop_front() else {
                        return;
                    };

                    // One fetch start per tick, shared across all workers.
                    tokio::select! {
                        _ = shutdown_rx.recv() => return,
                        _ = async { ticker.lock().await.tick().await; } => {}
                    }

                    if let Err(e) = pool.backfill_symbol(&entry).await {
                        warn!(
                            symbol = %entry.symbol,
                            error = %e,
                            "backfill attempt failed; retrying at next rescan"
                        );
                    }
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Fetch and insert one symbol's missing history. Errors abort only
    /// this symbol's attempt.
    async fn backfill_symbol(&self, entry: &SymbolEntry) -> Result<()> {
        let (target_date, window_start_ms) = {
            let d = self.dates.read();
            (d.current, timeframe::today_cutoff_ms(d.previous))
        };

        let cached = self.cache.read(target_date, &entry.symbol)?;
        let start_shifted = resume_start_ms(&cached, window_start_ms);
        let start_utc_ms = timeframe::utc_from_shifted_ms(start_shifted).timestamp_millis();
        let end_utc_ms = Utc::now().timestamp_millis();
        if start_utc_ms >= end_utc_ms {
            return Ok(());
        }

        let fetched = self
            .client
            .fetch_trades(&entry.symbol, start_utc_ms, end_utc_ms)
            .await?;

        let batch = prepare_batch(cached, fetched);
        if !batch.fresh.is_empty() {
            self.cache.append(target_date, &entry.symbol, &batch.fresh)?;
        }
        let inserted = self
            .model
            .add_batch(batch.records, &batch.numeric_ids, entry.is_index);

        debug!(
            symbol = %entry.symbol,
            fresh = batch.fresh.len(),
            inserted,
            "symbol backfilled"
        );
        Ok(())
    }
}

/// Start of the REST range in the shifted frame: the cache's maximum
/// timestamp when a cache exists, otherwise the configured window start.
fn resume_start_ms(cached: &[TradeRecord], window_start_ms: i64) -> i64 {
    cached
        .iter()
        .map(|r| r.timestamp_et_ms)
        .max()
        .unwrap_or(window_start_ms)
}

struct PreparedBatch {
    /// Fetched records not yet in the cache, to be appended.
    fresh: Vec<TradeRecord>,
    /// Everything to hand to `add_batch`: cache contents plus fresh records.
    records: Vec<TradeRecord>,
    numeric_ids: Vec<i64>,
}

/// Merge cached and freshly fetched trades into one dedup-keyed batch.
/// The model re-dedups anyway; the key set here keeps the cache file free
/// of duplicates across overlapping fetch ranges.
fn prepare_batch(cached: Vec<TradeRecord>, fetched: Vec<WireTrade>) -> PreparedBatch {
    let mut records = Vec::with_capacity(cached.len() + fetched.len());
    let mut numeric_ids = Vec::with_capacity(records.capacity());
    let mut keys: HashSet<DedupKey> = HashSet::with_capacity(cached.len());

    for record in cached {
        let Some(numeric_id) = parse_numeric_id(&record.id) else {
            warn!(symbol = %record.symbol, id = %record.id, "cached record id is not numeric; dropped");
            continue;
        };
        keys.insert(DedupKey::new(numeric_id, record.exchange.clone()));
        numeric_ids.push(numeric_id);
        records.push(record);
    }

    let mut fresh = Vec::new();
    for trade in fetched {
        if !trade.accepted() {
            continue;
        }
        let Some(numeric_id) = parse_numeric_id(&trade.id) else {
            warn!(symbol = %trade.symbol, id = %trade.id, "fetched trade id is not numeric; dropped");
            continue;
        };
        let record = trade.into_record();
        if !keys.insert(DedupKey::new(numeric_id, record.exchange.clone())) {
            continue;
        }
        fresh.push(record.clone());
        numeric_ids.push(numeric_id);
        records.push(record);
    }

    PreparedBatch {
        fresh,
        records,
        numeric_ids,
    }
}
