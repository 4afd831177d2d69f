// =============================================================================
// Live Model — deduplicated today/next trade store with pub/sub fan-out
// =============================================================================
//
// The single source of truth for today's and the next session's trades.
// Four append-only buckets (today/next × index/ex-index), one dedup set, and
// a mutable today/next cutoff live behind one write lock; the subscriber
// registry lives behind a second. Both locks are short-held.
//
// Fan-out never blocks the ingester: subscriber channels are bounded and
// events are dropped per-subscriber when a buffer is full. Publishing
// happens while the bucket lock is still held so that every subscriber
// observes inserts in Add order and a snapshot taken after Add returns
// always contains the new record.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{parse_numeric_id, DedupKey, LiveTradeEvent, TradeRecord};

struct Buckets {
    today_index: Vec<TradeRecord>,
    today_ex_index: Vec<TradeRecord>,
    next_index: Vec<TradeRecord>,
    next_ex_index: Vec<TradeRecord>,
    /// Exactly the keys of every record currently in the four buckets.
    seen: HashSet<DedupKey>,
    /// Records with `timestamp_et_ms <= cutoff` belong to today.
    cutoff_et_ms: i64,
}

/// Process-local live trade store. All other components interact with the
/// buckets, dedup set, and subscribers exclusively through these operations.
pub struct LiveModel {
    buckets: RwLock<Buckets>,
    subs: Mutex<HashMap<u64, mpsc::Sender<LiveTradeEvent>>>,
    next_sub_id: AtomicU64,
}

impl LiveModel {
    /// Construct an empty model with the given initial today/next cutoff.
    pub fn new(cutoff_et_ms: i64) -> Self {
        Self {
            buckets: RwLock::new(Buckets {
                today_index: Vec::new(),
                today_ex_index: Vec::new(),
                next_index: Vec::new(),
                next_ex_index: Vec::new(),
                seen: HashSet::new(),
                cutoff_et_ms,
            }),
            subs: Mutex::new(HashMap::new()),
            next_sub_id: AtomicU64::new(1),
        }
    }

    // -------------------------------------------------------------------------
    // Inserts
    // -------------------------------------------------------------------------

    /// Insert one live trade. Returns `false` without mutating anything when
    /// the `(numeric_id, exchange)` key is already present. On success the
    /// record lands in the bucket selected by `(is_index, ts <= cutoff)` and
    /// the event is fanned out to every current subscriber without blocking.
    pub fn add(&self, record: TradeRecord, numeric_id: i64, is_index: bool) -> bool {
        let mut g = self.buckets.write();

        let key = DedupKey::new(numeric_id, record.exchange.clone());
        if !g.seen.insert(key) {
            return false;
        }

        let is_today = record.timestamp_et_ms <= g.cutoff_et_ms;
        let event = LiveTradeEvent {
            record: record.clone(),
            is_index,
            is_today,
        };
        match (is_index, is_today) {
            (true, true) => g.today_index.push(record),
            (true, false) => g.next_index.push(record),
            (false, true) => g.today_ex_index.push(record),
            (false, false) => g.next_ex_index.push(record),
        }

        // Publish while still holding the bucket lock: subscribers see events
        // in Add order and never ahead of a snapshot. try_send keeps this
        // non-blocking regardless of subscriber backlog.
        self.publish(event);
        true
    }

    /// Bulk insert used only by the backfill pool. Identical to [`add`] per
    /// element except that subscribers are NOT notified: backfilled trades
    /// reach new subscribers through the snapshot phase, and re-publishing
    /// would double-deliver. Returns the number of records inserted.
    pub fn add_batch(
        &self,
        records: Vec<TradeRecord>,
        numeric_ids: &[i64],
        is_index: bool,
    ) -> usize {
        let mut g = self.buckets.write();
        let mut inserted = 0;

        for (record, &numeric_id) in records.into_iter().zip(numeric_ids) {
            let key = DedupKey::new(numeric_id, record.exchange.clone());
            if !g.seen.insert(key) {
                continue;
            }
            let is_today = record.timestamp_et_ms <= g.cutoff_et_ms;
            match (is_index, is_today) {
                (true, true) => g.today_index.push(record),
                (true, false) => g.next_index.push(record),
                (false, true) => g.today_ex_index.push(record),
                (false, false) => g.next_ex_index.push(record),
            }
            inserted += 1;
        }

        inserted
    }

    // -------------------------------------------------------------------------
    // Snapshot readers
    // -------------------------------------------------------------------------

    /// Independent copies of the today buckets `(index, ex_index)`. Callers
    /// may retain and iterate without any lock.
    pub fn today_snapshot(&self) -> (Vec<TradeRecord>, Vec<TradeRecord>) {
        let g = self.buckets.read();
        (g.today_index.clone(), g.today_ex_index.clone())
    }

    /// Independent copies of the next-day buckets `(index, ex_index)`.
    pub fn next_snapshot(&self) -> (Vec<TradeRecord>, Vec<TradeRecord>) {
        let g = self.buckets.read();
        (g.next_index.clone(), g.next_ex_index.clone())
    }

    /// Bucket lengths `(today_index, today_ex_index, next_index,
    /// next_ex_index)` for status lines.
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        let g = self.buckets.read();
        (
            g.today_index.len(),
            g.today_ex_index.len(),
            g.next_index.len(),
            g.next_ex_index.len(),
        )
    }

    /// Number of distinct dedup keys held.
    pub fn seen_count(&self) -> usize {
        self.buckets.read().seen.len()
    }

    /// Current today/next cutoff in the shifted frame.
    pub fn cutoff_et_ms(&self) -> i64 {
        self.buckets.read().cutoff_et_ms
    }

    // -------------------------------------------------------------------------
    // Day switch
    // -------------------------------------------------------------------------

    /// Atomic day transition: discard today, promote next to today, clear
    /// next, replace the cutoff, and rebuild the dedup set from the
    /// surviving records so that stale keys free memory.
    ///
    /// The cutoff only moves forward; a repeated call with the same cutoff
    /// is a no-op.
    pub fn switch_day(&self, new_cutoff_et_ms: i64) {
        let mut g = self.buckets.write();

        if new_cutoff_et_ms <= g.cutoff_et_ms {
            warn!(
                new_cutoff = new_cutoff_et_ms,
                current_cutoff = g.cutoff_et_ms,
                "day switch ignored: cutoff would not advance"
            );
            return;
        }

        let promoted_index = std::mem::take(&mut g.next_index);
        let promoted_ex_index = std::mem::take(&mut g.next_ex_index);
        let retired_today = g.today_index.len() + g.today_ex_index.len();

        g.today_index = promoted_index;
        g.today_ex_index = promoted_ex_index;
        g.cutoff_et_ms = new_cutoff_et_ms;

        let mut seen = HashSet::with_capacity(g.today_index.len() + g.today_ex_index.len());
        for record in g.today_index.iter().chain(g.today_ex_index.iter()) {
            match parse_numeric_id(&record.id) {
                Some(numeric_id) => {
                    seen.insert(DedupKey::new(numeric_id, record.exchange.clone()));
                }
                None => warn!(
                    symbol = %record.symbol,
                    id = %record.id,
                    "surviving record has unparseable id; dropped from dedup set"
                ),
            }
        }
        g.seen = seen;

        debug!(
            retired = retired_today,
            promoted = g.today_index.len() + g.today_ex_index.len(),
            cutoff = new_cutoff_et_ms,
            "day switched"
        );
        debug_assert!(
            g.seen.len() == g.today_index.len() + g.today_ex_index.len(),
            "dedup set diverged from buckets after day switch"
        );
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Register a subscriber with a bounded event buffer. Events that arrive
    /// while the buffer is full are dropped for this subscriber only.
    pub fn subscribe(&self, buf: usize) -> (u64, mpsc::Receiver<LiveTradeEvent>) {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(buf.max(1));
        self.subs.lock().insert(id, tx);
        debug!(sub_id = id, buf, "subscriber registered");
        (id, rx)
    }

    /// Remove a subscriber; dropping its sender closes the channel.
    pub fn unsubscribe(&self, id: u64) {
        if self.subs.lock().remove(&id).is_some() {
            debug!(sub_id = id, "subscriber removed");
        }
    }

    /// Close every subscriber channel (process shutdown).
    pub fn close_all_subscribers(&self) {
        let mut subs = self.subs.lock();
        let n = subs.len();
        subs.clear();
        if n > 0 {
            debug!(count = n, "all subscriber channels closed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.lock().len()
    }

    fn publish(&self, event: LiveTradeEvent) {
        let mut subs = self.subs.lock();
        if subs.is_empty() {
            return;
        }

        let mut closed: Vec<u64> = Vec::new();
        for (&id, tx) in subs.iter() {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow subscriber: the event is dropped for it alone.
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
            }
        }
        for id in closed {
            subs.remove(&id);
        }
    }

    // -------------------------------------------------------------------------
    // Self check
    // -------------------------------------------------------------------------

    /// Verify the model invariants. Violations are bugs; callers report them
    /// (and tests fail on them) rather than swallowing.
    pub fn self_check(&self) -> Result<(), String> {
        let g = self.buckets.read();

        let total = g.today_index.len()
            + g.today_ex_index.len()
            + g.next_index.len()
            + g.next_ex_index.len();
        if g.seen.len() != total {
            return Err(format!(
                "dedup set size {} != bucket total {}",
                g.seen.len(),
                total
            ));
        }

        for r in g.today_index.iter().chain(g.today_ex_index.iter()) {
            if r.timestamp_et_ms > g.cutoff_et_ms {
                return Err(format!(
                    "record {} at {} beyond cutoff {} found in a today bucket",
                    r.id, r.timestamp_et_ms, g.cutoff_et_ms
                ));
            }
        }
        for r in g.next_index.iter().chain(g.next_ex_index.iter()) {
            if r.timestamp_et_ms <= g.cutoff_et_ms {
                return Err(format!(
                    "record {} at {} within cutoff {} found in a next bucket",
                    r.id, r.timestamp_et_ms, g.cutoff_et_ms
                ));
            }
        }

        Ok(())
    }
}
