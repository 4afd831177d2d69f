// =============================================================================
// Trade Aggregator — per-symbol session statistics
// =============================================================================
//
// A pure pipeline over a slice of trade records plus an optional session
// start. No I/O, no shared state; the pipeline sorts its input, so the
// result is invariant under permutation of the records.
//
// Stage order per symbol: sort → first pass (OHLC, count, turnover) → vwap
// → outlier trim (1% price-rank AND 3x-vwap, only at 100+ trades) → temporal
// max gain/loss → drawdown from the gain peak → window vwap between the
// gain/loss indices → vwap-normalised metrics → price-volume profile →
// hourly profiles.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;

use crate::types::{Tier, TradeRecord};

/// Share-volume histogram over price, bucketed at 1% of the effective vwap.
#[derive(Debug, Clone, Serialize)]
pub struct PriceProfile {
    /// Price of the lowest bucket's left edge.
    pub low: f64,
    pub bucket_width: f64,
    pub volume: Vec<i64>,
}

/// Price-volume profile restricted to one clock-hour period of the session.
#[derive(Debug, Clone, Serialize)]
pub struct HourlyProfile {
    /// Hour periods since the session start, 0-based, capped at 20 periods.
    pub hour: usize,
    pub volume: Vec<i64>,
}

/// Full per-symbol statistics for one session's records.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolStats {
    pub symbol: String,
    pub trades: u64,
    pub total_shares: i64,
    pub turnover: f64,
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub vwap: f64,
    /// Largest rise from a preceding low, normalised by the effective vwap.
    pub max_gain: f64,
    /// Largest fall from a preceding high, normalised by the effective vwap.
    pub max_loss: f64,
    /// True when the max-gain point precedes (or equals) the max-loss point.
    pub gain_first: bool,
    pub close_gain: f64,
    pub max_drawdown: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<PriceProfile>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hourly: Vec<HourlyProfile>,
}

/// Outlier trimming only engages at this many trades.
const OUTLIER_MIN_TRADES: usize = 100;
/// Hard cap on profile bucket count; the top bucket absorbs the overflow.
const MAX_PROFILE_BUCKETS: usize = 500;
/// Hourly profiles cover at most this many hour periods.
const MAX_HOUR_PERIODS: usize = 20;

/// Aggregate every symbol present in `records`. Results are keyed and
/// ordered by symbol.
pub fn aggregate_trades(
    records: &[TradeRecord],
    session_start_et_ms: Option<i64>,
) -> BTreeMap<String, SymbolStats> {
    let mut by_symbol: BTreeMap<&str, Vec<&TradeRecord>> = BTreeMap::new();
    for r in records {
        by_symbol.entry(r.symbol.as_str()).or_default().push(r);
    }

    by_symbol
        .into_iter()
        .filter_map(|(symbol, group)| {
            aggregate_symbol(symbol, &group, session_start_et_ms)
                .map(|stats| (symbol.to_string(), stats))
        })
        .collect()
}

/// Aggregate a single symbol's records. Returns `None` for an empty slice.
pub fn aggregate_symbol(
    symbol: &str,
    records: &[&TradeRecord],
    session_start_et_ms: Option<i64>,
) -> Option<SymbolStats> {
    if records.is_empty() {
        return None;
    }

    let mut sorted: Vec<&TradeRecord> = records.to_vec();
    sorted.sort_by_key(|r| r.timestamp_et_ms);
    let n = sorted.len();

    // -- First pass: basic accumulators over every record --------------------
    let mut total_shares: i64 = 0;
    let mut turnover = 0.0;
    let mut high = f64::MIN;
    let mut low = f64::MAX;
    for r in &sorted {
        total_shares += r.size_shares;
        turnover += r.price * r.size_shares as f64;
        high = high.max(r.price);
        low = low.min(r.price);
    }
    let open = sorted[0].price;
    let close = sorted[n - 1].price;

    let mut stats = SymbolStats {
        symbol: symbol.to_string(),
        trades: n as u64,
        total_shares,
        turnover,
        open,
        close,
        high,
        low,
        vwap: 0.0,
        max_gain: 0.0,
        max_loss: 0.0,
        gain_first: false,
        close_gain: 0.0,
        max_drawdown: 0.0,
        profile: None,
        hourly: Vec::new(),
    };

    if total_shares == 0 {
        return Some(stats);
    }
    let vwap = turnover / total_shares as f64;
    stats.vwap = vwap;

    // -- Outlier trim: 1% price-rank tail AND 3x beyond vwap ------------------
    let mut outlier = vec![false; n];
    if n >= OUTLIER_MIN_TRADES {
        let mut by_price: Vec<usize> = (0..n).collect();
        by_price.sort_by(|&a, &b| {
            sorted[a]
                .price
                .partial_cmp(&sorted[b].price)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let tail = n / 100;
        for &i in by_price.iter().take(tail) {
            if sorted[i].price < vwap / 3.0 {
                outlier[i] = true;
            }
        }
        for &i in by_price.iter().rev().take(tail) {
            if sorted[i].price > vwap * 3.0 {
                outlier[i] = true;
            }
        }
    }
    let trimmed_any = outlier.iter().any(|&o| o);

    // -- Second pass: temporal max gain / max loss over non-outliers ----------
    let mut min_so_far = f64::MAX;
    let mut max_so_far = f64::MIN;
    let mut best_gain = 0.0;
    let mut gain_idx: Option<usize> = None;
    let mut best_loss = 0.0;
    let mut loss_idx: Option<usize> = None;
    let mut trimmed_high = f64::MIN;
    let mut trimmed_low = f64::MAX;

    for (i, r) in sorted.iter().enumerate() {
        if outlier[i] {
            continue;
        }
        min_so_far = min_so_far.min(r.price);
        max_so_far = max_so_far.max(r.price);
        trimmed_high = trimmed_high.max(r.price);
        trimmed_low = trimmed_low.min(r.price);

        let gain = r.price - min_so_far;
        if gain > best_gain {
            best_gain = gain;
            gain_idx = Some(i);
        }
        let loss = max_so_far - r.price;
        if loss > best_loss {
            best_loss = loss;
            loss_idx = Some(i);
        }
    }
    if trimmed_any {
        stats.high = trimmed_high;
        stats.low = trimmed_low;
    }

    stats.gain_first = match (gain_idx, loss_idx) {
        (Some(g), Some(l)) => g <= l,
        _ => false,
    };

    // -- Max drawdown: minimum non-outlier price from the gain peak onward ----
    let drawdown = gain_idx.map_or(0.0, |g| {
        let peak = sorted[g].price;
        let min_after = sorted[g..]
            .iter()
            .enumerate()
            .filter(|(off, _)| !outlier[g + off])
            .map(|(_, r)| r.price)
            .fold(f64::MAX, f64::min);
        peak - min_after
    });

    // -- Window vwap between the gain and loss indices ------------------------
    let window_vwap = match (gain_idx, loss_idx) {
        (Some(g), Some(l)) if g != l => {
            let (lo, hi) = if g < l { (g, l) } else { (l, g) };
            let mut shares = 0i64;
            let mut value = 0.0;
            for i in lo..=hi {
                if outlier[i] {
                    continue;
                }
                shares += sorted[i].size_shares;
                value += sorted[i].price * sorted[i].size_shares as f64;
            }
            if shares > 0 {
                value / shares as f64
            } else {
                0.0
            }
        }
        _ => 0.0,
    };
    let effective_vwap = if window_vwap > 0.0 { window_vwap } else { vwap };

    // -- Normalised metrics ---------------------------------------------------
    if effective_vwap > 0.0 {
        stats.max_gain = best_gain / effective_vwap;
        stats.max_loss = best_loss / effective_vwap;
        stats.close_gain = (stats.close - stats.low).max(0.0) / effective_vwap;
        stats.max_drawdown = drawdown.max(0.0) / effective_vwap;
    }

    // -- Price-volume profile at 1% of the effective vwap ---------------------
    let bucket_width = effective_vwap / 100.0;
    if bucket_width > 0.0 {
        let profile_low = stats.low;
        let span = stats.high - profile_low;
        let n_buckets = ((span / bucket_width).ceil() as usize)
            .clamp(1, MAX_PROFILE_BUCKETS);

        let bucket_of = move |price: f64| -> usize {
            let idx = ((price - profile_low) / bucket_width).floor();
            (idx.max(0.0) as usize).min(n_buckets - 1)
        };

        let mut volume = vec![0i64; n_buckets];
        for (i, r) in sorted.iter().enumerate() {
            if !outlier[i] {
                volume[bucket_of(r.price)] += r.size_shares;
            }
        }
        stats.profile = Some(PriceProfile {
            low: profile_low,
            bucket_width,
            volume,
        });

        // -- Hourly profiles, floored to clock-hour periods from the start ---
        if let Some(session_start) = session_start_et_ms {
            let mut hours: BTreeMap<usize, Vec<i64>> = BTreeMap::new();
            for (i, r) in sorted.iter().enumerate() {
                if outlier[i] {
                    continue;
                }
                let hour = ((r.timestamp_et_ms - session_start) / 3_600_000)
                    .clamp(0, MAX_HOUR_PERIODS as i64 - 1) as usize;
                hours.entry(hour).or_insert_with(|| vec![0i64; n_buckets])
                    [bucket_of(r.price)] += r.size_shares;
            }
            stats.hourly = hours
                .into_iter()
                .map(|(hour, volume)| HourlyProfile { hour, volume })
                .collect();
        }
    }

    Some(stats)
}

// =============================================================================
// Movers selection (API layer)
// =============================================================================

/// Gate for a symbol to stay in its tier at all.
fn qualifies(stats: &SymbolStats) -> bool {
    stats.max_gain >= 0.10 && stats.trades >= 500
}

fn top_n_by<F>(candidates: &[&SymbolStats], n: usize, key: F) -> Vec<String>
where
    F: Fn(&SymbolStats) -> f64,
{
    let mut ranked: Vec<&SymbolStats> = candidates.to_vec();
    ranked.sort_by(|a, b| {
        key(b)
            .partial_cmp(&key(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked.iter().take(n).map(|s| s.symbol.clone()).collect()
}

/// Per-tier retention: symbols that qualify in at least one of the two
/// day-sessions, reduced to the union of the top-N by trade count, turnover,
/// and max gain across both sessions. N is 5 for the highest-activity tier
/// and 8 for the other two.
pub fn select_movers(
    today: &BTreeMap<String, SymbolStats>,
    next: &BTreeMap<String, SymbolStats>,
    tiers: &HashMap<String, Tier>,
) -> BTreeMap<Tier, Vec<String>> {
    let mut selection: BTreeMap<Tier, Vec<String>> = BTreeMap::new();

    for tier in [Tier::Active, Tier::Moderate, Tier::Sporadic] {
        let n = match tier {
            Tier::Active => 5,
            Tier::Moderate | Tier::Sporadic => 8,
        };

        let in_tier = |sym: &str| tiers.get(sym).copied() == Some(tier);
        let qualified: BTreeSet<&str> = today
            .values()
            .chain(next.values())
            .filter(|s| in_tier(&s.symbol) && qualifies(s))
            .map(|s| s.symbol.as_str())
            .collect();

        let mut keep: BTreeSet<String> = BTreeSet::new();
        for session in [today, next] {
            let candidates: Vec<&SymbolStats> = session
                .values()
                .filter(|s| qualified.contains(s.symbol.as_str()))
                .collect();
            keep.extend(top_n_by(&candidates, n, |s| s.trades as f64));
            keep.extend(top_n_by(&candidates, n, |s| s.turnover));
            keep.extend(top_n_by(&candidates, n, |s| s.max_gain));
        }

        selection.insert(tier, keep.into_iter().collect());
    }

    selection
}
