// =============================================================================
// Shared types — trade records, dedup keys, subscriber events
// =============================================================================

use serde::{Deserialize, Serialize};

/// One equity trade, fully normalised. `timestamp_et_ms` is ET-shifted
/// milliseconds (see `timeframe`); every comparison in the system assumes
/// that frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub timestamp_et_ms: i64,
    pub price: f64,
    pub size_shares: i64,
    pub exchange: String,
    pub id: String,
    pub conditions: String,
}

/// Composite dedup key. The same numeric id may occur on different
/// exchanges, so both fields are required.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct DedupKey {
    pub numeric_id: i64,
    pub exchange: String,
}

impl DedupKey {
    pub fn new(numeric_id: i64, exchange: impl Into<String>) -> Self {
        Self {
            numeric_id,
            exchange: exchange.into(),
        }
    }
}

/// Event fanned out to streaming subscribers on every accepted live insert.
#[derive(Debug, Clone)]
pub struct LiveTradeEvent {
    pub record: TradeRecord,
    pub is_index: bool,
    pub is_today: bool,
}

/// Coarse activity classification supplied by the upstream trade-universe
/// classifier. Used only by the API layer's movers selection.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    Active,
    Moderate,
    Sporadic,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Active => write!(f, "ACTIVE"),
            Tier::Moderate => write!(f, "MODERATE"),
            Tier::Sporadic => write!(f, "SPORADIC"),
        }
    }
}

// ---------------------------------------------------------------------------
// Insert filters
// ---------------------------------------------------------------------------

/// Trade exchange excluded from ingestion (off-exchange TRF prints).
const EXCLUDED_EXCHANGE: &str = "D";

/// Sale-condition characters allowed through ingestion. Anything else marks
/// the trade as non-regular and it is dropped before reaching the model.
const ALLOWED_CONDITIONS: &[char] = &[' ', '@', 'T', 'F'];

/// Size/notional filter applied by both the ingester and the backfill pool
/// before any model insert.
pub fn passes_size_filter(price: f64, size_shares: i64) -> bool {
    size_shares > 100 && price * size_shares as f64 >= 100.0
}

/// Exchange / condition-code filter table.
pub fn passes_condition_filter(exchange: &str, conditions: &str) -> bool {
    if exchange == EXCLUDED_EXCHANGE {
        return false;
    }
    conditions.chars().all(|c| ALLOWED_CONDITIONS.contains(&c))
}

/// Parse the feed's string trade id into its numeric dedup form. Done once
/// per insert; unparseable ids are dropped upstream with a warning.
pub fn parse_numeric_id(id: &str) -> Option<i64> {
    id.trim().parse::<i64>().ok()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_filter_requires_both_legs() {
        // Size must be strictly greater than 100 shares.
        assert!(!passes_size_filter(10.0, 100));
        assert!(passes_size_filter(10.0, 101));
        // Notional must be at least $100.
        assert!(!passes_size_filter(0.5, 150));
        assert!(passes_size_filter(1.0, 150));
    }

    #[test]
    fn trf_prints_are_excluded() {
        assert!(!passes_condition_filter("D", "@"));
        assert!(passes_condition_filter("N", "@"));
    }

    #[test]
    fn condition_characters_outside_allowed_set_are_dropped() {
        assert!(passes_condition_filter("N", " @TF"));
        assert!(passes_condition_filter("N", ""));
        assert!(!passes_condition_filter("N", "@I"));
        assert!(!passes_condition_filter("N", "Z"));
    }

    #[test]
    fn numeric_id_parsing() {
        assert_eq!(parse_numeric_id("52983525029461"), Some(52983525029461));
        assert_eq!(parse_numeric_id(" 42 "), Some(42));
        assert_eq!(parse_numeric_id("abc"), None);
        assert_eq!(parse_numeric_id(""), None);
    }

    #[test]
    fn dedup_key_distinguishes_exchanges() {
        let a = DedupKey::new(42, "N");
        let b = DedupKey::new(42, "Q");
        assert_ne!(a, b);
        assert_eq!(a, DedupKey::new(42, "N"));
    }
}
