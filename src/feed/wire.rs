// =============================================================================
// Feed wire formats — WebSocket event frames and REST trade pages
// =============================================================================

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::timeframe;
use crate::types::{passes_condition_filter, passes_size_filter, TradeRecord};

/// One trade as the feed serialises it, shared by the WebSocket stream and
/// the REST history endpoint. The timestamp is server-assigned UTC
/// milliseconds; conversion into the shifted frame happens in
/// [`WireTrade::into_record`] and nowhere else.
#[derive(Debug, Clone, Deserialize)]
pub struct WireTrade {
    #[serde(rename = "sym")]
    pub symbol: String,
    /// Server-assigned UTC milliseconds.
    #[serde(rename = "t")]
    pub utc_timestamp_ms: i64,
    #[serde(rename = "p")]
    pub price: f64,
    #[serde(rename = "s")]
    pub size: i64,
    #[serde(rename = "x")]
    pub exchange: String,
    #[serde(rename = "i")]
    pub id: String,
    #[serde(rename = "c", default)]
    pub conditions: String,
}

impl WireTrade {
    /// True when the trade survives the exchange/condition table and the
    /// size/notional filter. Applied before any model insert.
    pub fn accepted(&self) -> bool {
        passes_condition_filter(&self.exchange, &self.conditions)
            && passes_size_filter(self.price, self.size)
    }

    /// Convert into the canonical record, shifting the server UTC timestamp
    /// into the ET frame.
    pub fn into_record(self) -> TradeRecord {
        let utc = chrono::DateTime::from_timestamp_millis(self.utc_timestamp_ms)
            .unwrap_or_default();
        TradeRecord {
            symbol: self.symbol,
            timestamp_et_ms: timeframe::shifted_ms_from_utc(utc),
            price: self.price,
            size_shares: self.size,
            exchange: self.exchange,
            id: self.id,
            conditions: self.conditions,
        }
    }
}

/// Events carried by one WebSocket text frame.
#[derive(Debug)]
pub enum FeedEvent {
    /// Connection status: `connected`, `auth_success`, `auth_failed`, ...
    Status { status: String, message: String },
    Trade(WireTrade),
}

/// Parse one WebSocket text frame.
///
/// Frames are JSON arrays of event objects discriminated by `ev`:
/// ```json
/// [{"ev":"status","status":"auth_success","message":"authenticated"},
///  {"ev":"T","sym":"AAPL","t":1700000000123,"p":191.45,"s":250,
///   "x":"N","i":"52983525029461","c":"@"}]
/// ```
/// Unknown event kinds are skipped so that feed-side additions never break
/// the ingester.
pub fn parse_event_frame(text: &str) -> Result<Vec<FeedEvent>> {
    let values: Vec<serde_json::Value> =
        serde_json::from_str(text).context("feed frame is not a JSON array")?;

    let mut events = Vec::with_capacity(values.len());
    for value in values {
        match value.get("ev").and_then(|v| v.as_str()) {
            Some("status") => {
                let status = value
                    .get("status")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let message = value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                events.push(FeedEvent::Status { status, message });
            }
            Some("T") => {
                let trade: WireTrade = serde_json::from_value(value)
                    .context("malformed trade event in feed frame")?;
                events.push(FeedEvent::Trade(trade));
            }
            _ => {}
        }
    }
    Ok(events)
}

/// One page of the REST trade-history response.
#[derive(Debug, Deserialize)]
pub struct TradePage {
    #[serde(default)]
    pub results: Vec<WireTrade>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_frame_with_status_and_trade() {
        let frame = r#"[
            {"ev":"status","status":"auth_success","message":"authenticated"},
            {"ev":"T","sym":"AAPL","t":1700000000123,"p":191.45,"s":250,
             "x":"N","i":"52983525029461","c":"@"}
        ]"#;
        let events = parse_event_frame(frame).unwrap();
        assert_eq!(events.len(), 2);
        match &events[0] {
            FeedEvent::Status { status, .. } => assert_eq!(status, "auth_success"),
            other => panic!("expected status event, got {other:?}"),
        }
        match &events[1] {
            FeedEvent::Trade(t) => {
                assert_eq!(t.symbol, "AAPL");
                assert_eq!(t.size, 250);
                assert_eq!(t.id, "52983525029461");
            }
            other => panic!("expected trade event, got {other:?}"),
        }
    }

    #[test]
    fn unknown_event_kinds_are_skipped() {
        let frame = r#"[{"ev":"Q","sym":"AAPL","bp":191.4,"ap":191.5}]"#;
        let events = parse_event_frame(frame).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn non_array_frame_is_an_error() {
        assert!(parse_event_frame(r#"{"ev":"T"}"#).is_err());
        assert!(parse_event_frame("not json").is_err());
    }

    #[test]
    fn acceptance_applies_both_filter_tables() {
        let mut trade = WireTrade {
            symbol: "AAPL".into(),
            utc_timestamp_ms: 1_700_000_000_123,
            price: 191.45,
            size: 250,
            exchange: "N".into(),
            id: "1".into(),
            conditions: "@".into(),
        };
        assert!(trade.accepted());

        trade.exchange = "D".into();
        assert!(!trade.accepted());

        trade.exchange = "N".into();
        trade.conditions = "I".into();
        assert!(!trade.accepted());

        trade.conditions = "@".into();
        trade.size = 50;
        assert!(!trade.accepted());
    }

    #[test]
    fn into_record_shifts_the_timestamp() {
        // 2024-01-15 17:00 UTC is 12:00 EST.
        let utc_ms = chrono::NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(17, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp_millis();
        let trade = WireTrade {
            symbol: "AAPL".into(),
            utc_timestamp_ms: utc_ms,
            price: 191.45,
            size: 250,
            exchange: "N".into(),
            id: "1".into(),
            conditions: "@".into(),
        };
        let record = trade.into_record();
        assert_eq!(record.timestamp_et_ms, utc_ms - 5 * 3_600_000);
        assert_eq!(record.symbol, "AAPL");
    }

    #[test]
    fn trade_page_defaults_cursor_to_none() {
        let page: TradePage = serde_json::from_str(r#"{"results":[]}"#).unwrap();
        assert!(page.results.is_empty());
        assert!(page.next_cursor.is_none());
    }
}
