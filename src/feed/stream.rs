// =============================================================================
// Stream Ingester — live trade WebSocket into the Live Model
// =============================================================================
//
// Connects to the feed, authenticates, subscribes to trades for the whole
// symbol universe, and inserts every accepted trade via `LiveModel::add`.
// Any termination short of shutdown triggers a reconnect with exponential
// backoff; the backfill pool fills whatever the outage missed.
//
// The readiness signal fires once, after the first successful subscription.
// An authentication rejection before that point is a startup fatal and is
// returned to the supervisor instead of being retried.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::feed::wire::{self, FeedEvent, WireTrade};
use crate::live_model::LiveModel;
use crate::types::parse_numeric_id;
use crate::universe::SymbolUniverse;

/// Initial reconnect delay; doubles per failed attempt up to the cap.
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Run the ingest loop until shutdown. Returns `Err` only for startup
/// fatals (authentication rejected before the first successful session).
pub async fn run_ingester(
    endpoint: String,
    api_key: String,
    universe: Arc<SymbolUniverse>,
    model: Arc<LiveModel>,
    mut shutdown: broadcast::Receiver<()>,
    ready: oneshot::Sender<()>,
) -> Result<()> {
    let mut ready = Some(ready);
    let mut backoff = BACKOFF_START;

    loop {
        let session = tokio::select! {
            _ = shutdown.recv() => {
                info!("ingester stopping on shutdown");
                return Ok(());
            }
            session = run_session(&endpoint, &api_key, &universe, &model, &mut ready, &mut backoff) => session,
        };

        match session {
            Ok(()) => info!("trade stream ended; reconnecting"),
            Err(e) => {
                // Authentication rejected before the stream was ever live is
                // a configuration problem, not an outage.
                if ready.is_some() && is_auth_rejection(&e) {
                    return Err(e);
                }
                warn!(error = %e, "trade stream error; reconnecting");
            }
        }

        debug!(delay_ms = backoff.as_millis() as u64, "reconnect backoff");
        tokio::select! {
            _ = shutdown.recv() => {
                info!("ingester stopping on shutdown");
                return Ok(());
            }
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

fn is_auth_rejection(e: &anyhow::Error) -> bool {
    e.to_string().contains("authentication rejected")
}

/// One WebSocket session: connect, auth, subscribe, then read until the
/// stream ends. Resets the backoff and fires readiness once subscribed.
async fn run_session(
    endpoint: &str,
    api_key: &str,
    universe: &Arc<SymbolUniverse>,
    model: &Arc<LiveModel>,
    ready: &mut Option<oneshot::Sender<()>>,
    backoff: &mut Duration,
) -> Result<()> {
    info!(url = %endpoint, "connecting to trade WebSocket");
    let (ws_stream, _response) = connect_async(endpoint)
        .await
        .context("failed to connect to trade WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    let auth = serde_json::json!({ "action": "auth", "key": api_key }).to_string();
    write
        .send(Message::Text(auth))
        .await
        .context("failed to send auth message")?;

    let params: Vec<String> = universe
        .entries()
        .iter()
        .map(|e| format!("T.{}", e.symbol))
        .collect();
    let subscribe =
        serde_json::json!({ "action": "subscribe", "params": params.join(",") }).to_string();
    write
        .send(Message::Text(subscribe))
        .await
        .context("failed to send subscribe message")?;

    info!(symbols = universe.len(), "trade subscription opened");
    *backoff = BACKOFF_START;
    if let Some(tx) = ready.take() {
        let _ = tx.send(());
    }

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => handle_frame(&text, universe, model)?,
            Some(Ok(Message::Close(frame))) => {
                info!(?frame, "trade WebSocket closed by server");
                return Ok(());
            }
            // Ping replies are handled by tungstenite itself.
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e).context("trade WebSocket read error"),
            None => {
                warn!("trade WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

fn handle_frame(
    text: &str,
    universe: &Arc<SymbolUniverse>,
    model: &Arc<LiveModel>,
) -> Result<()> {
    let events = match wire::parse_event_frame(text) {
        Ok(events) => events,
        Err(e) => {
            warn!(error = %e, "failed to parse feed frame");
            return Ok(());
        }
    };

    for event in events {
        match event {
            FeedEvent::Status { status, message } => {
                if status == "auth_failed" {
                    anyhow::bail!("feed authentication rejected: {message}");
                }
                debug!(status = %status, message = %message, "feed status");
            }
            FeedEvent::Trade(trade) => ingest_trade(trade, universe, model),
        }
    }
    Ok(())
}

/// Filter, classify, and insert one live trade.
fn ingest_trade(trade: WireTrade, universe: &SymbolUniverse, model: &LiveModel) {
    if !trade.accepted() {
        return;
    }
    let Some(numeric_id) = parse_numeric_id(&trade.id) else {
        warn!(symbol = %trade.symbol, id = %trade.id, "trade id is not numeric; dropped");
        return;
    };
    let is_index = universe.is_index(&trade.symbol);
    model.add(trade.into_record(), numeric_id, is_index);
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn universe() -> Arc<SymbolUniverse> {
        Arc::new(SymbolUniverse::from_parts(
            vec!["AAPL".into(), "GME".into()],
            HashSet::from(["AAPL".to_string()]),
            HashMap::new(),
        ))
    }

    fn trade_frame(symbol: &str, id: &str, size: i64) -> String {
        format!(
            r#"[{{"ev":"T","sym":"{symbol}","t":1700000000123,"p":191.45,"s":{size},"x":"N","i":"{id}","c":"@"}}]"#
        )
    }

    #[test]
    fn accepted_trades_land_in_the_model() {
        let universe = universe();
        let model = Arc::new(LiveModel::new(i64::MAX));

        handle_frame(&trade_frame("AAPL", "1", 250), &universe, &model).unwrap();
        handle_frame(&trade_frame("GME", "2", 250), &universe, &model).unwrap();

        let (today_idx, today_ex) = model.today_snapshot();
        assert_eq!(today_idx.len(), 1);
        assert_eq!(today_idx[0].symbol, "AAPL");
        assert_eq!(today_ex.len(), 1);
        assert_eq!(today_ex[0].symbol, "GME");
    }

    #[test]
    fn filtered_and_malformed_trades_are_dropped() {
        let universe = universe();
        let model = Arc::new(LiveModel::new(i64::MAX));

        // Below the size filter.
        handle_frame(&trade_frame("AAPL", "1", 50), &universe, &model).unwrap();
        // Non-numeric id.
        handle_frame(&trade_frame("AAPL", "not-a-number", 250), &universe, &model).unwrap();
        // Unparseable frame is logged, not fatal.
        handle_frame("garbage", &universe, &model).unwrap();

        assert_eq!(model.seen_count(), 0);
    }

    #[test]
    fn duplicate_live_trades_are_deduped() {
        let universe = universe();
        let model = Arc::new(LiveModel::new(i64::MAX));

        handle_frame(&trade_frame("AAPL", "7", 250), &universe, &model).unwrap();
        handle_frame(&trade_frame("AAPL", "7", 250), &universe, &model).unwrap();
        assert_eq!(model.seen_count(), 1);
    }

    #[test]
    fn auth_rejection_is_fatal() {
        let universe = universe();
        let model = Arc::new(LiveModel::new(i64::MAX));
        let frame = r#"[{"ev":"status","status":"auth_failed","message":"bad key"}]"#;
        let err = handle_frame(frame, &universe, &model).unwrap_err();
        assert!(is_auth_rejection(&err));
    }
}
