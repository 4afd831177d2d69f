// =============================================================================
// Fan-out Server — gRPC live trade streaming
// =============================================================================
//
// Implements `TradeStream.StreamLiveTrades` with the snapshot-then-live
// contract: the current today/next snapshots are replayed first, tagged by
// the bucket they came from, then live events are forwarded from a model
// subscription. Delivery is at-most-once; a subscriber whose model-side
// buffer overflows silently misses events and is never disconnected for it.
// =============================================================================

use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::{wrappers::ReceiverStream, Stream};
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::live_model::LiveModel;
use crate::types::{LiveTradeEvent, TradeRecord};

pub mod proto {
    tonic::include_proto!("tapeflow.v1");
}

use proto::trade_stream_server::{TradeStream, TradeStreamServer};
use proto::{LiveTrade, StreamLiveTradesRequest};

/// Model-side subscription buffer per client.
const SUBSCRIBER_BUFFER: usize = 4096;
/// Outbound gRPC channel depth per client.
const OUTBOUND_BUFFER: usize = 128;

pub struct TradeStreamService {
    model: Arc<LiveModel>,
    shutdown: broadcast::Sender<()>,
}

impl TradeStreamService {
    pub fn new(model: Arc<LiveModel>, shutdown: broadcast::Sender<()>) -> Self {
        Self { model, shutdown }
    }
}

fn to_proto(record: TradeRecord, is_index: bool, is_today: bool) -> LiveTrade {
    LiveTrade {
        symbol: record.symbol,
        timestamp_et_ms: record.timestamp_et_ms,
        price: record.price,
        size: record.size_shares,
        exchange: record.exchange,
        id: record.id,
        conditions: record.conditions,
        is_index,
        is_today,
    }
}

fn event_to_proto(event: LiveTradeEvent) -> LiveTrade {
    to_proto(event.record, event.is_index, event.is_today)
}

#[tonic::async_trait]
impl TradeStream for TradeStreamService {
    type StreamLiveTradesStream =
        Pin<Box<dyn Stream<Item = Result<LiveTrade, Status>> + Send>>;

    async fn stream_live_trades(
        &self,
        request: Request<StreamLiveTradesRequest>,
    ) -> Result<Response<Self::StreamLiveTradesStream>, Status> {
        let ex_index_only = request.into_inner().ex_index_only;
        let model = self.model.clone();
        let shutdown_rx = self.shutdown.subscribe();

        // Snapshot first, subscribe second: backfilled trades are visible in
        // the snapshot and live inserts from here on arrive as events.
        let (today_index, today_ex_index) = model.today_snapshot();
        let (next_index, next_ex_index) = model.next_snapshot();
        let (sub_id, events) = model.subscribe(SUBSCRIBER_BUFFER);
        info!(sub_id, ex_index_only, "live trade stream opened");

        let snapshot = vec![
            (today_index, true, true),
            (today_ex_index, false, true),
            (next_index, true, false),
            (next_ex_index, false, false),
        ];

        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        tokio::spawn(pump(
            model,
            sub_id,
            snapshot,
            events,
            shutdown_rx,
            tx,
            ex_index_only,
        ));

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

/// Feed one client: replay the snapshot slices, then forward live events
/// until the client goes away, the channel closes, or shutdown.
async fn pump(
    model: Arc<LiveModel>,
    sub_id: u64,
    snapshot: Vec<(Vec<TradeRecord>, bool, bool)>,
    mut events: mpsc::Receiver<LiveTradeEvent>,
    mut shutdown: broadcast::Receiver<()>,
    tx: mpsc::Sender<Result<LiveTrade, Status>>,
    ex_index_only: bool,
) {
    for (records, is_index, is_today) in snapshot {
        if ex_index_only && is_index {
            continue;
        }
        for record in records {
            if tx
                .send(Ok(to_proto(record, is_index, is_today)))
                .await
                .is_err()
            {
                model.unsubscribe(sub_id);
                debug!(sub_id, "client disconnected during snapshot replay");
                return;
            }
        }
    }

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            event = events.recv() => match event {
                Some(event) => {
                    if ex_index_only && event.is_index {
                        continue;
                    }
                    if tx.send(Ok(event_to_proto(event))).await.is_err() {
                        break;
                    }
                }
                // Channel closed by Unsubscribe or model shutdown.
                None => break,
            }
        }
    }

    model.unsubscribe(sub_id);
    debug!(sub_id, "live trade stream closed");
}

/// Serve the fan-out service until shutdown.
pub async fn serve(
    addr: std::net::SocketAddr,
    service: TradeStreamService,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    info!(addr = %addr, "gRPC fan-out listening");
    tonic::transport::Server::builder()
        .add_service(TradeStreamServer::new(service))
        .serve_with_shutdown(addr, async move {
            let _ = shutdown.recv().await;
        })
        .await
        .context("gRPC server failed")
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn record(symbol: &str, ts: i64, id: &str) -> TradeRecord {
        TradeRecord {
            symbol: symbol.into(),
            timestamp_et_ms: ts,
            price: 10.0,
            size_shares: 200,
            exchange: "N".into(),
            id: id.into(),
            conditions: "@".into(),
        }
    }

    fn service(model: &Arc<LiveModel>) -> TradeStreamService {
        let (shutdown, _) = broadcast::channel(1);
        TradeStreamService::new(model.clone(), shutdown)
    }

    #[tokio::test]
    async fn snapshot_precedes_live_events() {
        let model = Arc::new(LiveModel::new(1000));
        model.add(record("OLD", 900, "1"), 1, false);

        let svc = service(&model);
        let response = svc
            .stream_live_trades(Request::new(StreamLiveTradesRequest {
                ex_index_only: false,
            }))
            .await
            .unwrap();
        let mut stream = response.into_inner();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.symbol, "OLD");
        assert!(first.is_today);
        assert!(!first.is_index);

        // A live insert after the stream opened arrives as an event.
        model.add(record("NEW", 1500, "2"), 2, true);
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.symbol, "NEW");
        assert!(!second.is_today);
        assert!(second.is_index);
    }

    #[tokio::test]
    async fn today_records_precede_next_records_in_the_snapshot() {
        let model = Arc::new(LiveModel::new(1000));
        model.add(record("NXT", 2000, "1"), 1, false);
        model.add(record("TOD", 900, "2"), 2, false);

        let svc = service(&model);
        let mut stream = svc
            .stream_live_trades(Request::new(StreamLiveTradesRequest {
                ex_index_only: false,
            }))
            .await
            .unwrap()
            .into_inner();

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.symbol, "TOD");
        assert!(first.is_today);
        assert_eq!(second.symbol, "NXT");
        assert!(!second.is_today);
    }

    #[tokio::test]
    async fn ex_index_only_filters_both_phases() {
        let model = Arc::new(LiveModel::new(1000));
        model.add(record("IDX", 900, "1"), 1, true);
        model.add(record("EX", 901, "2"), 2, false);

        let svc = service(&model);
        let mut stream = svc
            .stream_live_trades(Request::new(StreamLiveTradesRequest {
                ex_index_only: true,
            }))
            .await
            .unwrap()
            .into_inner();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.symbol, "EX");

        model.add(record("IDX2", 902, "3"), 3, true);
        model.add(record("EX2", 903, "4"), 4, false);
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.symbol, "EX2");
    }

    #[tokio::test]
    async fn disconnect_releases_the_subscription() {
        let model = Arc::new(LiveModel::new(1000));
        let svc = service(&model);
        let stream = svc
            .stream_live_trades(Request::new(StreamLiveTradesRequest {
                ex_index_only: false,
            }))
            .await
            .unwrap()
            .into_inner();
        // Give the pump task a chance to start.
        tokio::task::yield_now().await;
        assert_eq!(model.subscriber_count(), 1);

        drop(stream);
        // The pump notices on the next event it tries to forward.
        model.add(record("A", 900, "1"), 1, false);
        for _ in 0..20 {
            if model.subscriber_count() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(model.subscriber_count(), 0);
    }
}
