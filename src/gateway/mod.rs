// =============================================================================
// Fan-out Gateway — routes bus publications to subscribed client sessions
// =============================================================================
//
// Sessions register an outbound queue and receive a session id.  Client
// events mutate the topic index; bus publications on `candle-snapshots` and
// `trades` are serialized once and pushed to every session holding the exact
// topic.  A full session queue loses that one frame for that one session;
// the router never waits on a client.
// =============================================================================

pub mod topics;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::error::PipelineResult;
use crate::metrics::PipelineMetrics;
use crate::types::{
    CandleSnapshot, ClientEvent, LiveTrade, ServerEvent, Trade, SNAPSHOT_CHANNEL, TRADES_CHANNEL,
};

pub use topics::{candle_topic, trade_topic, SessionId, TopicIndex};

pub struct FanoutGateway {
    sessions: DashMap<SessionId, mpsc::Sender<String>>,
    index: TopicIndex,
    metrics: Arc<PipelineMetrics>,
    session_queue_capacity: usize,
}

impl FanoutGateway {
    pub fn new(metrics: Arc<PipelineMetrics>, session_queue_capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            index: TopicIndex::new(),
            metrics,
            session_queue_capacity: session_queue_capacity.max(1),
        }
    }

    // ── Session lifecycle ───────────────────────────────────────────────

    /// Register a new session and hand back its outbound frame queue.
    pub fn connect(&self) -> (SessionId, mpsc::Receiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.session_queue_capacity);
        self.sessions.insert(id, tx);
        info!(session = %id, "client connected");
        (id, rx)
    }

    /// Forget a session and every topic it held.
    pub fn disconnect(&self, session: SessionId) {
        self.sessions.remove(&session);
        let dropped = self.index.remove_session(session);
        info!(session = %session, topics = dropped, "client disconnected");
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn index(&self) -> &TopicIndex {
        &self.index
    }

    /// Apply a client event.  Returns a direct reply, if the event has one.
    pub fn handle_event(&self, session: SessionId, event: ClientEvent) -> Option<ServerEvent> {
        match event {
            ClientEvent::SubscribeCandles(sub) => {
                let topic = candle_topic(&sub.symbol, sub.timeframe);
                self.index.subscribe(session, &topic);
                info!(session = %session, topic = %topic, "client subscribed");
                None
            }
            ClientEvent::UnsubscribeCandles(sub) => {
                let topic = candle_topic(&sub.symbol, sub.timeframe);
                self.index.unsubscribe(session, &topic);
                info!(session = %session, topic = %topic, "client unsubscribed");
                None
            }
            ClientEvent::SubscribeTrades(sub) => {
                let topic = trade_topic(&sub.symbol);
                self.index.subscribe(session, &topic);
                info!(session = %session, topic = %topic, "client subscribed to live trades");
                None
            }
            ClientEvent::UnsubscribeTrades(sub) => {
                let topic = trade_topic(&sub.symbol);
                self.index.unsubscribe(session, &topic);
                info!(session = %session, topic = %topic, "client unsubscribed");
                None
            }
            ClientEvent::Ping => Some(ServerEvent::Pong),
        }
    }

    // ── Routing ─────────────────────────────────────────────────────────

    /// Route a `candle-snapshots` payload.  Returns the number of sessions
    /// the frame was queued for.
    pub fn route_snapshot(&self, raw: &str) -> PipelineResult<usize> {
        let snapshot = CandleSnapshot::parse(raw)?;
        let topic = candle_topic(&snapshot.symbol, snapshot.timeframe);
        Ok(self.deliver(&topic, &ServerEvent::CandleSnapshot(snapshot)))
    }

    /// Route a `trades` payload, decoding the fixed-point price first.
    pub fn route_trade(&self, raw: &str) -> PipelineResult<usize> {
        let trade = Trade::parse(raw)?;
        let topic = trade_topic(&trade.symbol);
        Ok(self.deliver(&topic, &ServerEvent::LiveTrade(LiveTrade::from(&trade))))
    }

    fn deliver(&self, topic: &str, event: &ServerEvent) -> usize {
        let targets = self.index.sessions_for(topic);
        if targets.is_empty() {
            return 0;
        }

        let frame = match serde_json::to_string(event) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(topic = %topic, error = %e, "failed to serialize outbound frame");
                return 0;
            }
        };

        let mut delivered = 0;
        for session in targets {
            let Some(tx) = self.sessions.get(&session).map(|s| s.value().clone()) else {
                continue;
            };
            match tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    PipelineMetrics::incr(&self.metrics.session_deliveries_dropped);
                    debug!(session = %session, topic = %topic, "session queue full, frame dropped");
                }
                // The session task is gone; its disconnect cleans the index.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Consume both bus channels until shutdown.
    pub async fn run(self: Arc<Self>, bus: MessageBus, mut shutdown: watch::Receiver<bool>) {
        let mut snapshots = bus.subscribe(SNAPSHOT_CHANNEL);
        let mut trades = bus.subscribe(TRADES_CHANNEL);
        info!("fan-out gateway started");

        loop {
            tokio::select! {
                msg = snapshots.recv() => {
                    if !self.on_publication(SNAPSHOT_CHANNEL, msg, |raw| self.route_snapshot(raw)) {
                        break;
                    }
                }
                msg = trades.recv() => {
                    if !self.on_publication(TRADES_CHANNEL, msg, |raw| self.route_trade(raw)) {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("fan-out gateway stopped");
    }

    /// Returns `false` once the channel is closed.
    fn on_publication<F>(
        &self,
        channel: &str,
        msg: Result<String, broadcast::error::RecvError>,
        route: F,
    ) -> bool
    where
        F: FnOnce(&str) -> PipelineResult<usize>,
    {
        match msg {
            Ok(raw) => {
                if let Err(e) = route(&raw) {
                    PipelineMetrics::incr(&self.metrics.malformed_messages);
                    warn!(channel = %channel, error = %e, "dropping unroutable publication");
                }
                true
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(channel = %channel, missed, "gateway lagged behind the bus");
                true
            }
            Err(broadcast::error::RecvError::Closed) => false,
        }
    }
}
