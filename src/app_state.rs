// =============================================================================
// Central Application State — Candle Pooler
// =============================================================================
//
// Ties the shared components together for the HTTP/WebSocket surface.  Each
// component manages its own interior mutability; AppState only holds Arcs.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::bus::MessageBus;
use crate::gateway::FanoutGateway;
use crate::market_data::{CandleAggregator, IngestionBuffer};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::runtime_config::RuntimeConfig;
use crate::store::DeadLetterQueue;

pub struct AppState {
    pub metrics: Arc<PipelineMetrics>,
    pub buffer: Arc<IngestionBuffer>,
    pub aggregator: Arc<CandleAggregator>,
    pub bus: MessageBus,
    pub gateway: Arc<FanoutGateway>,
    pub dead_letters: Arc<DeadLetterQueue>,
    pub start_time: Instant,
}

/// Point-in-time view served by the health endpoint.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub queue_depth: usize,
    pub live_candles: usize,
    pub sessions: usize,
    pub topics: usize,
    pub subscribed_sessions: usize,
    pub dead_letters: usize,
    pub metrics: MetricsSnapshot,
}

impl AppState {
    pub fn new(config: &RuntimeConfig) -> Self {
        let metrics = Arc::new(PipelineMetrics::new());
        let buffer = Arc::new(IngestionBuffer::new(
            config.queue_capacity,
            config.overflow_policy,
            metrics.clone(),
        ));
        let aggregator = Arc::new(CandleAggregator::new(metrics.clone()));
        let gateway = Arc::new(FanoutGateway::new(
            metrics.clone(),
            config.session_queue_capacity,
        ));
        let dead_letters = Arc::new(DeadLetterQueue::new(config.dead_letter_capacity));

        Self {
            metrics,
            buffer,
            aggregator,
            bus: MessageBus::new(),
            gateway,
            dead_letters,
            start_time: Instant::now(),
        }
    }

    pub fn health(&self) -> HealthReport {
        let (topics, subscribed_sessions) = self.gateway.index().stats();
        HealthReport {
            status: "ok",
            uptime_secs: self.start_time.elapsed().as_secs(),
            queue_depth: self.buffer.len(),
            live_candles: self.aggregator.len(),
            sessions: self.gateway.session_count(),
            topics,
            subscribed_sessions,
            dead_letters: self.dead_letters.len(),
            metrics: self.metrics.snapshot(),
        }
    }
}
