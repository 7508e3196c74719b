// =============================================================================
// Pipeline Metrics — lock-free counters shared by every task
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters updated with `Relaxed` ordering; they are only ever
/// read for reporting.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub trades_received: AtomicU64,
    /// Trades dropped because the listener -> ingest channel was full.
    pub trades_dropped_backpressure: AtomicU64,
    /// Entries evicted or refused by the ingestion buffer at capacity.
    pub queue_overflow: AtomicU64,
    pub malformed_messages: AtomicU64,
    pub batches_written: AtomicU64,
    pub rows_written: AtomicU64,
    pub store_write_retries: AtomicU64,
    pub batches_dead_lettered: AtomicU64,
    /// Dead-lettered batches pushed out of the bounded dead-letter queue.
    pub dead_letters_evicted: AtomicU64,
    pub candles_completed: AtomicU64,
    pub late_trades_dropped: AtomicU64,
    pub snapshots_published: AtomicU64,
    pub publish_failures: AtomicU64,
    /// Deliveries skipped because a session's outbound queue was full.
    pub session_deliveries_dropped: AtomicU64,
}

/// Point-in-time copy of [`PipelineMetrics`] for the health endpoint.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub trades_received: u64,
    pub trades_dropped_backpressure: u64,
    pub queue_overflow: u64,
    pub malformed_messages: u64,
    pub batches_written: u64,
    pub rows_written: u64,
    pub store_write_retries: u64,
    pub batches_dead_lettered: u64,
    pub dead_letters_evicted: u64,
    pub candles_completed: u64,
    pub late_trades_dropped: u64,
    pub snapshots_published: u64,
    pub publish_failures: u64,
    pub session_deliveries_dropped: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            trades_received: load(&self.trades_received),
            trades_dropped_backpressure: load(&self.trades_dropped_backpressure),
            queue_overflow: load(&self.queue_overflow),
            malformed_messages: load(&self.malformed_messages),
            batches_written: load(&self.batches_written),
            rows_written: load(&self.rows_written),
            store_write_retries: load(&self.store_write_retries),
            batches_dead_lettered: load(&self.batches_dead_lettered),
            dead_letters_evicted: load(&self.dead_letters_evicted),
            candles_completed: load(&self.candles_completed),
            late_trades_dropped: load(&self.late_trades_dropped),
            snapshots_published: load(&self.snapshots_published),
            publish_failures: load(&self.publish_failures),
            session_deliveries_dropped: load(&self.session_deliveries_dropped),
        }
    }
}
