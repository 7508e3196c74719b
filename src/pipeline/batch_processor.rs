// =============================================================================
// Batch Processor — periodic drain of `trade_queue` into the durable store
// =============================================================================
//
// Every tick:
//   1. Drain up to `batch_size` entries (one atomic step on the buffer).
//   2. Parse each entry; malformed entries are logged and skipped one by one.
//   3. Write the survivors as a single multi-row insert, with a timeout.
//   4. On failure retry with exponential backoff; after the last attempt the
//      batch goes to the dead-letter queue.
//
// On shutdown the batch in flight completes, then the buffer is flushed while
// writes keep succeeding, all under `shutdown_flush_timeout_ms`.  Only one
// processor runs per buffer, so drains never race each other.  The processor
// never reads or writes live candle state.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::market_data::IngestionBuffer;
use crate::metrics::PipelineMetrics;
use crate::runtime_config::{RetryPolicy, RuntimeConfig};
use crate::store::{DeadLetterQueue, TradeRow, TradeStore};
use crate::types::Trade;

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Idle,
    Written { rows: u64, skipped: usize },
    DeadLettered { rows: usize, skipped: usize },
}

pub struct BatchProcessor {
    buffer: Arc<IngestionBuffer>,
    store: Arc<dyn TradeStore>,
    dead_letters: Arc<DeadLetterQueue>,
    metrics: Arc<PipelineMetrics>,
    batch_size: usize,
    period: Duration,
    write_timeout: Duration,
    flush_timeout: Duration,
    retry: RetryPolicy,
}

impl BatchProcessor {
    pub fn new(
        config: &RuntimeConfig,
        buffer: Arc<IngestionBuffer>,
        store: Arc<dyn TradeStore>,
        dead_letters: Arc<DeadLetterQueue>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            buffer,
            store,
            dead_letters,
            metrics,
            batch_size: config.batch_size,
            period: config.batch_interval(),
            write_timeout: config.store_write_timeout(),
            flush_timeout: config.shutdown_flush_timeout(),
            retry: config.retry.clone(),
        }
    }

    /// Drain one batch and persist it.
    pub async fn process_tick(&self) -> BatchOutcome {
        self.process_batch(None).await
    }

    /// Drain one batch; retries stop early once `deadline` would be passed.
    async fn process_batch(&self, deadline: Option<Instant>) -> BatchOutcome {
        let entries = self.buffer.drain_batch(self.batch_size);
        if entries.is_empty() {
            return BatchOutcome::Idle;
        }

        let mut rows = Vec::with_capacity(entries.len());
        let mut kept = Vec::with_capacity(entries.len());
        let mut skipped = 0usize;

        for raw in entries {
            match Trade::parse(&raw).and_then(|t| TradeRow::try_from(&t)) {
                Ok(row) => {
                    rows.push(row);
                    kept.push(raw);
                }
                Err(e) => {
                    skipped += 1;
                    PipelineMetrics::incr(&self.metrics.malformed_messages);
                    warn!(error = %e, entry = %raw, "skipping malformed queue entry");
                }
            }
        }

        if rows.is_empty() {
            return BatchOutcome::Written { rows: 0, skipped };
        }

        match self.write_with_retry(&rows, deadline).await {
            Ok(written) => {
                PipelineMetrics::incr(&self.metrics.batches_written);
                PipelineMetrics::add(&self.metrics.rows_written, written);
                info!(rows = written, skipped, "batch inserted");
                BatchOutcome::Written {
                    rows: written,
                    skipped,
                }
            }
            Err((e, attempts)) => {
                PipelineMetrics::incr(&self.metrics.batches_dead_lettered);
                let rows = kept.len();
                if self.dead_letters.push(kept, attempts, e.to_string()) {
                    PipelineMetrics::incr(&self.metrics.dead_letters_evicted);
                }
                BatchOutcome::DeadLettered { rows, skipped }
            }
        }
    }

    /// Returns the error of the last attempt and how many attempts ran.
    async fn write_with_retry(
        &self,
        rows: &[TradeRow],
        deadline: Option<Instant>,
    ) -> Result<u64, (PipelineError, u32)> {
        let mut attempt = 1;
        loop {
            let attempt_timeout = match deadline {
                Some(deadline) => self
                    .write_timeout
                    .min(deadline.saturating_duration_since(Instant::now())),
                None => self.write_timeout,
            };

            let result = match tokio::time::timeout(attempt_timeout, self.store.insert_batch(rows)).await {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Timeout {
                    operation: "store write".into(),
                    duration_ms: attempt_timeout.as_millis() as u64,
                }),
            };

            match result {
                Ok(written) => return Ok(written),
                Err(e) if attempt >= self.retry.max_attempts => return Err((e, attempt)),
                Err(e) => {
                    let delay = self.retry.delay_for(attempt);
                    if deadline.is_some_and(|d| Instant::now() + delay >= d) {
                        warn!(error = %e, attempt, rows = rows.len(), "flush deadline reached, batch not retried");
                        return Err((e, attempt));
                    }
                    PipelineMetrics::incr(&self.metrics.store_write_retries);
                    warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        rows = rows.len(),
                        "batch write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Persist what is still buffered, stopping at the first batch the store
    /// refuses or when the flush deadline passes.
    async fn flush(&self) {
        if self.buffer.is_empty() {
            return;
        }
        let deadline = Instant::now() + self.flush_timeout;
        info!(
            pending = self.buffer.len(),
            timeout_ms = self.flush_timeout.as_millis() as u64,
            "batch processor flushing before shutdown"
        );

        loop {
            if Instant::now() >= deadline {
                warn!(pending = self.buffer.len(), "flush deadline reached, entries left unpersisted");
                break;
            }
            match self.process_batch(Some(deadline)).await {
                BatchOutcome::Idle => break,
                BatchOutcome::Written { .. } => {}
                BatchOutcome::DeadLettered { .. } => {
                    warn!(pending = self.buffer.len(), "store unavailable, abandoning flush");
                    break;
                }
            }
        }
    }

    /// Tick until shutdown, then flush whatever is still buffered.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            period_ms = self.period.as_millis() as u64,
            batch_size = self.batch_size,
            "batch processor started"
        );

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.process_tick().await;
                    debug!(?outcome, "batch tick");
                }
                _ = shutdown.changed() => break,
            }
        }

        self.flush().await;
        info!("batch processor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineResult;
    use crate::runtime_config::OverflowPolicy;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records every batch; fails the first `failures` calls.
    struct RecordingStore {
        batches: Mutex<Vec<Vec<TradeRow>>>,
        failures: Mutex<u32>,
    }

    impl RecordingStore {
        fn new(failures: u32) -> Self {
            Self {
                batches: Mutex::new(Vec::new()),
                failures: Mutex::new(failures),
            }
        }
    }

    #[async_trait]
    impl TradeStore for RecordingStore {
        async fn insert_batch(&self, rows: &[TradeRow]) -> PipelineResult<u64> {
            {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(PipelineError::StoreWriteFailure {
                        rows: rows.len(),
                        message: "connection reset".into(),
                    });
                }
            }
            self.batches.lock().push(rows.to_vec());
            Ok(rows.len() as u64)
        }
    }

    fn config(batch_size: usize, max_attempts: u32) -> RuntimeConfig {
        let mut cfg = RuntimeConfig::default();
        cfg.batch_size = batch_size;
        cfg.retry = RetryPolicy {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 2,
        };
        cfg
    }

    fn raw_trade(symbol: &str, price: i64, ts: i64) -> String {
        format!(r#"{{"symbol":"{symbol}","price":{price},"quantity":1.5,"timestamp":{ts}}}"#)
    }

    struct Fixture {
        processor: BatchProcessor,
        buffer: Arc<IngestionBuffer>,
        store: Arc<RecordingStore>,
        dead_letters: Arc<DeadLetterQueue>,
        metrics: Arc<PipelineMetrics>,
    }

    fn fixture(batch_size: usize, max_attempts: u32, failures: u32) -> Fixture {
        let metrics = Arc::new(PipelineMetrics::new());
        let buffer = Arc::new(IngestionBuffer::new(1000, OverflowPolicy::Reject, metrics.clone()));
        let store = Arc::new(RecordingStore::new(failures));
        let dead_letters = Arc::new(DeadLetterQueue::new(10));
        let processor = BatchProcessor::new(
            &config(batch_size, max_attempts),
            buffer.clone(),
            store.clone(),
            dead_letters.clone(),
            metrics.clone(),
        );
        Fixture {
            processor,
            buffer,
            store,
            dead_letters,
            metrics,
        }
    }

    #[tokio::test]
    async fn empty_buffer_is_a_no_op() {
        let f = fixture(10, 1, 0);
        assert_eq!(f.processor.process_tick().await, BatchOutcome::Idle);
        assert!(f.store.batches.lock().is_empty());
    }

    #[tokio::test]
    async fn writes_one_statement_per_bounded_batch() {
        let f = fixture(3, 1, 0);
        for i in 0..5 {
            f.buffer.enqueue(raw_trade("BTCUSDT", 100 + i, i * 1000)).unwrap();
        }

        assert_eq!(
            f.processor.process_tick().await,
            BatchOutcome::Written { rows: 3, skipped: 0 }
        );
        assert_eq!(
            f.processor.process_tick().await,
            BatchOutcome::Written { rows: 2, skipped: 0 }
        );

        let batches = f.store.batches.lock();
        assert_eq!(batches.len(), 2);
        let first = &batches[0][0];
        assert_eq!(first.symbol, "BTCUSDT");
        assert_eq!(
            [first.price, first.high, first.low, first.open, first.close],
            [100; 5]
        );
        assert_eq!(batches[1][1].time.timestamp_millis(), 4000);
    }

    #[tokio::test]
    async fn malformed_entries_do_not_abort_the_batch() {
        let f = fixture(10, 1, 0);
        f.buffer.enqueue(raw_trade("BTCUSDT", 1, 0)).unwrap();
        f.buffer.enqueue("{not json".into()).unwrap();
        f.buffer.enqueue(r#"{"symbol":"ETHUSDT"}"#.into()).unwrap();
        f.buffer.enqueue(raw_trade("ETHUSDT", 2, 0)).unwrap();

        assert_eq!(
            f.processor.process_tick().await,
            BatchOutcome::Written { rows: 2, skipped: 2 }
        );
        assert_eq!(f.metrics.snapshot().malformed_messages, 2);
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let f = fixture(10, 3, 2);
        f.buffer.enqueue(raw_trade("BTCUSDT", 1, 0)).unwrap();

        assert_eq!(
            f.processor.process_tick().await,
            BatchOutcome::Written { rows: 1, skipped: 0 }
        );
        assert_eq!(f.metrics.snapshot().store_write_retries, 2);
        assert_eq!(f.dead_letters.len(), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_the_batch() {
        let f = fixture(10, 2, 5);
        f.buffer.enqueue(raw_trade("BTCUSDT", 1, 0)).unwrap();
        f.buffer.enqueue(raw_trade("BTCUSDT", 2, 1)).unwrap();

        assert_eq!(
            f.processor.process_tick().await,
            BatchOutcome::DeadLettered { rows: 2, skipped: 0 }
        );
        let dead = f.dead_letters.recent();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].data.len(), 2);
        assert!(dead[0].error_message.contains("connection reset"));
        assert_eq!(f.metrics.snapshot().batches_dead_lettered, 1);
        assert!(f.buffer.is_empty());
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_entries() {
        let f = fixture(2, 1, 0);
        for i in 0..5 {
            f.buffer.enqueue(raw_trade("SOLUSDT", i, i)).unwrap();
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        stop_tx.send(true).unwrap();

        let store = f.store.clone();
        f.processor.run(stop_rx).await;

        let total: usize = store.batches.lock().iter().map(Vec::len).sum();
        assert_eq!(total, 5);
        assert!(f.buffer.is_empty());
    }

    #[tokio::test]
    async fn flush_stops_at_first_refused_batch() {
        let f = fixture(2, 3, u32::MAX);
        for i in 0..10 {
            f.buffer.enqueue(raw_trade("BTCUSDT", i, i)).unwrap();
        }

        f.processor.flush().await;

        assert_eq!(f.dead_letters.len(), 1);
        assert_eq!(f.dead_letters.recent()[0].retry_count, 3);
        assert_eq!(f.buffer.len(), 8);
    }

    /// Never completes a write.
    struct StalledStore;

    #[async_trait]
    impl TradeStore for StalledStore {
        async fn insert_batch(&self, _rows: &[TradeRow]) -> PipelineResult<u64> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn flush_respects_its_deadline() {
        let metrics = Arc::new(PipelineMetrics::new());
        let buffer = Arc::new(IngestionBuffer::new(1000, OverflowPolicy::Reject, metrics.clone()));
        let dead_letters = Arc::new(DeadLetterQueue::new(10));
        let mut cfg = config(5, 5);
        cfg.store_write_timeout_ms = 60_000;
        cfg.shutdown_flush_timeout_ms = 50;
        let processor = BatchProcessor::new(
            &cfg,
            buffer.clone(),
            Arc::new(StalledStore),
            dead_letters.clone(),
            metrics.clone(),
        );
        for i in 0..20 {
            buffer.enqueue(raw_trade("ETHUSDT", i, i)).unwrap();
        }

        let started = std::time::Instant::now();
        processor.flush().await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(dead_letters.len(), 1);
        assert_eq!(buffer.len(), 15);
    }

    #[tokio::test]
    async fn dead_letter_evictions_are_counted() {
        let metrics = Arc::new(PipelineMetrics::new());
        let buffer = Arc::new(IngestionBuffer::new(1000, OverflowPolicy::Reject, metrics.clone()));
        let dead_letters = Arc::new(DeadLetterQueue::new(1));
        let processor = BatchProcessor::new(
            &config(1, 1),
            buffer.clone(),
            Arc::new(RecordingStore::new(u32::MAX)),
            dead_letters.clone(),
            metrics.clone(),
        );
        for i in 0..3 {
            buffer.enqueue(raw_trade("SOLUSDT", i, i)).unwrap();
            processor.process_tick().await;
        }

        let snap = metrics.snapshot();
        assert_eq!(snap.batches_dead_lettered, 3);
        assert_eq!(snap.dead_letters_evicted, 2);
        assert_eq!(dead_letters.len(), 1);
    }
}
