// =============================================================================
// Snapshot Broadcaster — fixed-rate publication of live candles
// =============================================================================
//
// Runs on its own timer, independent of trade arrival, so the outbound rate
// is bounded no matter how bursty the feed is.  Each tick walks the interest
// set (configured symbols x every timeframe) and publishes the live bucket of
// each pair on `candle-snapshots`.  Pairs without a live bucket are skipped.
// A failure on one pair never stops the rest of the tick.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::bus::Publisher;
use crate::error::PipelineError;
use crate::market_data::{CandleAggregator, CandleBucket};
use crate::metrics::PipelineMetrics;
use crate::types::{CandleSnapshot, Timeframe, SNAPSHOT_CHANNEL};

pub struct SnapshotBroadcaster {
    aggregator: Arc<CandleAggregator>,
    publisher: Arc<dyn Publisher>,
    metrics: Arc<PipelineMetrics>,
    symbols: Vec<String>,
    period: Duration,
    publish_timeout: Duration,
}

/// Build the wire snapshot for a live bucket, stamped with `now`.
pub fn snapshot_of(bucket: &CandleBucket, now: i64) -> CandleSnapshot {
    CandleSnapshot {
        time: bucket.bucket_start,
        symbol: bucket.symbol.clone(),
        timeframe: bucket.timeframe,
        open: bucket.open,
        high: bucket.high,
        low: bucket.low,
        close: bucket.close,
        source: "snapshot".to_string(),
        timestamp: now,
    }
}

impl SnapshotBroadcaster {
    pub fn new(
        aggregator: Arc<CandleAggregator>,
        publisher: Arc<dyn Publisher>,
        metrics: Arc<PipelineMetrics>,
        symbols: Vec<String>,
        period: Duration,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            aggregator,
            publisher,
            metrics,
            symbols,
            period,
            publish_timeout,
        }
    }

    /// Publish one snapshot per live pair.  Returns how many were published.
    pub async fn broadcast_tick(&self) -> usize {
        let now = Utc::now().timestamp_millis();
        let mut published = 0;

        for symbol in &self.symbols {
            for timeframe in Timeframe::ALL {
                let Some(bucket) = self.aggregator.read_snapshot(symbol, timeframe) else {
                    continue;
                };

                match self.publish(&snapshot_of(&bucket, now)).await {
                    Ok(()) => {
                        published += 1;
                        PipelineMetrics::incr(&self.metrics.snapshots_published);
                    }
                    Err(e) => {
                        PipelineMetrics::incr(&self.metrics.publish_failures);
                        warn!(
                            symbol = %symbol,
                            timeframe = %timeframe,
                            error = %e,
                            "failed to broadcast snapshot"
                        );
                    }
                }
            }
        }

        published
    }

    async fn publish(&self, snapshot: &CandleSnapshot) -> Result<(), PipelineError> {
        let payload = serde_json::to_string(snapshot).map_err(|e| PipelineError::PublishFailure {
            channel: SNAPSHOT_CHANNEL.into(),
            message: e.to_string(),
        })?;

        match tokio::time::timeout(
            self.publish_timeout,
            self.publisher.publish(SNAPSHOT_CHANNEL, payload),
        )
        .await
        {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(PipelineError::Timeout {
                operation: format!("publish to {SNAPSHOT_CHANNEL}"),
                duration_ms: self.publish_timeout.as_millis() as u64,
            }),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            period_ms = self.period.as_millis() as u64,
            symbols = ?self.symbols,
            "started candle broadcasting"
        );

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.broadcast_tick().await;
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("snapshot broadcaster stopped");
    }
}
