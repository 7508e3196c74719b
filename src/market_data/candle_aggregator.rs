use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::metrics::PipelineMetrics;
use crate::price::integer_to_price;
use crate::types::{Timeframe, Trade};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single live OHLC bucket for one (symbol, timeframe).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandleBucket {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Window start, epoch millis, aligned to the timeframe.
    pub bucket_start: i64,
    #[serde(with = "rust_decimal::serde::float")]
    pub open: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub high: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub low: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub close: Decimal,
}

impl CandleBucket {
    fn open_at(symbol: &str, timeframe: Timeframe, bucket_start: i64, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            bucket_start,
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize)]
pub struct CandleKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl CandleKey {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

// ---------------------------------------------------------------------------
// Rollover rule
// ---------------------------------------------------------------------------

/// Outcome of applying one trade to one timeframe's bucket.
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    /// The trade landed in the live window (or opened the first one).
    Updated(CandleBucket),
    /// The trade opened a new window; the previous bucket is complete.
    Rolled {
        live: CandleBucket,
        completed: CandleBucket,
    },
    /// The trade belongs to a window that has already rolled over.
    Late,
    /// The trade's window cannot be represented; nothing changes.
    OutOfRange,
}

/// Apply `trade` to the current bucket of `timeframe`.
///
/// Pure: no clock, no I/O.  The caller stores whatever bucket comes back.
pub fn advance(current: Option<&CandleBucket>, trade: &Trade, timeframe: Timeframe) -> Advance {
    let price = integer_to_price(trade.price);
    let Some(bucket_start) = timeframe.bucket_start(trade.timestamp) else {
        return Advance::OutOfRange;
    };

    match current {
        None => Advance::Updated(CandleBucket::open_at(
            &trade.symbol,
            timeframe,
            bucket_start,
            price,
        )),
        Some(bucket) if bucket.bucket_start < bucket_start => Advance::Rolled {
            live: CandleBucket::open_at(&trade.symbol, timeframe, bucket_start, price),
            completed: bucket.clone(),
        },
        Some(bucket) if bucket.bucket_start > bucket_start => Advance::Late,
        Some(bucket) => {
            let mut next = bucket.clone();
            next.high = next.high.max(price);
            next.low = next.low.min(price);
            next.close = price;
            Advance::Updated(next)
        }
    }
}

fn warn_out_of_range(trade: &Trade, timeframe: Timeframe) {
    warn!(
        symbol = %trade.symbol,
        timeframe = %timeframe,
        timestamp = trade.timestamp,
        "trade timestamp outside the representable range, skipped"
    );
}

// ---------------------------------------------------------------------------
// CandleAggregator -- owner of the live candle state
// ---------------------------------------------------------------------------

/// Holds at most one live bucket per `(symbol, timeframe)`.
///
/// The map is sharded; a key's entry is locked for the whole
/// read-advance-write of a trade, so readers never observe a bucket whose
/// fields come from different trades.  Keys never lock each other.
pub struct CandleAggregator {
    live: DashMap<CandleKey, CandleBucket>,
    metrics: Arc<PipelineMetrics>,
}

impl CandleAggregator {
    pub fn new(metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            live: DashMap::new(),
            metrics,
        }
    }

    /// Fold a trade into every timeframe.  Returns the buckets the trade
    /// completed, oldest timeframe first.
    pub fn apply_trade(&self, trade: &Trade) -> Vec<CandleBucket> {
        let mut completed = Vec::new();

        for timeframe in Timeframe::ALL {
            let key = CandleKey::new(trade.symbol.clone(), timeframe);

            match self.live.entry(key) {
                Entry::Vacant(vacant) => match advance(None, trade, timeframe) {
                    Advance::Updated(bucket) => {
                        debug!(symbol = %trade.symbol, timeframe = %timeframe, "created new candle");
                        vacant.insert(bucket);
                    }
                    _ => warn_out_of_range(trade, timeframe),
                },
                Entry::Occupied(mut occupied) => match advance(Some(occupied.get()), trade, timeframe) {
                    Advance::Updated(bucket) => {
                        occupied.insert(bucket);
                    }
                    Advance::Rolled { live, completed: done } => {
                        info!(
                            symbol = %done.symbol,
                            timeframe = %timeframe,
                            from = done.bucket_start,
                            to = live.bucket_start,
                            "completed candle"
                        );
                        occupied.insert(live);
                        PipelineMetrics::incr(&self.metrics.candles_completed);
                        completed.push(done);
                    }
                    Advance::Late => {
                        debug!(
                            symbol = %trade.symbol,
                            timeframe = %timeframe,
                            timestamp = trade.timestamp,
                            "late trade dropped from aggregation"
                        );
                        PipelineMetrics::incr(&self.metrics.late_trades_dropped);
                    }
                    Advance::OutOfRange => warn_out_of_range(trade, timeframe),
                },
            }
        }

        completed
    }

    /// Copy of the live bucket for a key, if one exists.
    pub fn read_snapshot(&self, symbol: &str, timeframe: Timeframe) -> Option<CandleBucket> {
        self.live
            .get(&CandleKey::new(symbol, timeframe))
            .map(|bucket| bucket.value().clone())
    }

    /// Every live bucket, sorted by symbol then timeframe.
    pub fn live_candles(&self) -> Vec<CandleBucket> {
        let mut all: Vec<CandleBucket> = self.live.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| (&a.symbol, a.timeframe).cmp(&(&b.symbol, b.timeframe)));
        all
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
