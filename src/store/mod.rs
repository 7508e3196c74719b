// =============================================================================
// Durable Store — raw trade rows and the dead-letter sink
// =============================================================================

pub mod dead_letter;
pub mod timescale;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{PipelineError, PipelineResult};
use crate::types::Trade;

pub use dead_letter::{DeadLetterEntry, DeadLetterQueue};
pub use timescale::TimescaleStore;

/// One row of the trade table.  Every price column carries the raw
/// fixed-point trade price; the row is a degenerate OHLC bar.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRow {
    pub time: DateTime<Utc>,
    pub symbol: String,
    pub price: i64,
    pub high: i64,
    pub low: i64,
    pub open: i64,
    pub close: i64,
}

impl TryFrom<&Trade> for TradeRow {
    type Error = PipelineError;

    fn try_from(trade: &Trade) -> PipelineResult<Self> {
        let time = DateTime::<Utc>::from_timestamp_millis(trade.timestamp).ok_or_else(|| {
            PipelineError::malformed(format!("timestamp {} out of range", trade.timestamp))
        })?;
        Ok(Self {
            time,
            symbol: trade.symbol.clone(),
            price: trade.price,
            high: trade.price,
            low: trade.price,
            open: trade.price,
            close: trade.price,
        })
    }
}

/// Sink for batches of trade rows.  One call is one durable write.
#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn insert_batch(&self, rows: &[TradeRow]) -> PipelineResult<u64>;
}
