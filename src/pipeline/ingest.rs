// =============================================================================
// Ingest Task — single consumer of the listener channel
// =============================================================================
//
// Every raw trade goes two ways: verbatim into the ingestion buffer (the batch
// processor owns parsing for persistence) and, once parsed, into the candle
// aggregator.  Being the only writer keeps per-symbol arrival order intact.
// =============================================================================

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::market_data::{CandleAggregator, IngestionBuffer};
use crate::types::Trade;

/// Handle one raw trade payload.
pub fn ingest_one(raw: String, buffer: &IngestionBuffer, aggregator: &CandleAggregator) {
    let parsed = Trade::parse(&raw);

    if let Err(e) = buffer.enqueue(raw) {
        warn!(error = %e, "trade not buffered for persistence");
    }

    match parsed {
        Ok(trade) => {
            aggregator.apply_trade(&trade);
        }
        // Counted once, when the batch processor meets the same entry.
        Err(e) => {
            warn!(error = %e, "trade skipped by aggregator");
        }
    }
}

/// Drain the ingest channel until every sender is gone.
pub async fn run_ingest(
    mut rx: mpsc::Receiver<String>,
    buffer: Arc<IngestionBuffer>,
    aggregator: Arc<CandleAggregator>,
) {
    while let Some(raw) = rx.recv().await {
        ingest_one(raw, &buffer, &aggregator);
    }
    info!("ingest task stopped");
}
