// =============================================================================
// Trade Feed — upstream WebSocket connector and bus listener
// =============================================================================
//
// Two halves:
//   1. `run_feed_connector` dials the upstream feed and republishes every text
//      frame on the bus `trades` channel, untouched.
//   2. `run_trade_listener` subscribes to `trades` and forwards raw payloads
//      into the bounded ingest channel.  A full channel drops the trade and
//      counts it; the listener never waits on the ingest side.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use crate::bus::MessageBus;
use crate::metrics::PipelineMetrics;
use crate::runtime_config::RetryPolicy;
use crate::types::TRADES_CHANNEL;

// ---------------------------------------------------------------------------
// Upstream WebSocket feed
// ---------------------------------------------------------------------------

/// Connect to the upstream feed once and pump frames onto the bus until the
/// stream ends or errors, so that the caller can handle reconnection.
pub async fn run_feed_stream(url: &str, bus: &MessageBus) -> Result<()> {
    info!(url = %url, "connecting to trade feed");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to trade feed")?;

    info!(url = %url, "trade feed connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    bus.send(TRADES_CHANNEL, text);
                }
                // Ping / Pong / Binary / Close frames are handled by
                // tungstenite or irrelevant here.
            }
            Some(Err(e)) => {
                error!(error = %e, "trade feed read error");
                return Err(e.into());
            }
            None => {
                warn!(url = %url, "trade feed stream ended");
                return Ok(());
            }
        }
    }
}

/// Keep the feed connected, backing off between attempts, until shutdown.
pub async fn run_feed_connector(
    url: String,
    bus: MessageBus,
    retry: RetryPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    loop {
        let started = std::time::Instant::now();
        tokio::select! {
            result = run_feed_stream(&url, &bus) => {
                if let Err(e) = result {
                    warn!(error = %e, "trade feed disconnected");
                }
            }
            _ = shutdown.changed() => break,
        }

        // A connection that stayed up for a while resets the backoff.
        if started.elapsed() > Duration::from_millis(retry.max_delay_ms) {
            attempt = 0;
        }
        attempt = attempt.saturating_add(1);
        let delay = retry.delay_for(attempt);
        warn!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting to trade feed");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!("trade feed connector stopped");
}

// ---------------------------------------------------------------------------
// Bus listener
// ---------------------------------------------------------------------------

/// Forward `trades` publications into the ingest channel.
pub async fn run_trade_listener(
    mut trades: broadcast::Receiver<String>,
    ingest: mpsc::Sender<String>,
    metrics: Arc<PipelineMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let raw = tokio::select! {
            msg = trades.recv() => msg,
            _ = shutdown.changed() => break,
        };

        match raw {
            Ok(raw) => {
                PipelineMetrics::incr(&metrics.trades_received);
                match ingest.try_send(raw) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        PipelineMetrics::incr(&metrics.trades_dropped_backpressure);
                        warn!("ingest channel full, trade dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                PipelineMetrics::add(&metrics.trades_dropped_backpressure, missed);
                warn!(missed, "trade listener lagged behind the bus");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    info!("trade listener stopped");
}
