// =============================================================================
// Candle Pooler — Main Entry Point
// =============================================================================
//
// Pipeline:
//   feed -> bus `trades` -> listener -> ingest -> { trade_queue, aggregator }
//   trade_queue -> batch processor -> TimescaleDB
//   aggregator -> snapshot broadcaster -> bus `candle-snapshots`
//   bus -> fan-out gateway -> WebSocket sessions
//
// Shutdown stops the producers first, lets ingest drain, then lets the batch
// processor flush what is still queued before the store is closed.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod bus;
mod error;
mod gateway;
mod market_data;
mod metrics;
mod pipeline;
mod price;
mod runtime_config;
mod store;
mod types;

use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::bus::Publisher;
use crate::pipeline::{BatchProcessor, SnapshotBroadcaster};
use crate::runtime_config::{RetryPolicy, RuntimeConfig};
use crate::store::{TimescaleStore, TradeStore};
use crate::types::TRADES_CHANNEL;

const CONFIG_PATH: &str = "pooler_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Candle Pooler starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env(|key| std::env::var(key).ok());
    config.validate().context("invalid runtime config")?;

    info!(
        symbols = ?config.symbols,
        table = %config.table,
        overflow_policy = %config.overflow_policy,
        "configuration resolved"
    );

    // ── 2. Durable store ─────────────────────────────────────────────────
    let store = Arc::new(connect_store(&config.database_url, &config.table, &config.retry).await?);
    store
        .ensure_schema()
        .await
        .context("failed to prepare trade table")?;

    // ── 3. Shared state ──────────────────────────────────────────────────
    let state = Arc::new(AppState::new(&config));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (flush_tx, flush_rx) = watch::channel(false);

    // ── 4. Feed connector + trade listener + ingest ──────────────────────
    let feed_handle = tokio::spawn(market_data::trade_feed::run_feed_connector(
        config.feed_url.clone(),
        state.bus.clone(),
        config.retry.clone(),
        shutdown_rx.clone(),
    ));

    let (ingest_tx, ingest_rx) = mpsc::channel(config.trade_channel_capacity);
    let listener_handle = tokio::spawn(market_data::trade_feed::run_trade_listener(
        state.bus.subscribe(TRADES_CHANNEL),
        ingest_tx,
        state.metrics.clone(),
        shutdown_rx.clone(),
    ));
    let ingest_handle = tokio::spawn(pipeline::ingest::run_ingest(
        ingest_rx,
        state.buffer.clone(),
        state.aggregator.clone(),
    ));

    // ── 5. Batch processor ───────────────────────────────────────────────
    let processor = BatchProcessor::new(
        &config,
        state.buffer.clone(),
        store.clone() as Arc<dyn TradeStore>,
        state.dead_letters.clone(),
        state.metrics.clone(),
    );
    let processor_handle = tokio::spawn(processor.run(flush_rx));

    // ── 6. Snapshot broadcaster ──────────────────────────────────────────
    let broadcaster = SnapshotBroadcaster::new(
        state.aggregator.clone(),
        Arc::new(state.bus.clone()) as Arc<dyn Publisher>,
        state.metrics.clone(),
        config.symbols.clone(),
        config.snapshot_interval(),
        config.publish_timeout(),
    );
    let broadcaster_handle = tokio::spawn(broadcaster.run(shutdown_rx.clone()));

    // ── 7. Fan-out gateway ───────────────────────────────────────────────
    let gateway_handle = tokio::spawn(
        state
            .gateway
            .clone()
            .run(state.bus.clone(), shutdown_rx.clone()),
    );

    // ── 8. API server ────────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "API server listening");

    let app = api::rest::router(state.clone());
    let mut server_shutdown = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "API server failed");
        }
    });

    info!("all subsystems running, press Ctrl+C to stop");

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    let _ = shutdown_tx.send(true);
    for (name, handle) in [
        ("feed connector", feed_handle),
        ("trade listener", listener_handle),
        ("ingest", ingest_handle),
        ("snapshot broadcaster", broadcaster_handle),
        ("gateway", gateway_handle),
        ("api server", server_handle),
    ] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "task ended abnormally");
        }
    }

    // Ingest has drained; everything accepted is in the queue now.
    let _ = flush_tx.send(true);
    if let Err(e) = processor_handle.await {
        error!(task = "batch processor", error = %e, "task ended abnormally");
    }

    store.close().await;
    info!(metrics = ?state.metrics.snapshot(), "Candle Pooler shut down complete");
    Ok(())
}

/// Connect to the database, backing off between attempts.  Fatal once the
/// retry policy is exhausted.
async fn connect_store(url: &str, table: &str, retry: &RetryPolicy) -> anyhow::Result<TimescaleStore> {
    let mut attempt = 1;
    loop {
        match TimescaleStore::connect(url, table).await {
            Ok(store) => return Ok(store),
            Err(e) if attempt >= retry.max_attempts => {
                error!(error = %e, attempt, "giving up on database connection");
                bail!("database unreachable after {attempt} attempts: {e}");
            }
            Err(e) => {
                let delay = retry.delay_for(attempt);
                warn!(
                    error = %e,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
