// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/` and are read-only:
//   GET /api/v1/health        pipeline health, queue depth and counters
//   GET /api/v1/candles/live  every live candle, ordered by symbol/timeframe
//   GET /api/v1/dead-letters  batches that exhausted their write retries
//   GET /api/v1/ws            WebSocket upgrade (see `ws`)
//
// CORS is permissive; the service exposes no mutating endpoints.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::app_state::AppState;

/// Build the full router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/candles/live", get(live_candles))
        .route("/api/v1/dead-letters", get(dead_letters))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health())
}

async fn live_candles(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.aggregator.live_candles())
}

async fn dead_letters(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.dead_letters.recent())
}
