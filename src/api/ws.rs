// =============================================================================
// WebSocket Handler — client sessions for the fan-out gateway
// =============================================================================
//
// Clients connect to `/api/v1/ws` and exchange JSON frames shaped as
// `{"event": "...", "data": {...}}`:
//   - inbound: subscribe-candles, unsubscribe-candles, subscribe-trades,
//     unsubscribe-trades, ping
//   - outbound: candle-snapshot, live-trade, pong
//
// Each connection runs one `tokio::select!` loop that forwards queued frames
// from the gateway and applies inbound events.  The session is removed from
// the gateway on every exit path.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::gateway::{FanoutGateway, SessionId};
use crate::types::ClientEvent;

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let gateway = state.gateway.clone();
    ws.on_upgrade(move |socket| handle_ws_connection(socket, gateway))
}

async fn handle_ws_connection(socket: WebSocket, gateway: Arc<FanoutGateway>) {
    let (session, mut outbound) = gateway.connect();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            // ── Outbound: frames routed to this session ─────────────────
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sender.send(Message::Text(frame)).await {
                    debug!(session = %session, error = %e, "WebSocket send failed, disconnecting");
                    break;
                }
            }

            // ── Inbound: client events ──────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_text(&gateway, session, &text) {
                            if let Err(e) = sender.send(Message::Text(reply)).await {
                                debug!(session = %session, error = %e, "failed to send reply, disconnecting");
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(session = %session, error = %e, "failed to send Pong, disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!(session = %session, "WebSocket Close frame received");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(session = %session, error = %e, "WebSocket receive error, disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    gateway.disconnect(session);
}

/// Apply one inbound text frame.  Returns the serialized reply, if any.
/// Frames that do not parse are logged and ignored; the session stays open.
fn handle_text(gateway: &FanoutGateway, session: SessionId, text: &str) -> Option<String> {
    let event = match ClientEvent::parse(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(session = %session, error = %e, "ignoring malformed client frame");
            return None;
        }
    };

    let reply = gateway.handle_event(session, event)?;
    match serde_json::to_string(&reply) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!(session = %session, error = %e, "failed to serialize reply");
            None
        }
    }
}
