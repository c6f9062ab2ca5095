//! Control-channel WebSocket lifecycle: hello, command loop, cleanup.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mirror_relay_core::command::CommandEnvelope;
use mirror_relay_core::protocol::{PROTOCOL_VERSION, ServerMessage};
use mirror_relay_core::types::Issuer;

use crate::state::{ConnectionState, RelayState};

fn encode(message: &ServerMessage) -> Option<String> {
    serde_json::to_string(message).ok()
}

/// Handle one control-channel socket.
///
/// `authorized` is decided at upgrade time. An unauthorized socket is told
/// so and closed without ever being registered for notifications.
pub async fn handle_ws_connection(
    state: Arc<RelayState>,
    ws: WebSocket,
    peer: SocketAddr,
    authorized: bool,
) {
    let conn_id = Uuid::new_v4().to_string();
    let (mut ws_tx, mut ws_rx) = ws.split();

    if !authorized {
        warn!(conn_id = %conn_id, peer = %peer.ip(), "Rejecting unauthenticated socket");
        if let Some(msg) = encode(&ServerMessage::Error {
            error: "unauthorized".into(),
        }) {
            let _ = ws_tx.send(Message::Text(msg.into())).await;
        }
        let _ = ws_tx.send(Message::Close(None)).await;
        release(&state, peer);
        return;
    }

    info!(conn_id = %conn_id, peer = %peer.ip(), "New control connection");
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<String>();

    let hello = ServerMessage::Hello {
        protocol: PROTOCOL_VERSION,
        version: env!("CARGO_PKG_VERSION").to_string(),
        conn_id: conn_id.clone(),
    };
    if let Some(msg) = encode(&hello) {
        if ws_tx.send(Message::Text(msg.into())).await.is_err() {
            release(&state, peer);
            return;
        }
    }

    state.connections.write().await.insert(
        conn_id.clone(),
        ConnectionState {
            conn_id: conn_id.clone(),
            event_tx: event_tx.clone(),
            authenticated: true,
        },
    );
    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_connect();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = event_rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<CommandEnvelope>(&text) {
                Ok(envelope) => {
                    // Commands race independently; a slow one never blocks the socket.
                    let state = state.clone();
                    let event_tx = event_tx.clone();
                    let issuer = Issuer::Socket(conn_id.clone());
                    tokio::spawn(async move {
                        let result = crate::routes::run_command(&state, envelope.command, &issuer).await;
                        let reply = ServerMessage::CommandResult {
                            id: envelope.id,
                            result,
                        };
                        if let Some(msg) = encode(&reply) {
                            let _ = event_tx.send(msg);
                        }
                    });
                }
                Err(e) => {
                    debug!(conn_id = %conn_id, %e, "Invalid command frame");
                    if let Some(msg) = encode(&ServerMessage::Error {
                        error: format!("invalid command: {e}"),
                    }) {
                        let _ = event_tx.send(msg);
                    }
                }
            },
            Ok(Message::Close(_)) => {
                debug!(conn_id = %conn_id, "Client requested close");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(conn_id = %conn_id, %e, "WebSocket error");
                break;
            }
        }
    }

    send_task.abort();
    state.connections.write().await.remove(&conn_id);
    release(&state, peer);
    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_disconnect();
    info!(conn_id = %conn_id, "Control connection closed");
}

fn release(state: &RelayState, peer: SocketAddr) {
    if let Some(limiter) = &state.rate_limiter {
        limiter.release(peer.ip());
    }
}
