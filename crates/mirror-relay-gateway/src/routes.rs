//! HTTP handlers: health, pull endpoints, command relay, socket upgrades.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::debug;

use mirror_relay_core::command::{CommandEnvelope, CommandResult};
use mirror_relay_core::error::RelayError;
use mirror_relay_core::types::Issuer;

use crate::connection::handle_ws_connection;
use crate::state::RelayState;

/// Map an error to a status code and `{error, message}` body.
pub fn error_response(err: &RelayError) -> Response {
    let status = match err {
        RelayError::Unauthorized => StatusCode::UNAUTHORIZED,
        RelayError::NotReady | RelayError::LinkLost | RelayError::DiscoveryFailed(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        RelayError::CallTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        RelayError::Bridge(_) | RelayError::Remote(_) | RelayError::Connect(_) => {
            StatusCode::BAD_GATEWAY
        }
        RelayError::Json(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({ "error": err.code(), "message": err.to_string() })),
    )
        .into_response()
}

/// Dispatch one command through the relay's target, with logging and metrics.
pub async fn run_command(
    state: &RelayState,
    command: mirror_relay_core::command::Command,
    issuer: &Issuer,
) -> CommandResult {
    let kind = command.kind();
    let started = std::time::Instant::now();
    let result = state.target.dispatch(command, issuer).await;
    debug!(
        kind,
        %issuer,
        ok = result.ok,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Command relayed"
    );
    #[cfg(feature = "metrics")]
    crate::metrics::record_command(kind, result.ok, started.elapsed().as_secs_f64());
    result
}

pub async fn health_handler(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    let connections = state.connections.read().await.len();
    let host_connected = state.target.is_connected().await;
    let snapshot = state.snapshots.latest().await;

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": connections,
        "host_connected": host_connected,
        "has_snapshot": snapshot.is_some(),
        "fingerprint": snapshot.as_ref().map(|s| s.fingerprint.clone()),
        "broadcasts": state.broadcast_count(),
    }))
}

/// `GET /api/snapshot`: the retained snapshot, 503 before the first capture.
pub async fn snapshot_handler(State(state): State<Arc<RelayState>>) -> Response {
    match state.snapshots.latest().await {
        Some(snapshot) => Json(snapshot.as_ref().clone()).into_response(),
        None => error_response(&RelayError::NotReady),
    }
}

pub async fn app_state_handler(State(state): State<Arc<RelayState>>) -> Response {
    match state.target.app_state().await {
        Ok(app) => Json(app).into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn chat_feedback_handler(State(state): State<Arc<RelayState>>) -> Response {
    match state.target.chat_feedback().await {
        Ok(feedback) => Json(feedback).into_response(),
        Err(e) => error_response(&e),
    }
}

/// `POST /api/command`: same command JSON as the control channel.
pub async fn command_handler(
    State(state): State<Arc<RelayState>>,
    Json(envelope): Json<CommandEnvelope>,
) -> Response {
    let result = run_command(&state, envelope.command, &Issuer::Http).await;
    let mut body = json!(result);
    if let (Some(id), Some(obj)) = (envelope.id, body.as_object_mut()) {
        obj.insert("id".into(), json!(id));
    }
    Json(body).into_response()
}

/// `GET /ws`: control channel.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if let Some(limiter) = &state.rate_limiter {
        if !limiter.check(peer.ip()) {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "error": "rate_limited" })),
            )
                .into_response();
        }
    }
    let authorized = state.auth.is_authorized(peer.ip(), &headers);
    ws.on_upgrade(move |socket| handle_ws_connection(state, socket, peer, authorized))
}

/// `GET /bridge`: inbound bridge from a relay that can reach the host.
pub async fn bridge_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    let Some(hub) = state.bridge_hub.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    ws.on_upgrade(move |socket| async move { hub.handle_socket(state, socket, peer).await })
}
