//! Public side of the bridge (`GET /bridge`).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mirror_relay_core::backend::CommandTarget;
use mirror_relay_core::command::{AppState, ChatFeedback, Command, CommandResult};
use mirror_relay_core::error::{RelayError, Result};
use mirror_relay_core::pending::{PendingCalls, PendingError};
use mirror_relay_core::protocol::{BridgeFrame, HostQuery};
use mirror_relay_core::snapshot::{Snapshot, fingerprint};
use mirror_relay_core::types::Issuer;

use crate::auth::constant_time_eq;
use crate::state::RelayState;

/// What a bridged request resolves to.
#[derive(Debug)]
enum BridgeReply {
    Command(CommandResult),
    Query(std::result::Result<Value, String>),
}

struct ActiveBridge {
    id: String,
    tx: mpsc::UnboundedSender<String>,
    evicted: CancellationToken,
}

/// Accepts inbound bridges and uses the authenticated one as the relay's
/// command target. A newer authenticated bridge replaces the previous one.
pub struct BridgeHub {
    token: Option<String>,
    active: RwLock<Option<ActiveBridge>>,
    pending: PendingCalls<String, BridgeReply>,
    request_timeout: Duration,
}

fn encode(frame: &BridgeFrame) -> Option<String> {
    serde_json::to_string(frame).ok()
}

impl BridgeHub {
    pub fn new(token: Option<String>, request_timeout: Duration) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
            active: RwLock::new(None),
            pending: PendingCalls::new(),
            request_timeout,
        }
    }

    fn token_matches(&self, candidate: &str) -> bool {
        self.token
            .as_deref()
            .is_some_and(|t| constant_time_eq(t, candidate))
    }

    /// Id of the authenticated bridge, if any.
    pub async fn active_id(&self) -> Option<String> {
        self.active.read().await.as_ref().map(|a| a.id.clone())
    }

    async fn is_active(&self, id: &str) -> bool {
        self.active
            .read()
            .await
            .as_ref()
            .is_some_and(|a| a.id == id)
    }

    async fn install(&self, id: &str, tx: mpsc::UnboundedSender<String>, evicted: CancellationToken) {
        let previous = self.active.write().await.replace(ActiveBridge {
            id: id.to_string(),
            tx,
            evicted,
        });
        if let Some(old) = previous {
            info!(old = %old.id, new = %id, "Replacing bridge");
            old.evicted.cancel();
            self.pending.clear().await;
        }
    }

    /// Serve one inbound bridge socket until it closes or is replaced.
    pub async fn handle_socket(&self, state: Arc<RelayState>, ws: WebSocket, peer: SocketAddr) {
        let bridge_id = Uuid::new_v4().to_string();
        info!(bridge_id = %bridge_id, peer = %peer.ip(), "Bridge connected");

        let (mut ws_tx, mut ws_rx) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let evicted = CancellationToken::new();

        let writer_evicted = evicted.clone();
        let send_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_evicted.cancelled() => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                    next = out_rx.recv() => match next {
                        Some(msg) => {
                            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        let send = |frame: BridgeFrame| {
            if let Some(msg) = encode(&frame) {
                let _ = out_tx.send(msg);
            }
        };

        let mut authenticated = false;
        loop {
            let msg = tokio::select! {
                _ = evicted.cancelled() => break,
                msg = ws_rx.next() => msg,
            };
            let text = match msg {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(bridge_id = %bridge_id, %e, "Bridge socket error");
                    break;
                }
            };
            let frame = match serde_json::from_str::<BridgeFrame>(&text) {
                Ok(f) => f,
                Err(e) => {
                    debug!(bridge_id = %bridge_id, %e, "Invalid bridge frame");
                    continue;
                }
            };

            if !authenticated {
                match frame {
                    BridgeFrame::AuthBridge { token } if self.token_matches(&token) => {
                        authenticated = true;
                        self.install(&bridge_id, out_tx.clone(), evicted.clone()).await;
                        send(BridgeFrame::AuthSuccess);
                        info!(bridge_id = %bridge_id, "Bridge authenticated");
                    }
                    BridgeFrame::AuthBridge { .. } => {
                        warn!(bridge_id = %bridge_id, peer = %peer.ip(), "Bridge token rejected");
                        send(BridgeFrame::AuthError {
                            message: "invalid token".into(),
                        });
                    }
                    _ => {
                        debug!(bridge_id = %bridge_id, "Frame before authentication dropped");
                        send(BridgeFrame::AuthError {
                            message: "not authenticated".into(),
                        });
                    }
                }
                continue;
            }

            match frame {
                BridgeFrame::Snapshot { snapshot } => {
                    if self.is_active(&bridge_id).await {
                        state.publish(refingerprint(snapshot)).await;
                    }
                }
                BridgeFrame::CommandResult { id, result } => {
                    if !self.pending.resolve(&id, BridgeReply::Command(result)).await {
                        debug!(id = %id, "Late bridged command result");
                    }
                }
                BridgeFrame::QueryResult {
                    id,
                    ok,
                    payload,
                    error,
                } => {
                    let reply = if ok {
                        Ok(payload.unwrap_or(Value::Null))
                    } else {
                        Err(error.unwrap_or_else(|| "query failed".into()))
                    };
                    if !self.pending.resolve(&id, BridgeReply::Query(reply)).await {
                        debug!(id = %id, "Late bridged query result");
                    }
                }
                BridgeFrame::Ping => send(BridgeFrame::Pong),
                _ => {}
            }
        }

        send_task.abort();
        let mut active = self.active.write().await;
        if active.as_ref().is_some_and(|a| a.id == bridge_id) {
            *active = None;
            drop(active);
            let dropped = self.pending.clear().await;
            warn!(bridge_id = %bridge_id, dropped, "Active bridge disconnected");
        } else {
            info!(bridge_id = %bridge_id, "Bridge disconnected");
        }
    }

    async fn request(&self, id: String, frame: BridgeFrame) -> Result<BridgeReply> {
        let tx = self
            .active
            .read()
            .await
            .as_ref()
            .map(|a| a.tx.clone())
            .ok_or_else(|| RelayError::Bridge("no bridge connected".into()))?;

        let rx = self.pending.register(id.clone()).await;
        let Some(msg) = encode(&frame) else {
            self.pending.cancel(&id).await;
            return Err(RelayError::Bridge("unencodable frame".into()));
        };
        if tx.send(msg).is_err() {
            self.pending.cancel(&id).await;
            return Err(RelayError::Bridge("bridge closed".into()));
        }

        match self.pending.wait(id, rx, self.request_timeout).await {
            Ok(reply) => Ok(reply),
            Err(PendingError::TimedOut) => Err(RelayError::CallTimeout {
                method: "bridge".into(),
                timeout_ms: self.request_timeout.as_millis() as u64,
            }),
            Err(PendingError::Abandoned) => Err(RelayError::Bridge("bridge lost".into())),
        }
    }

    async fn query(&self, query: HostQuery) -> Result<Value> {
        let id = Uuid::new_v4().to_string();
        match self
            .request(id.clone(), BridgeFrame::Query { id, query })
            .await?
        {
            BridgeReply::Query(Ok(value)) => Ok(value),
            BridgeReply::Query(Err(e)) => Err(RelayError::Remote(e)),
            BridgeReply::Command(_) => Err(RelayError::Bridge("mismatched reply".into())),
        }
    }
}

/// Recompute the fingerprint so a forwarded snapshot always pairs with its
/// own markup.
fn refingerprint(snapshot: Snapshot) -> Snapshot {
    Snapshot {
        fingerprint: fingerprint(&snapshot.markup),
        ..snapshot
    }
}

#[async_trait]
impl CommandTarget for BridgeHub {
    async fn dispatch(&self, command: Command, issuer: &Issuer) -> CommandResult {
        let id = Uuid::new_v4().to_string();
        let kind = command.kind();
        debug!(id = %id, kind, %issuer, "Forwarding command over bridge");
        match self
            .request(id.clone(), BridgeFrame::Command { id, command })
            .await
        {
            Ok(BridgeReply::Command(result)) => result,
            Ok(BridgeReply::Query(_)) => CommandResult::failure("mismatched bridge reply"),
            Err(e) => CommandResult::failure(e.to_string()),
        }
    }

    async fn app_state(&self) -> Result<AppState> {
        let value = self.query(HostQuery::AppState).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn chat_feedback(&self) -> Result<ChatFeedback> {
        let value = self.query(HostQuery::ChatFeedback).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn is_connected(&self) -> bool {
        self.active.read().await.is_some()
    }
}
