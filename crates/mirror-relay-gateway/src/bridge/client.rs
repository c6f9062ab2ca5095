//! Outbound side of the bridge.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mirror_relay_core::protocol::{BridgeFrame, HostQuery};
use mirror_relay_core::reconnect::supervise;
use mirror_relay_core::snapshot::Snapshot;
use mirror_relay_core::types::Issuer;

use super::BridgeState;
use crate::state::RelayState;

/// Dials a public relay and serves it from the local relay state.
pub struct BridgeClient {
    state: Arc<RelayState>,
    url: String,
    token: String,
    reconnect_delay: Duration,
    status: RwLock<BridgeState>,
}

fn send(out: &mpsc::UnboundedSender<String>, frame: &BridgeFrame) {
    match serde_json::to_string(frame) {
        Ok(text) => {
            let _ = out.send(text);
        }
        Err(e) => warn!(error = %e, "Failed to encode bridge frame"),
    }
}

impl BridgeClient {
    pub fn new(
        state: Arc<RelayState>,
        url: impl Into<String>,
        token: impl Into<String>,
        reconnect_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            url: url.into(),
            token: token.into(),
            reconnect_delay,
            status: RwLock::new(BridgeState::Disconnected),
        })
    }

    pub async fn status(&self) -> BridgeState {
        *self.status.read().await
    }

    async fn set_status(&self, status: BridgeState) {
        let mut current = self.status.write().await;
        if *current != status {
            debug!(url = %self.url, from = %*current, to = %status, "Bridge state");
            *current = status;
        }
    }

    /// Keep the bridge up until `shutdown`, reconnecting after a fixed delay.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<u64> {
        let client = self.clone();
        tokio::spawn(async move {
            let delay = client.reconnect_delay;
            supervise("bridge", delay, shutdown, |attempt| {
                let client = client.clone();
                async move { client.session(attempt).await }
            })
            .await
        })
    }

    async fn session(self: Arc<Self>, attempt: u64) -> anyhow::Result<()> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        info!(url = %self.url, attempt, "Bridge connected");
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        self.set_status(BridgeState::Authenticating).await;
        send(
            &out_tx,
            &BridgeFrame::AuthBridge {
                token: self.token.clone(),
            },
        );

        let mut snapshots = self.state.subscribe();
        let outcome = loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<BridgeFrame>(&text) {
                            Ok(frame) => {
                                if let Err(e) = self.handle_frame(frame, &out_tx).await {
                                    break Err(e);
                                }
                            }
                            Err(e) => debug!(error = %e, "Invalid bridge frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(e.into()),
                },
                next = snapshots.recv() => match next {
                    Ok(snapshot) => self.forward(&snapshot, &out_tx).await,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Bridge lagged behind snapshots");
                        if let Some(latest) = self.state.snapshots.latest().await {
                            self.forward(&latest, &out_tx).await;
                        }
                    }
                    Err(RecvError::Closed) => break Ok(()),
                },
            }
        };

        self.set_status(BridgeState::Disconnected).await;
        writer.abort();
        outcome
    }

    async fn forward(&self, snapshot: &Snapshot, out: &mpsc::UnboundedSender<String>) {
        if self.status().await != BridgeState::Authenticated {
            return;
        }
        send(
            out,
            &BridgeFrame::Snapshot {
                snapshot: snapshot.clone(),
            },
        );
    }

    /// React to one frame from the public relay. An error ends the session.
    async fn handle_frame(
        &self,
        frame: BridgeFrame,
        out: &mpsc::UnboundedSender<String>,
    ) -> anyhow::Result<()> {
        let authenticated = self.status().await == BridgeState::Authenticated;
        match frame {
            BridgeFrame::AuthSuccess => {
                self.set_status(BridgeState::Authenticated).await;
                info!(url = %self.url, "Bridge authenticated");
                if let Some(latest) = self.state.snapshots.latest().await {
                    self.forward(&latest, out).await;
                }
            }
            BridgeFrame::AuthError { message } => {
                anyhow::bail!("bridge authentication failed: {message}");
            }
            BridgeFrame::Ping => send(out, &BridgeFrame::Pong),
            BridgeFrame::Pong => {}
            other if !authenticated => {
                debug!(frame = ?other, "Ignoring frame before authentication");
            }
            BridgeFrame::Command { id, command } => {
                let state = self.state.clone();
                let out = out.clone();
                tokio::spawn(async move {
                    let issuer = Issuer::Bridge(id.clone());
                    let result = crate::routes::run_command(&state, command, &issuer).await;
                    send(&out, &BridgeFrame::CommandResult { id, result });
                });
            }
            BridgeFrame::Query { id, query } => {
                let state = self.state.clone();
                let out = out.clone();
                tokio::spawn(async move {
                    let reply = match run_query(&state, query).await {
                        Ok(payload) => BridgeFrame::QueryResult {
                            id,
                            ok: true,
                            payload: Some(payload),
                            error: None,
                        },
                        Err(e) => BridgeFrame::QueryResult {
                            id,
                            ok: false,
                            payload: None,
                            error: Some(e.to_string()),
                        },
                    };
                    send(&out, &reply);
                });
            }
            other => debug!(frame = ?other, "Unexpected bridge frame"),
        }
        Ok(())
    }
}

async fn run_query(state: &RelayState, query: HostQuery) -> mirror_relay_core::error::Result<Value> {
    match query {
        HostQuery::AppState => Ok(serde_json::to_value(state.target.app_state().await?)?),
        HostQuery::ChatFeedback => Ok(serde_json::to_value(state.target.chat_feedback().await?)?),
    }
}
