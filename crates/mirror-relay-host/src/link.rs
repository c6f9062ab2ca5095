//! A single live CDP session to the host.
//!
//! Outbound calls carry a fresh numeric id and park in a [`PendingCalls`]
//! table until the matching response arrives or the call times out. The
//! inbound pump also tracks execution contexts from `Runtime.*` events.
//! When the socket ends, every parked call fails with
//! [`RelayError::LinkLost`] and [`HostLink::closed`] resolves.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{RwLock, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use mirror_relay_core::config::HostConfig;
use mirror_relay_core::error::{RelayError, Result};
use mirror_relay_core::pending::{PendingCalls, PendingError};

/// An isolated script-evaluation environment inside the host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExecutionContext {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub origin: String,
}

/// Evaluates scripts inside host contexts. Implemented by [`HostLink`];
/// capture and dispatch only depend on this.
#[async_trait]
pub trait ScriptHost: Send + Sync {
    /// Contexts in creation order.
    async fn contexts(&self) -> Vec<ExecutionContext>;

    /// Evaluate `expression` in `context_id` and return its by-value result.
    async fn evaluate(&self, context_id: i64, expression: &str) -> Result<Value>;
}

/// Inbound frame, classified.
#[derive(Debug, PartialEq)]
enum HostFrame {
    Response {
        id: u64,
        outcome: std::result::Result<Value, String>,
    },
    ContextCreated(ExecutionContext),
    ContextDestroyed(i64),
    ContextsCleared,
    Event(String),
}

impl HostFrame {
    fn parse(text: &str) -> Option<Self> {
        let mut frame: Value = serde_json::from_str(text).ok()?;

        if let Some(id) = frame.get("id").and_then(Value::as_u64) {
            let outcome = match frame.get_mut("error") {
                Some(err) => Err(err
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string())),
                None => Ok(frame.get_mut("result").map(Value::take).unwrap_or(Value::Null)),
            };
            return Some(Self::Response { id, outcome });
        }

        let method = frame.get("method")?.as_str()?.to_string();
        let params = frame.get_mut("params").map(Value::take).unwrap_or(Value::Null);
        Some(match method.as_str() {
            "Runtime.executionContextCreated" => {
                let ctx = serde_json::from_value(params.get("context")?.clone()).ok()?;
                Self::ContextCreated(ctx)
            }
            "Runtime.executionContextDestroyed" => {
                Self::ContextDestroyed(params.get("executionContextId")?.as_i64()?)
            }
            "Runtime.executionContextsCleared" => Self::ContextsCleared,
            _ => Self::Event(method),
        })
    }
}

struct LinkInner {
    outbound: mpsc::UnboundedSender<String>,
    next_id: AtomicU64,
    pending: PendingCalls<u64, Result<Value>>,
    contexts: RwLock<Vec<ExecutionContext>>,
    call_timeout: Duration,
    closed: CancellationToken,
}

/// Cheap-to-clone handle to one host session.
#[derive(Clone)]
pub struct HostLink {
    inner: Arc<LinkInner>,
}

impl HostLink {
    /// Build a link over an already-established text transport.
    ///
    /// `outbound` receives serialized requests; `inbound` yields raw frames
    /// from the host and ends when the transport closes.
    pub fn from_transport(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
        call_timeout: Duration,
    ) -> Self {
        let inner = Arc::new(LinkInner {
            outbound,
            next_id: AtomicU64::new(0),
            pending: PendingCalls::new(),
            contexts: RwLock::new(Vec::new()),
            call_timeout,
            closed: CancellationToken::new(),
        });
        tokio::spawn(pump_inbound(inner.clone(), inbound));
        Self { inner }
    }

    /// Open the WebSocket at `ws_url`, enable runtime events and give the
    /// host `settle_delay_ms` to report its existing contexts.
    pub async fn connect(ws_url: &str, config: &HostConfig) -> Result<Self> {
        let (ws, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|e| RelayError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        let link = Self::from_transport(
            out_tx,
            in_rx,
            Duration::from_millis(config.call_timeout_ms),
        );

        let closed = link.inner.closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    next = out_rx.recv() => match next {
                        Some(text) => {
                            if sink.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text.to_string()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "Host socket error");
                        break;
                    }
                }
            }
            // Dropping in_tx ends the inbound pump, which closes the link.
        });

        if let Err(e) = link.call("Runtime.enable", json!({})).await {
            link.close();
            return Err(e);
        }
        tokio::time::sleep(Duration::from_millis(config.settle_delay_ms)).await;
        let contexts = link.inner.contexts.read().await.len();
        info!(url = ws_url, contexts, "Host link established");
        Ok(link)
    }

    /// Issue one CDP call and wait for its response.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let inner = &self.inner;
        if inner.closed.is_cancelled() {
            return Err(RelayError::LinkLost);
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let rx = inner.pending.register(id).await;
        // The pump may have cleared the table while we registered.
        if inner.closed.is_cancelled() {
            inner.pending.cancel(&id).await;
            return Err(RelayError::LinkLost);
        }

        let frame = json!({ "id": id, "method": method, "params": params });
        if inner.outbound.send(frame.to_string()).is_err() {
            inner.pending.cancel(&id).await;
            return Err(RelayError::LinkLost);
        }
        trace!(id, method, "Host call sent");

        match inner.pending.wait(id, rx, inner.call_timeout).await {
            Ok(outcome) => outcome,
            Err(PendingError::TimedOut) => Err(RelayError::CallTimeout {
                method: method.to_string(),
                timeout_ms: inner.call_timeout.as_millis() as u64,
            }),
            Err(PendingError::Abandoned) => Err(RelayError::LinkLost),
        }
    }

    /// Resolves once the session has ended for any reason.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Tear the session down. Parked calls fail with `LinkLost`.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub async fn pending_len(&self) -> usize {
        self.inner.pending.len().await
    }
}

#[async_trait]
impl ScriptHost for HostLink {
    async fn contexts(&self) -> Vec<ExecutionContext> {
        self.inner.contexts.read().await.clone()
    }

    async fn evaluate(&self, context_id: i64, expression: &str) -> Result<Value> {
        let mut result = self
            .call(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "contextId": context_id,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;

        if let Some(details) = result.get("exceptionDetails") {
            let text = details
                .pointer("/exception/description")
                .or_else(|| details.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("script threw");
            return Err(RelayError::Remote(text.to_string()));
        }
        Ok(result
            .pointer_mut("/result/value")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }
}

async fn pump_inbound(inner: Arc<LinkInner>, mut inbound: mpsc::UnboundedReceiver<String>) {
    loop {
        let text = tokio::select! {
            _ = inner.closed.cancelled() => break,
            next = inbound.recv() => match next {
                Some(text) => text,
                None => break,
            },
        };

        match HostFrame::parse(&text) {
            Some(HostFrame::Response { id, outcome }) => {
                let value = outcome.map_err(RelayError::Remote);
                if !inner.pending.resolve(&id, value).await {
                    debug!(id, "Dropping late or unknown host response");
                }
            }
            Some(HostFrame::ContextCreated(ctx)) => {
                debug!(id = ctx.id, name = %ctx.name, "Execution context created");
                let mut contexts = inner.contexts.write().await;
                contexts.retain(|c| c.id != ctx.id);
                contexts.push(ctx);
            }
            Some(HostFrame::ContextDestroyed(id)) => {
                debug!(id, "Execution context destroyed");
                inner.contexts.write().await.retain(|c| c.id != id);
            }
            Some(HostFrame::ContextsCleared) => {
                debug!("Execution contexts cleared");
                inner.contexts.write().await.clear();
            }
            Some(HostFrame::Event(method)) => trace!(method = %method, "Host event ignored"),
            None => warn!(len = text.len(), "Unparseable host frame"),
        }
    }

    inner.closed.cancel();
    inner.contexts.write().await.clear();
    let dropped = inner.pending.clear().await;
    warn!(dropped, "Host link closed");
}
