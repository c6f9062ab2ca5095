//! HTTP + WebSocket client for a relay's pull endpoints and control channel.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::{RwLock, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info};

use mirror_relay_core::command::{AppState, ChatFeedback, Command, CommandResult};
use mirror_relay_core::config::BotConfig;

/// What the bot needs from a relay.
#[async_trait]
pub trait RelayApi: Send + Sync + 'static {
    async fn health(&self) -> anyhow::Result<Value>;
    async fn app_state(&self) -> anyhow::Result<AppState>;
    async fn chat_feedback(&self) -> anyhow::Result<ChatFeedback>;
    async fn command(&self, command: Command) -> anyhow::Result<CommandResult>;
    /// Follow the control channel until it closes, sending `()` on every
    /// `state_changed`.
    async fn watch(&self, changes: &mpsc::UnboundedSender<()>) -> anyhow::Result<()>;
}

pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
    password: Option<String>,
    token: RwLock<Option<String>>,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>, password: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            password: password.filter(|p| !p.is_empty()),
            token: RwLock::new(None),
        }
    }

    pub fn from_config(config: &BotConfig) -> Self {
        Self::new(config.relay_url.clone(), config.resolve_relay_password())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Exchange the relay password for a session token.
    pub async fn login(&self) -> anyhow::Result<()> {
        let Some(password) = &self.password else {
            return Ok(());
        };
        let resp = self
            .http
            .post(format!("{}/login", self.base_url))
            .json(&json!({ "password": password }))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("relay login failed: {}", resp.status());
        }
        let body: Value = resp.json().await?;
        let token = body
            .get("token")
            .and_then(|t| t.as_str())
            .map(str::to_string);
        info!(relay = %self.base_url, "Logged in to relay");
        *self.token.write().await = token;
        Ok(())
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> anyhow::Result<reqwest::Response> {
        let mut relogged = false;
        loop {
            let mut req = self
                .http
                .request(method.clone(), format!("{}{path}", self.base_url));
            if let Some(token) = self.token.read().await.as_deref() {
                req = req.bearer_auth(token);
            }
            if let Some(body) = body {
                req = req.json(body);
            }
            let resp = req.send().await?;
            if resp.status() == StatusCode::UNAUTHORIZED && self.password.is_some() && !relogged {
                debug!(path, "Relay session rejected, logging in");
                self.login().await?;
                relogged = true;
                continue;
            }
            return Ok(resp);
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        decode(self.send(Method::GET, path, None).await?).await
    }

    /// Control-channel URL derived from the HTTP base.
    pub fn ws_url(&self) -> String {
        let base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{base}/ws")
    }

    async fn follow(&self, changes: &mpsc::UnboundedSender<()>) -> anyhow::Result<()> {
        if self.password.is_some() && self.token.read().await.is_none() {
            self.login().await?;
        }
        let mut request = self.ws_url().into_client_request()?;
        if let Some(token) = self.token.read().await.as_deref() {
            request
                .headers_mut()
                .insert("authorization", HeaderValue::from_str(&format!("Bearer {token}"))?);
        }

        let (ws, _) = tokio_tungstenite::connect_async(request).await?;
        let (_sink, mut stream) = ws.split();
        while let Some(msg) = stream.next().await {
            let text = match msg? {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };
            let frame: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    debug!(error = %e, "Ignoring malformed relay frame");
                    continue;
                }
            };
            match frame.get("type").and_then(|t| t.as_str()) {
                Some("hello") => info!(relay = %self.base_url, "Watching relay"),
                Some("state_changed") => {
                    if changes.send(()).is_err() {
                        break;
                    }
                }
                Some("error") => {
                    // A stale session is refreshed on the next attempt.
                    self.token.write().await.take();
                    anyhow::bail!("relay refused control channel: {}", frame["error"]);
                }
                _ => {}
            }
        }
        Ok(())
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> anyhow::Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        let code = body
            .get("message")
            .or_else(|| body.get("error"))
            .and_then(|e| e.as_str())
            .unwrap_or("unknown error");
        anyhow::bail!("relay returned {status}: {code}");
    }
    Ok(resp.json().await?)
}

#[async_trait]
impl RelayApi for RelayClient {
    async fn health(&self) -> anyhow::Result<Value> {
        self.get_json("/health").await
    }

    async fn app_state(&self) -> anyhow::Result<AppState> {
        self.get_json("/api/app-state").await
    }

    async fn chat_feedback(&self) -> anyhow::Result<ChatFeedback> {
        self.get_json("/api/chat-feedback").await
    }

    async fn command(&self, command: Command) -> anyhow::Result<CommandResult> {
        let body = serde_json::to_value(&command)?;
        decode(self.send(Method::POST, "/api/command", Some(&body)).await?).await
    }

    async fn watch(&self, changes: &mpsc::UnboundedSender<()>) -> anyhow::Result<()> {
        self.follow(changes).await
    }
}
