//! Relay integration tests: start a real relay and interact via WS + HTTP.
//!
//! Run with: `cargo test -p mirror-relay-gateway --test integration`

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;

use mirror_relay_core::backend::CommandTarget;
use mirror_relay_core::command::{AppState, ChatFeedback, Command, CommandResult};
use mirror_relay_core::config::Config;
use mirror_relay_core::error::Result;
use mirror_relay_core::snapshot::Snapshot;
use mirror_relay_core::types::Issuer;
use mirror_relay_gateway::{BridgeHub, RelayState, build_router, serve};

const REMOTE_IP: &str = "203.0.113.9";

/// Target that records every command it is asked to run.
#[derive(Default)]
struct RecordingTarget {
    commands: Mutex<Vec<Command>>,
}

impl RecordingTarget {
    fn count(&self) -> usize {
        self.commands.lock().unwrap().len()
    }
}

#[async_trait]
impl CommandTarget for RecordingTarget {
    async fn dispatch(&self, command: Command, _issuer: &Issuer) -> CommandResult {
        self.commands.lock().unwrap().push(command);
        CommandResult::success("structural")
    }

    async fn app_state(&self) -> Result<AppState> {
        Ok(AppState {
            mode: Some("Planning".into()),
            model: Some("test-model".into()),
        })
    }

    async fn chat_feedback(&self) -> Result<ChatFeedback> {
        Ok(ChatFeedback::default())
    }

    async fn is_connected(&self) -> bool {
        true
    }
}

struct TestRelay {
    state: Arc<RelayState>,
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl TestRelay {
    fn http(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    fn ws(&self, path: &str) -> String {
        format!("ws://{}{path}", self.addr)
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn config(value: Value) -> Arc<Config> {
    Arc::new(serde_json::from_value(value).unwrap())
}

async fn start_relay(
    config: Arc<Config>,
    target: Arc<dyn CommandTarget>,
    hub: Option<Arc<BridgeHub>>,
) -> TestRelay {
    let state = Arc::new(RelayState::new(config, target, hub));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();

    let app = build_router(state.clone());
    let token = shutdown.clone();
    tokio::spawn(async move {
        let _ = serve(listener, app, token).await;
    });

    TestRelay {
        state,
        addr,
        shutdown,
    }
}

fn snapshot(markup: &str) -> Snapshot {
    Snapshot::new(
        markup.into(),
        ".x{}".into(),
        Default::default(),
        Default::default(),
        Default::default(),
    )
}

async fn next_json<S>(ws: &mut S) -> Value
where
    S: StreamExt<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

fn open_config() -> Arc<Config> {
    config(json!({ "relay": { "ui": false } }))
}

fn locked_config() -> Arc<Config> {
    config(json!({
        "relay": {
            "ui": false,
            "auth": { "password": "hunter2", "session_secret": "k" }
        }
    }))
}

#[tokio::test]
async fn test_health_is_public() {
    let relay = start_relay(locked_config(), Arc::new(RecordingTarget::default()), None).await;

    let resp = reqwest::Client::new()
        .get(relay.http("/health"))
        .header("x-forwarded-for", REMOTE_IP)
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["has_snapshot"], false);
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_snapshot_not_ready_before_first_capture() {
    let relay = start_relay(open_config(), Arc::new(RecordingTarget::default()), None).await;

    let resp = reqwest::get(relay.http("/api/snapshot")).await.unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "not_ready");

    relay.state.publish(snapshot("<h1>A</h1>")).await;
    let body: Value = reqwest::get(relay.http("/api/snapshot"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["markup"], "<h1>A</h1>");
}

#[tokio::test]
async fn test_remote_client_without_session_is_rejected() {
    let target = Arc::new(RecordingTarget::default());
    let relay = start_relay(locked_config(), target.clone(), None).await;
    relay.state.publish(snapshot("<h1>A</h1>")).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(relay.http("/api/snapshot"))
        .header("x-forwarded-for", REMOTE_IP)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .post(relay.http("/api/command"))
        .header("x-forwarded-for", REMOTE_IP)
        .json(&json!({ "type": "stop" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .get(relay.http("/api/app-state"))
        .header("x-forwarded-for", REMOTE_IP)
        .bearer_auth("12345.deadbeef")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    assert_eq!(target.count(), 0);
}

#[tokio::test]
async fn test_login_page_assets_are_public() {
    let locked_with_ui = config(json!({
        "relay": { "auth": { "password": "hunter2", "session_secret": "k" } }
    }));
    let relay = start_relay(locked_with_ui, Arc::new(RecordingTarget::default()), None).await;
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    for path in ["/login.html", "/style.css"] {
        let resp = client
            .get(relay.http(path))
            .header("x-forwarded-for", REMOTE_IP)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200, "{path}");
    }

    let resp = client
        .get(relay.http("/"))
        .header("x-forwarded-for", REMOTE_IP)
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_redirection());
    assert_eq!(resp.headers()["location"], "/login.html");
}

#[tokio::test]
async fn test_login_then_bearer_token() {
    let relay = start_relay(locked_config(), Arc::new(RecordingTarget::default()), None).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(relay.http("/login"))
        .header("x-forwarded-for", REMOTE_IP)
        .json(&json!({ "password": "wrong" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .post(relay.http("/login"))
        .header("x-forwarded-for", REMOTE_IP)
        .json(&json!({ "password": "hunter2" }))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    assert!(resp.headers().get("set-cookie").is_some());
    let body: Value = resp.json().await.unwrap();
    let token = body["token"].as_str().unwrap().to_string();

    let resp = client
        .get(relay.http("/api/app-state"))
        .header("x-forwarded-for", REMOTE_IP)
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["mode"], "Planning");
}

#[tokio::test]
async fn test_unauthorized_socket_gets_error_frame() {
    let relay = start_relay(locked_config(), Arc::new(RecordingTarget::default()), None).await;

    let mut request = relay.ws("/ws").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("x-forwarded-for", REMOTE_IP.parse().unwrap());
    let (mut ws, _) = connect_async(request).await.unwrap();

    let frame = next_json(&mut ws).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["error"], "unauthorized");
    assert_eq!(relay.state.connections.read().await.len(), 0);
}

#[tokio::test]
async fn test_identical_snapshots_notify_once() {
    let relay = start_relay(open_config(), Arc::new(RecordingTarget::default()), None).await;
    let (mut ws, _) = connect_async(relay.ws("/ws")).await.unwrap();

    let hello = next_json(&mut ws).await;
    assert_eq!(hello["type"], "hello");
    assert!(hello["conn_id"].is_string());

    assert!(relay.state.publish(snapshot("<h1>A</h1>")).await);
    assert!(!relay.state.publish(snapshot("<h1>A</h1>")).await);
    assert!(relay.state.publish(snapshot("<h1>B</h1>")).await);

    assert_eq!(next_json(&mut ws).await["type"], "state_changed");
    assert_eq!(next_json(&mut ws).await["type"], "state_changed");
    let extra = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    assert!(extra.is_err(), "unexpected third notification");
    assert_eq!(relay.state.broadcast_count(), 2);
}

#[tokio::test]
async fn test_socket_command_echoes_id() {
    let target = Arc::new(RecordingTarget::default());
    let relay = start_relay(open_config(), target.clone(), None).await;
    let (mut ws, _) = connect_async(relay.ws("/ws")).await.unwrap();
    let _hello = next_json(&mut ws).await;

    let cmd = json!({
        "type": "remote_click",
        "id": "c-1",
        "data": { "relay_id": "r12", "index": 0 }
    });
    ws.send(Message::Text(cmd.to_string().into())).await.unwrap();

    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "command_result");
    assert_eq!(reply["id"], "c-1");
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["method"], "structural");
    assert_eq!(target.count(), 1);

    ws.send(Message::Text("{\"type\":\"warp\"}".into())).await.unwrap();
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
}

#[tokio::test]
async fn test_http_command_matches_socket_shape() {
    let target = Arc::new(RecordingTarget::default());
    let relay = start_relay(open_config(), target.clone(), None).await;

    let body: Value = reqwest::Client::new()
        .post(relay.http("/api/command"))
        .json(&json!({ "type": "set_mode", "mode": "Fast", "id": "h-9" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["id"], "h-9");
    assert_eq!(
        target.commands.lock().unwrap()[0],
        Command::SetMode { mode: "Fast".into() }
    );
}

#[tokio::test]
async fn test_bridge_requires_correct_token() {
    let hub = Arc::new(BridgeHub::new(
        Some("s3cret".into()),
        Duration::from_secs(5),
    ));
    let relay = start_relay(open_config(), hub.clone(), Some(hub.clone())).await;
    let (mut bridge, _) = connect_async(relay.ws("/bridge")).await.unwrap();

    let send = |frame: Value| Message::Text(frame.to_string().into());

    bridge
        .send(send(json!({ "type": "auth_bridge", "token": "guess" })))
        .await
        .unwrap();
    let reply = next_json(&mut bridge).await;
    assert_eq!(reply["type"], "auth_error");

    let frame = json!({ "type": "snapshot", "snapshot": snapshot("<p>x</p>") });
    bridge.send(send(frame.clone())).await.unwrap();
    let reply = next_json(&mut bridge).await;
    assert_eq!(reply["type"], "auth_error");
    assert!(relay.state.snapshots.latest().await.is_none());

    let body: Value = reqwest::Client::new()
        .post(relay.http("/api/command"))
        .json(&json!({ "type": "stop" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["ok"], false);

    bridge
        .send(send(json!({ "type": "auth_bridge", "token": "s3cret" })))
        .await
        .unwrap();
    assert_eq!(next_json(&mut bridge).await["type"], "auth_success");

    bridge.send(send(frame)).await.unwrap();
    for _ in 0..50 {
        if relay.state.snapshots.latest().await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        relay.state.snapshots.latest().await.unwrap().markup,
        "<p>x</p>"
    );

    let url = relay.http("/api/command");
    let pending = tokio::spawn(async move {
        reqwest::Client::new()
            .post(url)
            .json(&json!({ "type": "new_chat" }))
            .send()
            .await
            .unwrap()
            .json::<Value>()
            .await
            .unwrap()
    });

    let forwarded = next_json(&mut bridge).await;
    assert_eq!(forwarded["type"], "command");
    assert_eq!(forwarded["command"]["type"], "new_chat");
    bridge
        .send(send(json!({
            "type": "command_result",
            "id": forwarded["id"],
            "result": { "ok": true, "method": "script" }
        })))
        .await
        .unwrap();

    let body = pending.await.unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["method"], "script");
}
