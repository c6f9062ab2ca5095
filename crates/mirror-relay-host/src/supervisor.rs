//! Keeps exactly one host link alive.
//!
//! Each session discovers the host, connects, publishes the link and waits
//! for it to close. The link is withdrawn before the next discovery starts,
//! so at most one link is ever live.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mirror_relay_core::backend::CommandTarget;
use mirror_relay_core::command::{AppState, ChatFeedback, Command, CommandResult};
use mirror_relay_core::config::HostConfig;
use mirror_relay_core::error::{RelayError, Result};
use mirror_relay_core::reconnect::supervise;
use mirror_relay_core::snapshot::Snapshot;
use mirror_relay_core::types::Issuer;

use crate::capture;
use crate::discovery;
use crate::dispatch::Dispatcher;
use crate::link::HostLink;

/// Produces a fresh link for each supervisor session.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<HostLink>;
}

/// Discovers the debug endpoint and opens a CDP session to it.
pub struct CdpConnector {
    config: HostConfig,
}

impl CdpConnector {
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for CdpConnector {
    async fn connect(&self) -> Result<HostLink> {
        let address = discovery::discover(&self.config).await?;
        HostLink::connect(&address.ws_url, &self.config).await
    }
}

pub struct HostSupervisor {
    connector: Arc<dyn Connector>,
    link: RwLock<Option<HostLink>>,
    dispatcher: Dispatcher,
    surface: String,
    interval: Duration,
    started: AtomicBool,
}

impl HostSupervisor {
    pub fn new(config: &HostConfig) -> Arc<Self> {
        Self::with_connector(config, Arc::new(CdpConnector::new(config.clone())))
    }

    pub fn with_connector(config: &HostConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new(Self {
            connector,
            link: RwLock::new(None),
            dispatcher: Dispatcher::new(config),
            surface: config.surface_selector.clone(),
            interval: Duration::from_millis(config.rediscover_interval_ms),
            started: AtomicBool::new(false),
        })
    }

    /// Start the reconnect loop. Calling this more than once is a no-op.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<u64>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return None;
        }
        let this = self.clone();
        Some(tokio::spawn(async move {
            let attempts = supervise("host", this.interval, shutdown.clone(), |attempt| {
                let this = this.clone();
                async move { this.session(attempt).await }
            })
            .await;
            if let Some(link) = this.link.write().await.take() {
                link.close();
            }
            attempts
        }))
    }

    async fn session(&self, attempt: u64) -> anyhow::Result<()> {
        let link = self.connector.connect().await?;
        *self.link.write().await = Some(link.clone());
        info!(attempt, "Host connected");

        link.closed().await;

        self.link.write().await.take();
        warn!(attempt, "Host link lost, rediscovering");
        Ok(())
    }

    /// The live link, if any.
    pub async fn current(&self) -> Option<HostLink> {
        self.link
            .read()
            .await
            .as_ref()
            .filter(|l| !l.is_closed())
            .cloned()
    }

    /// Capture the surface through the live link. `None` when disconnected
    /// or when no context has the surface.
    pub async fn capture(&self) -> Option<Snapshot> {
        let link = self.current().await?;
        capture::capture(&link, &self.surface).await
    }
}

#[async_trait]
impl CommandTarget for HostSupervisor {
    async fn dispatch(&self, command: Command, issuer: &Issuer) -> CommandResult {
        match self.current().await {
            Some(link) => self.dispatcher.dispatch(&link, &command, issuer).await,
            None => CommandResult::failure("host not connected"),
        }
    }

    async fn app_state(&self) -> Result<AppState> {
        let link = self.current().await.ok_or(RelayError::LinkLost)?;
        self.dispatcher.app_state(&link).await
    }

    async fn chat_feedback(&self) -> Result<ChatFeedback> {
        let link = self.current().await.ok_or(RelayError::LinkLost)?;
        self.dispatcher.chat_feedback(&link).await
    }

    async fn is_connected(&self) -> bool {
        self.current().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU64;

    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    use super::*;

    /// Hands out in-memory links and keeps the far ends so tests can kill
    /// them.
    #[derive(Default)]
    struct MemoryConnector {
        connects: AtomicU64,
        hosts: Mutex<Vec<(mpsc::UnboundedSender<String>, mpsc::UnboundedReceiver<String>)>>,
    }

    impl MemoryConnector {
        fn drop_host(&self) {
            self.hosts.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self) -> Result<HostLink> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let link = HostLink::from_transport(out_tx, in_rx, Duration::from_secs(1));
            self.hosts.lock().unwrap().push((in_tx, out_rx));
            Ok(link)
        }
    }

    struct Unreachable(AtomicU64);

    #[async_trait]
    impl Connector for Unreachable {
        async fn connect(&self) -> Result<HostLink> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(RelayError::DiscoveryFailed("nothing listening".into()))
        }
    }

    fn config() -> HostConfig {
        HostConfig {
            rediscover_interval_ms: 2000,
            ..HostConfig::default()
        }
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_link_loss() {
        let connector = Arc::new(MemoryConnector::default());
        let sup = HostSupervisor::with_connector(&config(), connector.clone());
        let shutdown = CancellationToken::new();
        let handle = sup.spawn(shutdown.clone()).unwrap();

        wait_until(|| connector.connects.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sup.is_connected().await);

        connector.drop_host();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!sup.is_connected().await);

        // Next discovery happens within one rediscover interval.
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert!(sup.is_connected().await);

        shutdown.cancel();
        assert_eq!(handle.await.unwrap(), 2);
        assert!(!sup.is_connected().await);
    }

    /// Serve the surface from the most recent link: announce one context
    /// and answer every capture with `html`. Aborting the task drops the
    /// host end, which closes the link.
    fn serve_surface(connector: &MemoryConnector, html: &'static str) -> JoinHandle<()> {
        let (frames, mut requests) = connector.hosts.lock().unwrap().pop().unwrap();
        tokio::spawn(async move {
            let _ = frames.send(
                json!({"method":"Runtime.executionContextCreated",
                       "params":{"context":{"id":5,"name":"","origin":""}}})
                .to_string(),
            );
            while let Some(req) = requests.recv().await {
                let req: Value = serde_json::from_str(&req).unwrap();
                let _ = frames.send(
                    json!({ "id": req["id"], "result": { "result": { "value": {
                        "html": html, "css": "",
                        "scroll": {}, "stats": { "nodes": 1 }, "theme": {}
                    }}}})
                    .to_string(),
                );
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_resumes_after_reconnect() {
        let connector = Arc::new(MemoryConnector::default());
        let sup = HostSupervisor::with_connector(&config(), connector.clone());
        let shutdown = CancellationToken::new();
        let handle = sup.spawn(shutdown.clone()).unwrap();

        wait_until(|| connector.connects.load(Ordering::SeqCst) == 1).await;
        let first = serve_surface(&connector, "<p>before</p>");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sup.capture().await.unwrap().markup, "<p>before</p>");

        first.abort();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sup.capture().await.is_none());

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        let second = serve_surface(&connector, "<p>after</p>");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sup.capture().await.unwrap().markup, "<p>after</p>");

        second.abort();
        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_is_idempotent() {
        let sup = HostSupervisor::with_connector(&config(), Arc::new(MemoryConnector::default()));
        let shutdown = CancellationToken::new();
        assert!(sup.spawn(shutdown.clone()).is_some());
        assert!(sup.spawn(shutdown.clone()).is_none());
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_host_retries_at_interval() {
        let connector = Arc::new(Unreachable(AtomicU64::new(0)));
        let sup = HostSupervisor::with_connector(&config(), connector.clone());
        let shutdown = CancellationToken::new();
        let handle = sup.spawn(shutdown.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(connector.0.load(Ordering::SeqCst), 3);
        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_fail_cleanly_while_disconnected() {
        let sup = HostSupervisor::with_connector(&config(), Arc::new(MemoryConnector::default()));
        let result = sup.dispatch(Command::Stop, &Issuer::Http).await;
        assert!(!result.ok);
        assert_eq!(result.error.as_deref(), Some("host not connected"));
        assert!(matches!(sup.app_state().await, Err(RelayError::LinkLost)));
        assert!(sup.capture().await.is_none());
    }

    #[tokio::test]
    async fn test_capture_through_live_link() {
        let connector = Arc::new(MemoryConnector::default());
        let sup = HostSupervisor::with_connector(&config(), connector.clone());
        let shutdown = CancellationToken::new();
        sup.spawn(shutdown.clone());
        while !sup.is_connected().await {
            tokio::task::yield_now().await;
        }

        let (frames, mut requests) = connector.hosts.lock().unwrap().pop().unwrap();
        frames
            .send(
                json!({"method":"Runtime.executionContextCreated",
                       "params":{"context":{"id":5,"name":"","origin":""}}})
                .to_string(),
            )
            .unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let responder = tokio::spawn(async move {
            let req: Value = serde_json::from_str(&requests.recv().await.unwrap()).unwrap();
            frames
                .send(
                    json!({ "id": req["id"], "result": { "result": { "value": {
                        "html": "<div>x</div>", "css": "",
                        "scroll": {}, "stats": { "nodes": 1 }, "theme": {}
                    }}}})
                    .to_string(),
                )
                .unwrap();
            (frames, requests)
        });

        let snap = sup.capture().await.unwrap();
        assert_eq!(snap.markup, "<div>x</div>");
        let _ends = responder.await.unwrap();
        shutdown.cancel();
    }
}
