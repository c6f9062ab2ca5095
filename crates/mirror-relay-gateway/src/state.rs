//! Relay shared state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::debug;

use mirror_relay_core::backend::CommandTarget;
use mirror_relay_core::config::Config;
use mirror_relay_core::snapshot::{Snapshot, SnapshotSlot};

use crate::auth::AuthKeys;
use crate::bridge::BridgeHub;
use crate::events::broadcast_state_changed;
use crate::rate_limit::RateLimiter;

/// Shared relay state accessible from all connections and handlers.
pub struct RelayState {
    pub config: Arc<Config>,
    pub auth: AuthKeys,
    /// The single retained snapshot.
    pub snapshots: SnapshotSlot,
    /// Executes commands and pull queries: the local host, or a bridge.
    pub target: Arc<dyn CommandTarget>,
    /// Present on a public relay that accepts inbound bridges.
    pub bridge_hub: Option<Arc<BridgeHub>>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub connections: RwLock<HashMap<String, ConnectionState>>,
    /// Number of `state_changed` fan-outs so far.
    pub broadcasts: AtomicU64,
    published: broadcast::Sender<Arc<Snapshot>>,
}

/// Per-connection state.
pub struct ConnectionState {
    pub conn_id: String,
    pub event_tx: mpsc::UnboundedSender<String>,
    pub authenticated: bool,
}

impl RelayState {
    pub fn new(
        config: Arc<Config>,
        target: Arc<dyn CommandTarget>,
        bridge_hub: Option<Arc<BridgeHub>>,
    ) -> Self {
        let rate_limiter = config
            .relay
            .as_ref()
            .and_then(|r| r.rate_limit.as_ref())
            .map(|rl| Arc::new(RateLimiter::new(rl.max_connections_per_ip)));

        let (published, _) = broadcast::channel(16);

        Self {
            auth: AuthKeys::from_config(&config),
            config,
            snapshots: SnapshotSlot::new(),
            target,
            bridge_hub,
            rate_limiter,
            connections: RwLock::new(HashMap::new()),
            broadcasts: AtomicU64::new(0),
            published,
        }
    }

    /// Offer a freshly captured snapshot. When it differs from the retained
    /// one it becomes the latest, every authenticated client is notified and
    /// bridge clients forward it. Returns whether a broadcast happened.
    pub async fn publish(&self, snapshot: Snapshot) -> bool {
        let Some(latest) = self.snapshots.offer(snapshot).await else {
            return false;
        };
        self.broadcasts.fetch_add(1, Ordering::SeqCst);
        broadcast_state_changed(self).await;
        if self.published.send(latest.clone()).is_err() {
            debug!(fingerprint = %latest.fingerprint, "No snapshot subscribers");
        }
        true
    }

    /// Stream of snapshots as they become latest.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Snapshot>> {
        self.published.subscribe()
    }

    pub fn broadcast_count(&self) -> u64 {
        self.broadcasts.load(Ordering::SeqCst)
    }
}
