//! Periodic capture loop feeding the relay's snapshot slot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use mirror_relay_core::snapshot::Snapshot;
use mirror_relay_host::HostSupervisor;

use crate::state::RelayState;

/// Anything that can produce a fresh snapshot on demand.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn capture(&self) -> Option<Snapshot>;
}

#[async_trait]
impl SnapshotSource for HostSupervisor {
    async fn capture(&self) -> Option<Snapshot> {
        HostSupervisor::capture(self).await
    }
}

/// Capture every `interval` and publish each result. Ticks that fall behind
/// a slow capture are skipped, so captures never overlap. Resolves to the
/// number of successful captures once `shutdown` fires.
pub fn spawn_capture_loop(
    state: Arc<RelayState>,
    source: Arc<dyn SnapshotSource>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut captured = 0u64;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let snapshot = tokio::select! {
                _ = shutdown.cancelled() => break,
                snapshot = source.capture() => snapshot,
            };
            let Some(snapshot) = snapshot else {
                continue;
            };
            captured += 1;
            let changed = state.publish(snapshot).await;
            #[cfg(feature = "metrics")]
            crate::metrics::record_capture(changed);
            if changed {
                debug!(captured, "Snapshot changed");
            }
        }
        info!(captured, "Capture loop stopped");
        captured
    })
}
