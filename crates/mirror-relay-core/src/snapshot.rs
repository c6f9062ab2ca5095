//! Mirrored surface snapshots and the change detector.
//!
//! A [`Snapshot`] carries its own fingerprint, so the retained value in a
//! [`SnapshotSlot`] can never pair a fingerprint with a different payload.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

/// Scroll position of the mirrored surface at capture time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrollMetrics {
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub client_height: f64,
    pub scroll_percent: f64,
}

/// Size counters reported by the capture script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotStats {
    pub nodes: u64,
    pub html_bytes: u64,
    pub css_bytes: u64,
    #[serde(default)]
    pub images_inlined: u64,
}

/// Computed colors of the surface so clients can render it faithfully.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SurfaceTheme {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_family: Option<String>,
}

/// Serialized visible state of the host's conversation surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub markup: String,
    pub style: String,
    pub scroll: ScrollMetrics,
    pub stats: SnapshotStats,
    #[serde(default)]
    pub theme: SurfaceTheme,
    pub fingerprint: String,
    pub captured_at: DateTime<Utc>,
}

impl Snapshot {
    /// Build a snapshot, fingerprinting the markup.
    pub fn new(
        markup: String,
        style: String,
        scroll: ScrollMetrics,
        stats: SnapshotStats,
        theme: SurfaceTheme,
    ) -> Self {
        let fingerprint = fingerprint(&markup);
        Self {
            markup,
            style,
            scroll,
            stats,
            theme,
            fingerprint,
            captured_at: Utc::now(),
        }
    }
}

/// Cheap order-sensitive rolling hash of the markup, rendered in base36.
pub fn fingerprint(markup: &str) -> String {
    let hash = markup
        .chars()
        .fold(0u32, |h, c| h.wrapping_mul(31).wrapping_add(c as u32));
    to_base36(hash)
}

fn to_base36(mut n: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".into();
    }
    let mut buf = Vec::with_capacity(7);
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8_lossy(&buf).into_owned()
}

/// True iff `candidate` differs from the last broadcast fingerprint.
pub fn should_broadcast(candidate: &Snapshot, last_fingerprint: Option<&str>) -> bool {
    last_fingerprint != Some(candidate.fingerprint.as_str())
}

/// Single-writer slot holding the latest snapshot.
///
/// The value is only ever replaced wholesale; readers get an `Arc` to an
/// immutable snapshot.
#[derive(Default)]
pub struct SnapshotSlot {
    latest: RwLock<Option<Arc<Snapshot>>>,
}

impl SnapshotSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a freshly captured snapshot. Returns the newly retained snapshot
    /// when it replaced the previous one, i.e. when a notification should go out.
    pub async fn offer(&self, snapshot: Snapshot) -> Option<Arc<Snapshot>> {
        let mut guard = self.latest.write().await;
        let last = guard.as_ref().map(|s| s.fingerprint.as_str());
        if !should_broadcast(&snapshot, last) {
            return None;
        }
        debug!(fingerprint = %snapshot.fingerprint, "Snapshot changed");
        let snapshot = Arc::new(snapshot);
        *guard = Some(snapshot.clone());
        Some(snapshot)
    }

    /// The retained snapshot, if any capture has completed.
    pub async fn latest(&self) -> Option<Arc<Snapshot>> {
        self.latest.read().await.clone()
    }

    pub async fn fingerprint(&self) -> Option<String> {
        self.latest
            .read()
            .await
            .as_ref()
            .map(|s| s.fingerprint.clone())
    }
}
