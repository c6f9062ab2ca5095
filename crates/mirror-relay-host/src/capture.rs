//! Snapshot capture.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace};

use mirror_relay_core::snapshot::{ScrollMetrics, Snapshot, SnapshotStats, SurfaceTheme};

use crate::link::ScriptHost;
use crate::scripts;

/// What the capture script hands back.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CapturePayload {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    html: Option<String>,
    #[serde(default)]
    css: String,
    #[serde(default)]
    scroll: CaptureScroll,
    #[serde(default)]
    stats: CaptureStats,
    #[serde(default)]
    theme: CaptureTheme,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CaptureScroll {
    scroll_top: f64,
    scroll_height: f64,
    client_height: f64,
    scroll_percent: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CaptureStats {
    nodes: u64,
    html_bytes: u64,
    css_bytes: u64,
    images_inlined: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CaptureTheme {
    background_color: Option<String>,
    color: Option<String>,
    font_family: Option<String>,
}

impl CapturePayload {
    fn into_snapshot(self) -> Option<Snapshot> {
        let markup = self.html.filter(|h| !h.is_empty())?;
        Some(Snapshot::new(
            markup,
            self.css,
            ScrollMetrics {
                scroll_top: self.scroll.scroll_top,
                scroll_height: self.scroll.scroll_height,
                client_height: self.scroll.client_height,
                scroll_percent: self.scroll.scroll_percent.clamp(0.0, 1.0),
            },
            SnapshotStats {
                nodes: self.stats.nodes,
                html_bytes: self.stats.html_bytes,
                css_bytes: self.stats.css_bytes,
                images_inlined: self.stats.images_inlined,
            },
            SurfaceTheme {
                background_color: self.theme.background_color,
                color: self.theme.color,
                font_family: self.theme.font_family,
            },
        ))
    }
}

fn parse_payload(value: Value) -> Option<CapturePayload> {
    if value.is_null() {
        return None;
    }
    serde_json::from_value(value).ok()
}

/// Capture the surface from the first context that has it.
///
/// Returns `None` when no context yields the surface; per-context script
/// errors are absorbed.
pub async fn capture(host: &dyn ScriptHost, surface: &str) -> Option<Snapshot> {
    let script = scripts::capture(surface);
    for ctx in host.contexts().await {
        let value = match host.evaluate(ctx.id, &script).await {
            Ok(v) => v,
            Err(e) => {
                trace!(context = ctx.id, error = %e, "Capture failed in context");
                continue;
            }
        };
        match parse_payload(value) {
            Some(CapturePayload { error: Some(err), .. }) => {
                trace!(context = ctx.id, error = %err, "Surface not in context");
            }
            Some(payload) => {
                if let Some(snapshot) = payload.into_snapshot() {
                    debug!(
                        context = ctx.id,
                        nodes = snapshot.stats.nodes,
                        fingerprint = %snapshot.fingerprint,
                        "Captured surface"
                    );
                    return Some(snapshot);
                }
            }
            None => trace!(context = ctx.id, "Unexpected capture payload"),
        }
    }
    None
}
