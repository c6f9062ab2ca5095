//! Debug endpoint discovery.
//!
//! Probes each configured port's `/json/list` and picks the target that
//! hosts the conversation surface, preferring a main surface on any port
//! over a fallback one.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use mirror_relay_core::config::HostConfig;
use mirror_relay_core::error::{RelayError, Result};

/// One entry of a debug endpoint's `/json/list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugTarget {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub web_socket_debugger_url: Option<String>,
}

impl DebugTarget {
    fn matches_any(&self, patterns: &[String]) -> bool {
        patterns
            .iter()
            .filter(|p| !p.is_empty())
            .any(|p| self.url.contains(p.as_str()) || self.title.contains(p.as_str()))
    }
}

/// A selected surface and the WebSocket URL to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddress {
    pub port: u16,
    pub target_id: String,
    pub title: String,
    pub ws_url: String,
    /// False when only a fallback pattern matched.
    pub main: bool,
}

/// How a target list matched the configured patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
    Main(usize),
    Fallback(usize),
}

/// Pick a target from one port's list. Targets without a debugger URL are
/// already attached elsewhere and are skipped.
pub fn select_target(
    targets: &[DebugTarget],
    main_patterns: &[String],
    fallback_patterns: &[String],
) -> Option<Match> {
    let usable = |t: &DebugTarget| t.web_socket_debugger_url.is_some();

    if let Some(i) = targets
        .iter()
        .position(|t| usable(t) && t.matches_any(main_patterns))
    {
        return Some(Match::Main(i));
    }
    targets
        .iter()
        .position(|t| usable(t) && t.matches_any(fallback_patterns))
        .map(Match::Fallback)
}

async fn list_targets(
    client: &reqwest::Client,
    address: &str,
    port: u16,
) -> std::result::Result<Vec<DebugTarget>, reqwest::Error> {
    client
        .get(format!("http://{address}:{port}/json/list"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await
}

fn to_address(port: u16, target: &DebugTarget, main: bool) -> Option<HostAddress> {
    Some(HostAddress {
        port,
        target_id: target.id.clone(),
        title: target.title.clone(),
        ws_url: target.web_socket_debugger_url.clone()?,
        main,
    })
}

/// Probe every configured port and return the best surface found.
///
/// A main surface is returned as soon as one is seen; otherwise the first
/// fallback surface wins. Fails with [`RelayError::DiscoveryFailed`] when no
/// port answers with a recognizable surface.
pub async fn discover(config: &HostConfig) -> Result<HostAddress> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(config.probe_timeout_ms))
        .build()
        .map_err(|e| RelayError::DiscoveryFailed(e.to_string()))?;

    let mut fallback: Option<HostAddress> = None;
    let mut unreachable = 0usize;

    for &port in &config.ports {
        let targets = match list_targets(&client, &config.address, port).await {
            Ok(t) => t,
            Err(e) => {
                debug!(port, error = %e, "Debug port not answering");
                unreachable += 1;
                continue;
            }
        };

        match select_target(&targets, &config.main_patterns, &config.fallback_patterns) {
            Some(Match::Main(i)) => {
                if let Some(addr) = to_address(port, &targets[i], true) {
                    info!(port, title = %addr.title, "Found main surface");
                    return Ok(addr);
                }
            }
            Some(Match::Fallback(i)) if fallback.is_none() => {
                fallback = to_address(port, &targets[i], false);
            }
            _ => debug!(port, targets = targets.len(), "No matching surface on port"),
        }
    }

    match fallback {
        Some(addr) => {
            info!(port = addr.port, title = %addr.title, "Using fallback surface");
            Ok(addr)
        }
        None => Err(RelayError::DiscoveryFailed(format!(
            "{} of {} ports unreachable, no matching surface on {}:{:?}",
            unreachable,
            config.ports.len(),
            config.address,
            config.ports
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(title: &str, url: &str, ws: bool) -> DebugTarget {
        DebugTarget {
            id: title.to_lowercase(),
            kind: "page".into(),
            title: title.into(),
            url: url.into(),
            web_socket_debugger_url: ws.then(|| format!("ws://127.0.0.1/devtools/page/{title}")),
        }
    }

    fn patterns(p: &[&str]) -> Vec<String> {
        p.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parses_json_list() {
        let raw = r#"[{
            "description": "",
            "id": "ABC",
            "title": "Editor",
            "type": "page",
            "url": "vscode-file://vscode-app/workbench.html",
            "webSocketDebuggerUrl": "ws://127.0.0.1:9000/devtools/page/ABC"
        }]"#;
        let targets: Vec<DebugTarget> = serde_json::from_str(raw).unwrap();
        assert_eq!(targets[0].kind, "page");
        assert_eq!(
            targets[0].web_socket_debugger_url.as_deref(),
            Some("ws://127.0.0.1:9000/devtools/page/ABC")
        );
    }

    #[test]
    fn test_prefers_main_over_fallback() {
        let targets = vec![
            target("Launchpad", "app://launchpad", true),
            target("Editor", "app://workbench.html", true),
        ];
        let m = select_target(&targets, &patterns(&["workbench.html"]), &patterns(&["Launchpad"]));
        assert_eq!(m, Some(Match::Main(1)));
    }

    #[test]
    fn test_fallback_when_no_main() {
        let targets = vec![
            target("Other", "about:blank", true),
            target("Launchpad", "app://launchpad", true),
        ];
        let m = select_target(&targets, &patterns(&["workbench.html"]), &patterns(&["Launchpad"]));
        assert_eq!(m, Some(Match::Fallback(1)));
    }

    #[test]
    fn test_skips_attached_targets() {
        let targets = vec![target("Editor", "app://workbench.html", false)];
        assert_eq!(select_target(&targets, &patterns(&["workbench.html"]), &[]), None);
    }

    #[test]
    fn test_empty_pattern_matches_nothing() {
        let targets = vec![target("Editor", "app://workbench.html", true)];
        assert_eq!(select_target(&targets, &patterns(&[""]), &[]), None);
    }

    #[tokio::test]
    async fn test_discover_fails_when_nothing_listens() {
        let config = HostConfig {
            ports: vec![1],
            probe_timeout_ms: 200,
            ..HostConfig::default()
        };
        let err = discover(&config).await.unwrap_err();
        assert!(matches!(err, RelayError::DiscoveryFailed(_)));
    }
}
