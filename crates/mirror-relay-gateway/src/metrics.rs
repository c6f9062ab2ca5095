//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder. Fails if another recorder is installed.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(PrometheusBuilder::new().install_recorder()?)
}

pub fn record_ws_connect() {
    metrics::gauge!("relay_ws_connections_active").increment(1.0);
}

pub fn record_ws_disconnect() {
    metrics::gauge!("relay_ws_connections_active").decrement(1.0);
}

/// One `state_changed` fan-out reaching `clients` connections.
pub fn record_broadcast(clients: usize) {
    metrics::counter!("relay_broadcasts_total").increment(1);
    metrics::histogram!("relay_broadcast_clients").record(clients as f64);
}

pub fn record_capture(changed: bool) {
    let labels = [("changed", changed.to_string())];
    metrics::counter!("relay_captures_total", &labels).increment(1);
}

pub fn record_command(kind: &str, ok: bool, duration_secs: f64) {
    let labels = [("kind", kind.to_string()), ("ok", ok.to_string())];
    metrics::counter!("relay_commands_total", &labels).increment(1);
    metrics::histogram!("relay_command_duration_seconds", &labels).record(duration_secs);
}
