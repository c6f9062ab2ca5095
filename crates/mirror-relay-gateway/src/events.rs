//! Fan-out of notifications to connected control-channel clients.

use tracing::{debug, error};

use mirror_relay_core::protocol::ServerMessage;

use crate::state::RelayState;

/// Send `message` to every authenticated connection. Returns how many
/// connections accepted it.
pub async fn broadcast(state: &RelayState, message: &ServerMessage) -> usize {
    let msg = match serde_json::to_string(message) {
        Ok(m) => m,
        Err(e) => {
            error!(%e, "Failed to serialize broadcast");
            return 0;
        }
    };

    let connections = state.connections.read().await;
    connections
        .values()
        .filter(|conn| conn.authenticated)
        .filter(|conn| conn.event_tx.send(msg.clone()).is_ok())
        .count()
}

/// Payload-less change notification; clients pull the snapshot themselves.
pub async fn broadcast_state_changed(state: &RelayState) {
    let sent = broadcast(state, &ServerMessage::StateChanged).await;
    debug!(sent, "Broadcast state_changed");

    #[cfg(feature = "metrics")]
    crate::metrics::record_broadcast(sent);
}
