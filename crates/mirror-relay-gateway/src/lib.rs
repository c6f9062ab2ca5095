//! Relay server.
//!
//! Holds the latest snapshot, tells every authenticated client when it
//! changes, serves pull endpoints, and relays commands to the host either
//! directly or through a cloud bridge.

pub mod auth;
pub mod bridge;
pub mod connection;
pub mod events;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod mirror;
pub mod rate_limit;
pub mod routes;
pub mod server;
pub mod state;

pub use bridge::{BridgeClient, BridgeHub, BridgeState};
pub use mirror::{SnapshotSource, spawn_capture_loop};
pub use server::{bind, build_router, serve};
pub use state::RelayState;
