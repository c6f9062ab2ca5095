//! Cloud bridge: a relay that can reach the host dials out to a public
//! relay, authenticates with a shared token, then forwards snapshots and
//! serves remote commands and queries.

mod client;
mod hub;

use std::fmt;

pub use client::BridgeClient;
pub use hub::BridgeHub;

/// Client-side link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Authenticating,
    Authenticated,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
        })
    }
}
