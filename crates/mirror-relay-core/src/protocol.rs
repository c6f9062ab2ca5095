//! Wire protocol for the client control channel and the relay-to-relay bridge.
//!
//! Everything is JSON-over-WebSocket, discriminated by a `type` field.

use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandResult};
use crate::snapshot::Snapshot;

/// Protocol version advertised in the hello frame.
pub const PROTOCOL_VERSION: u32 = 1;

/// Server → client messages on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Hello {
        protocol: u32,
        version: String,
        conn_id: String,
    },
    /// Lightweight notification; clients pull the snapshot separately.
    StateChanged,
    CommandResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(flatten)]
        result: CommandResult,
    },
    Error {
        error: String,
    },
}

/// Pull queries a remote relay can forward over a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostQuery {
    AppState,
    ChatFeedback,
}

/// Frames exchanged between a bridging relay and the public relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeFrame {
    AuthBridge {
        token: String,
    },
    AuthSuccess,
    AuthError {
        message: String,
    },
    Snapshot {
        snapshot: Snapshot,
    },
    Command {
        id: String,
        command: Command,
    },
    CommandResult {
        id: String,
        result: CommandResult,
    },
    Query {
        id: String,
        query: HostQuery,
    },
    QueryResult {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Ping,
    Pong,
}
