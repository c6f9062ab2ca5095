use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sender identity from a chat channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    pub display_name: Option<String>,
    pub username: Option<String>,
}

/// Inbound chat message from a bot channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub chat_id: String,
    /// Platform message id, used for de-duplication.
    pub message_id: String,
    pub sender: Sender,
    pub text: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Result of sending a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResult {
    pub message_id: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

/// Who issued a command, for logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "via", content = "id", rename_all = "snake_case")]
pub enum Issuer {
    Socket(String),
    Http,
    Bridge(String),
}

impl std::fmt::Display for Issuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Socket(id) => write!(f, "ws:{id}"),
            Self::Http => f.write_str("http"),
            Self::Bridge(id) => write!(f, "bridge:{id}"),
        }
    }
}
