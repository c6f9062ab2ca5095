use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("No reachable host debug endpoint: {0}")]
    DiscoveryFailed(String),

    #[error("Failed to connect to host: {0}")]
    Connect(String),

    #[error("Host call '{method}' timed out after {timeout_ms}ms")]
    CallTimeout { method: String, timeout_ms: u64 },

    #[error("Host link lost")]
    LinkLost,

    #[error("Host returned an error: {0}")]
    Remote(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("No context accepted the command: {0}")]
    CommandResolutionFailed(String),

    #[error("No snapshot captured yet")]
    NotReady,

    #[error("Bridge error: {0}")]
    Bridge(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    /// Stable machine-readable code used in HTTP and bridge error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::DiscoveryFailed(_) => "discovery_failed",
            Self::Connect(_) => "connect_error",
            Self::CallTimeout { .. } => "call_timeout",
            Self::LinkLost => "link_lost",
            Self::Remote(_) => "remote_error",
            Self::Unauthorized => "unauthorized",
            Self::CommandResolutionFailed(_) => "command_resolution_failed",
            Self::NotReady => "not_ready",
            Self::Bridge(_) => "bridge_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Other(_) => "internal_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
