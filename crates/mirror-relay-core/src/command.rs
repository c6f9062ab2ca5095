//! Typed commands relayed from clients into the host, and their results.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A command issued by a client. Ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    SendMessage {
        message: String,
    },
    #[serde(rename = "remote_click")]
    Click {
        data: ClickRequest,
    },
    #[serde(rename = "remote_scroll")]
    Scroll {
        data: ScrollRequest,
    },
    SetMode {
        mode: String,
    },
    SetModel {
        model: String,
    },
    NewChat,
    SelectChat {
        title: String,
    },
    Stop,
    CloseHistory,
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::Click { .. } => "click",
            Self::Scroll { .. } => "scroll",
            Self::SetMode { .. } => "set_mode",
            Self::SetModel { .. } => "set_model",
            Self::NewChat => "new_chat",
            Self::SelectChat { .. } => "select_chat",
            Self::Stop => "stop",
            Self::CloseHistory => "close_history",
        }
    }
}

/// Where a client clicked on its mirrored copy of the surface.
///
/// Every field is optional; the dispatcher tries whichever locators the
/// request makes possible.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClickRequest {
    /// Stable identifier attached to the element at capture time.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "relayId")]
    pub relay_id: Option<String>,
    /// CSS selector of candidate elements (tag name, class list).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Occurrence index among elements sharing the same label.
    #[serde(default)]
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "textContent")]
    pub text_content: Option<String>,
    /// Horizontal click position as a fraction of the visible mirror width.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "xRatio")]
    pub x_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "yRatio")]
    pub y_ratio: Option<f64>,
    /// Scroll position of the mirror when the click happened, so the host
    /// can line up the same viewport before hit-testing.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "scrollPercent")]
    pub scroll_percent: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrollRequest {
    #[serde(alias = "scrollPercent")]
    pub scroll_percent: f64,
}

/// Client → server envelope: a command plus an optional correlation id that
/// is echoed back in the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub command: Command,
}

/// Structured per-command outcome reported to the issuing client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    pub fn success(method: impl Into<String>) -> Self {
        Self {
            ok: true,
            method: Some(method.into()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            method: None,
            error: Some(error.into()),
        }
    }
}

/// Lifecycle of a single command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Issued,
    Dispatched,
    Succeeded,
    Failed,
    TimedOut,
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Issued => "issued",
            Self::Dispatched => "dispatched",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Current mode and model shown by the host, best-effort.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// A button the host currently offers in the conversation (e.g. "Accept").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionButton {
    pub index: usize,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "relayId")]
    pub relay_id: Option<String>,
    /// Position among every [`ACTION_BUTTON_SELECTOR`] match on the surface
    /// with the same label. This is the index a text click needs.
    #[serde(default)]
    pub occurrence: usize,
}

/// Elements reported as action buttons and searched by text clicks on them.
pub const ACTION_BUTTON_SELECTOR: &str = "button, [role=\"button\"]";

/// Conversation status used by the bot adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatFeedback {
    #[serde(alias = "isGenerating")]
    pub is_generating: bool,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "recentText")]
    pub recent_text: Option<String>,
    #[serde(default)]
    pub buttons: Vec<ActionButton>,
}
