//! Host-side scripts.
//!
//! Each file under `js/` is a single async function expression taking one
//! argument object. Parameters are passed as serialized JSON, never spliced
//! into script text.

use serde_json::{Value, json};

use mirror_relay_core::command::{ACTION_BUTTON_SELECTOR, Command};

use crate::resolve::Locator;

const CAPTURE: &str = include_str!("../js/capture.js");
const CLICK: &str = include_str!("../js/click.js");
const SCROLL: &str = include_str!("../js/scroll.js");
const SEND_MESSAGE: &str = include_str!("../js/send_message.js");
const SET_MODE: &str = include_str!("../js/set_mode.js");
const NEW_CHAT: &str = include_str!("../js/new_chat.js");
const SELECT_CHAT: &str = include_str!("../js/select_chat.js");
const STOP: &str = include_str!("../js/stop.js");
const CLOSE_HISTORY: &str = include_str!("../js/close_history.js");
const APP_STATE: &str = include_str!("../js/app_state.js");
const CHAT_FEEDBACK: &str = include_str!("../js/chat_feedback.js");

const KNOWN_MODES: &[&str] = &["planning", "fast", "write", "chat", "agent"];
const KNOWN_MODELS: &[&str] = &["gemini", "claude", "gpt", "sonnet", "opus", "o3", "o4"];

/// Longest tail of the latest reply returned by [`chat_feedback`].
pub const MAX_FEEDBACK_TEXT: usize = 4000;

fn invoke(function: &str, args: Value) -> String {
    format!("({})({})", function.trim(), args)
}

pub fn capture(surface: &str) -> String {
    invoke(CAPTURE, json!({ "surface": surface }))
}

pub fn click(locator: &Locator, surface: &str) -> String {
    invoke(CLICK, json!({ "surface": surface, "locator": locator }))
}

pub fn app_state(surface: &str) -> String {
    invoke(
        APP_STATE,
        json!({ "surface": surface, "modes": KNOWN_MODES, "models": KNOWN_MODELS }),
    )
}

pub fn chat_feedback(surface: &str) -> String {
    invoke(
        CHAT_FEEDBACK,
        json!({
            "surface": surface,
            "maxText": MAX_FEEDBACK_TEXT,
            "buttonSelector": ACTION_BUTTON_SELECTOR,
        }),
    )
}

/// Script for every command except clicks, which go through the locator
/// strategies instead.
pub fn command(command: &Command, surface: &str) -> Option<String> {
    let script = match command {
        Command::SendMessage { message } => invoke(
            SEND_MESSAGE,
            json!({ "surface": surface, "message": message }),
        ),
        Command::Scroll { data } => invoke(
            SCROLL,
            json!({ "surface": surface, "percent": data.scroll_percent }),
        ),
        Command::SetMode { mode } => invoke(
            SET_MODE,
            json!({
                "surface": surface,
                "kind": "mode",
                "value": mode,
                "toggle": "button, [role=\"button\"], [role=\"combobox\"]",
                "known": KNOWN_MODES,
            }),
        ),
        Command::SetModel { model } => invoke(
            SET_MODE,
            json!({
                "surface": surface,
                "kind": "model",
                "value": model,
                "toggle": "button, [role=\"button\"], [role=\"combobox\"]",
                "known": KNOWN_MODELS,
            }),
        ),
        Command::NewChat => invoke(NEW_CHAT, json!({ "surface": surface })),
        Command::SelectChat { title } => invoke(
            SELECT_CHAT,
            json!({ "surface": surface, "title": title }),
        ),
        Command::Stop => invoke(STOP, json!({ "surface": surface })),
        Command::CloseHistory => invoke(CLOSE_HISTORY, json!({ "surface": surface })),
        Command::Click { .. } => return None,
    };
    Some(script)
}
