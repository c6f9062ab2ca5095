//! Chat commands → relay calls, and reply announcements.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mirror_relay_core::command::{
    ACTION_BUTTON_SELECTOR, ChatFeedback, ClickRequest, Command, CommandResult,
};
use mirror_relay_core::reconnect::supervise;
use mirror_relay_core::types::InboundMessage;

use crate::recent::RecentIds;
use crate::relay_client::RelayApi;
use crate::Channel;

const HELP: &str = "/status - host, mode and model\n\
/stop - stop generating\n\
/new - start a new chat\n\
/mode <name> - switch mode\n\
/model <name> - switch model\n\
/buttons - list buttons on the latest reply\n\
/click <n> - press button n\n\
Anything else is sent as a message.";

/// A parsed chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Status,
    Stop,
    NewChat,
    Mode(String),
    Model(String),
    Buttons,
    Click(usize),
    Send(String),
    Help,
    Usage(&'static str),
    Unknown(String),
}

impl BotCommand {
    /// `None` for blank text.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let Some(rest) = text.strip_prefix('/') else {
            return Some(Self::Send(text.to_string()));
        };

        let (head, arg) = match rest.split_once(char::is_whitespace) {
            Some((head, arg)) => (head, arg.trim()),
            None => (rest, ""),
        };
        // Group chats address bots as `/cmd@BotName`.
        let head = head.split('@').next().unwrap_or(head).to_ascii_lowercase();

        Some(match head.as_str() {
            "status" => Self::Status,
            "stop" => Self::Stop,
            "new" => Self::NewChat,
            "buttons" => Self::Buttons,
            "help" | "start" => Self::Help,
            "mode" if arg.is_empty() => Self::Usage("Usage: /mode <name>"),
            "mode" => Self::Mode(arg.to_string()),
            "model" if arg.is_empty() => Self::Usage("Usage: /model <name>"),
            "model" => Self::Model(arg.to_string()),
            "click" => match arg.parse() {
                Ok(n) => Self::Click(n),
                Err(_) => Self::Usage("Usage: /click <n> (see /buttons)"),
            },
            other => Self::Unknown(other.to_string()),
        })
    }
}

/// Bridges one chat channel to one relay.
pub struct BotAdapter {
    relay: Arc<dyn RelayApi>,
    channel: Arc<dyn Channel>,
    recent: Mutex<RecentIds>,
    /// Chats that have talked to the bot; they receive reply announcements.
    subscribers: Mutex<BTreeSet<String>>,
    generating: AtomicBool,
}

fn describe(result: anyhow::Result<CommandResult>, done: &str) -> String {
    match result {
        Ok(r) if r.ok => done.to_string(),
        Ok(r) => format!(
            "Failed: {}",
            r.error.unwrap_or_else(|| "unknown error".into())
        ),
        Err(e) => format!("Relay error: {e}"),
    }
}

/// Command that presses button `n` of the latest reply. The occurrence
/// reported with the button disambiguates others sharing its label.
fn click_for(feedback: &ChatFeedback, n: usize) -> Option<Command> {
    let button = feedback.buttons.iter().find(|b| b.index == n)?;
    Some(Command::Click {
        data: ClickRequest {
            relay_id: button.relay_id.clone(),
            selector: Some(ACTION_BUTTON_SELECTOR.to_string()),
            index: button.occurrence,
            text_content: Some(button.label.clone()),
            ..Default::default()
        },
    })
}

impl BotAdapter {
    pub fn new(relay: Arc<dyn RelayApi>, channel: Arc<dyn Channel>, recent_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            relay,
            channel,
            recent: Mutex::new(RecentIds::new(recent_capacity)),
            subscribers: Mutex::new(BTreeSet::new()),
            generating: AtomicBool::new(false),
        })
    }

    fn subscribers(&self) -> Vec<String> {
        self.subscribers
            .lock()
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Handle one inbound message. Returns the reply, or `None` for
    /// duplicates and blank text.
    pub async fn handle(&self, msg: &InboundMessage) -> Option<String> {
        let fresh = self
            .recent
            .lock()
            .map(|mut r| r.insert(&msg.message_id))
            .unwrap_or(true);
        if !fresh {
            debug!(message_id = %msg.message_id, "Duplicate message skipped");
            return None;
        }

        let command = BotCommand::parse(msg.text.as_deref().unwrap_or(""))?;
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.insert(msg.chat_id.clone());
        }
        info!(chat_id = %msg.chat_id, ?command, "Bot command");
        Some(self.execute(command).await)
    }

    pub async fn execute(&self, command: BotCommand) -> String {
        match command {
            BotCommand::Status => self.status().await,
            BotCommand::Stop => describe(self.relay.command(Command::Stop).await, "Stopped."),
            BotCommand::NewChat => {
                describe(self.relay.command(Command::NewChat).await, "New chat started.")
            }
            BotCommand::Mode(mode) => {
                let done = format!("Mode set to {mode}.");
                describe(self.relay.command(Command::SetMode { mode }).await, &done)
            }
            BotCommand::Model(model) => {
                let done = format!("Model set to {model}.");
                describe(self.relay.command(Command::SetModel { model }).await, &done)
            }
            BotCommand::Buttons => match self.relay.chat_feedback().await {
                Ok(feedback) if feedback.buttons.is_empty() => "No buttons right now.".into(),
                Ok(feedback) => feedback
                    .buttons
                    .iter()
                    .map(|b| format!("{}. {}", b.index, b.label))
                    .collect::<Vec<_>>()
                    .join("\n"),
                Err(e) => format!("Relay error: {e}"),
            },
            BotCommand::Click(n) => match self.relay.chat_feedback().await {
                Ok(feedback) => match click_for(&feedback, n) {
                    Some(click) => describe(self.relay.command(click).await, "Clicked."),
                    None => format!("No button {n}. Try /buttons."),
                },
                Err(e) => format!("Relay error: {e}"),
            },
            BotCommand::Send(message) => {
                let result = self.relay.command(Command::SendMessage { message }).await;
                if matches!(&result, Ok(r) if r.ok) {
                    // The reply is announced when this generation finishes.
                    self.generating.store(true, Ordering::SeqCst);
                }
                describe(result, "Sent.")
            }
            BotCommand::Help => HELP.into(),
            BotCommand::Usage(usage) => usage.into(),
            BotCommand::Unknown(cmd) => format!("Unknown command /{cmd}. Try /help."),
        }
    }

    async fn status(&self) -> String {
        let health = match self.relay.health().await {
            Ok(h) => h,
            Err(e) => return format!("Relay unreachable: {e}"),
        };
        let connected = health
            .get("host_connected")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let mut lines = vec![format!(
            "Host: {}",
            if connected { "connected" } else { "disconnected" }
        )];
        if let Ok(app) = self.relay.app_state().await {
            lines.push(format!("Mode: {}", app.mode.as_deref().unwrap_or("unknown")));
            lines.push(format!("Model: {}", app.model.as_deref().unwrap_or("unknown")));
        }
        if let Ok(feedback) = self.relay.chat_feedback().await {
            lines.push(format!(
                "Generating: {}",
                if feedback.is_generating { "yes" } else { "no" }
            ));
        }
        lines.join("\n")
    }

    /// Pull feedback after a change. Returns the reply to announce when
    /// generation just finished.
    pub async fn on_state_changed(&self) -> Option<String> {
        let feedback = match self.relay.chat_feedback().await {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "Feedback unavailable");
                return None;
            }
        };
        let was = self.generating.swap(feedback.is_generating, Ordering::SeqCst);
        if was && !feedback.is_generating {
            return feedback.recent_text.filter(|t| !t.trim().is_empty());
        }
        None
    }

    async fn reply(&self, chat_id: &str, text: &str) {
        match self.channel.send(chat_id, text).await {
            Ok(r) if r.success => {}
            Ok(r) => warn!(chat_id, error = ?r.error, "Reply not delivered"),
            Err(e) => warn!(chat_id, error = %e, "Reply failed"),
        }
    }

    async fn announce(&self, text: &str) {
        for chat_id in self.subscribers() {
            self.reply(&chat_id, text).await;
        }
    }

    /// Serve the channel until `shutdown`. The control-channel watcher
    /// reconnects after `reconnect_delay`.
    pub async fn run(
        self: Arc<Self>,
        reconnect_delay: Duration,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut inbound = self.channel.start(shutdown.clone()).await?;
        info!(channel = self.channel.id(), "Bot adapter running");

        let (changes_tx, mut changes_rx) = mpsc::unbounded_channel::<()>();
        let relay = self.relay.clone();
        let watcher = tokio::spawn(supervise(
            "bot-watch",
            reconnect_delay,
            shutdown.clone(),
            move |_| {
                let relay = relay.clone();
                let changes = changes_tx.clone();
                async move { relay.watch(&changes).await }
            },
        ));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = inbound.recv() => {
                    let Some(msg) = msg else {
                        warn!("Channel closed");
                        break;
                    };
                    if let Some(reply) = self.handle(&msg).await {
                        self.reply(&msg.chat_id, &reply).await;
                    }
                }
                Some(()) = changes_rx.recv() => {
                    if let Some(text) = self.on_state_changed().await {
                        self.announce(&text).await;
                    }
                }
            }
        }

        watcher.abort();
        info!("Bot adapter stopped");
        Ok(())
    }
}
