//! Telegram channel implementation using teloxide long polling.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use teloxide::Bot;
use teloxide::requests::Requester;
use teloxide::types::{ChatId, Update, UpdateKind};
use teloxide::update_listeners::{AsUpdateStream, Polling, UpdateListener};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mirror_relay_core::config::TelegramConfig;
use mirror_relay_core::types::{InboundMessage, SendResult, Sender};

use crate::{Channel, InboundReceiver};

/// Telegram rejects longer messages.
pub const MAX_MESSAGE_LEN: usize = 4096;

const POLL_ERROR_DELAY: Duration = Duration::from_secs(3);

pub struct TelegramChannel {
    bot: Bot,
    allowed_chats: Vec<String>,
    poll_timeout: Duration,
}

impl TelegramChannel {
    pub fn new(config: &TelegramConfig, bot_token: &str) -> anyhow::Result<Self> {
        let api_url = match config.api_url.parse() {
            Ok(url) => url,
            Err(_) => anyhow::bail!("invalid bot.telegram.api_url: {}", config.api_url),
        };
        Ok(Self {
            bot: Bot::new(bot_token).set_api_url(api_url),
            allowed_chats: config.allowed_chats.clone(),
            poll_timeout: Duration::from_secs(config.poll_timeout_secs),
        })
    }

    fn is_allowed(&self, chat_id: &str) -> bool {
        chat_allowed(&self.allowed_chats, chat_id)
    }
}

fn chat_allowed(allowed: &[String], chat_id: &str) -> bool {
    allowed.is_empty() || allowed.iter().any(|c| c == chat_id)
}

/// Map a text message (new or edited) to an [`InboundMessage`].
pub fn to_inbound(update: &Update) -> Option<InboundMessage> {
    let msg = match &update.kind {
        UpdateKind::Message(msg) | UpdateKind::EditedMessage(msg) => msg,
        _ => return None,
    };
    let text = msg.text()?;
    let chat_id = msg.chat.id.0;
    let from = update.from();

    Some(InboundMessage {
        channel: "telegram".into(),
        chat_id: chat_id.to_string(),
        message_id: format!("{chat_id}:{}", msg.id.0),
        sender: Sender {
            id: from.map(|u| u.id.0.to_string()).unwrap_or_default(),
            display_name: from.map(|u| u.first_name.clone()),
            username: from.and_then(|u| u.username.clone()),
        },
        text: Some(text.to_string()),
        timestamp: msg.date,
    })
}

/// Cut `text` to Telegram's limit on a char boundary.
pub fn truncate(text: &str) -> &str {
    match text.char_indices().nth(MAX_MESSAGE_LEN) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn id(&self) -> &str {
        "telegram"
    }

    async fn start(&self, shutdown: CancellationToken) -> anyhow::Result<InboundReceiver> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<InboundMessage>();

        let mut listener = Polling::builder(self.bot.clone())
            .timeout(self.poll_timeout)
            .build();
        let allowed = self.allowed_chats.clone();
        let poll_timeout = self.poll_timeout;

        tokio::spawn(async move {
            info!(timeout_secs = poll_timeout.as_secs(), "Telegram channel started");
            let stop = listener.stop_token();
            let updates = listener.as_stream();
            futures::pin_mut!(updates);

            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => {
                        stop.stop();
                        break;
                    }
                    next = updates.next() => next,
                };

                let update = match next {
                    Some(Ok(update)) => update,
                    Some(Err(e)) => {
                        warn!(%e, "Telegram poll error");
                        wait_or_stop(&shutdown).await;
                        continue;
                    }
                    None => break,
                };

                let Some(msg) = to_inbound(&update) else {
                    continue;
                };
                if !chat_allowed(&allowed, &msg.chat_id) {
                    warn!(chat_id = %msg.chat_id, "Ignoring message from unlisted chat");
                    continue;
                }
                if inbound_tx.send(msg).is_err() {
                    break;
                }
            }
            info!("Telegram channel stopped");
        });

        Ok(inbound_rx)
    }

    async fn send(&self, chat_id: &str, text: &str) -> anyhow::Result<SendResult> {
        if !self.is_allowed(chat_id) {
            anyhow::bail!("chat {chat_id} is not allowed");
        }
        let chat: i64 = chat_id
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid Telegram chat id: {chat_id}"))?;

        match self.bot.send_message(ChatId(chat), truncate(text)).await {
            Ok(sent) => Ok(SendResult {
                message_id: Some(sent.id.0.to_string()),
                success: true,
                error: None,
            }),
            Err(e) => {
                error!(%e, chat_id = %chat_id, "Telegram send failed");
                Ok(SendResult {
                    message_id: None,
                    success: false,
                    error: Some(e.to_string()),
                })
            }
        }
    }
}

async fn wait_or_stop(shutdown: &CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(POLL_ERROR_DELAY) => {}
    }
}
