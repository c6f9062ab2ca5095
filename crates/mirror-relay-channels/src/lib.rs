//! Chat bot adapter.
//!
//! A messaging platform implements [`Channel`]; the [`BotAdapter`] turns its
//! inbound messages into relay commands and pull queries, and announces the
//! host's reply once generation finishes.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use mirror_relay_core::types::{InboundMessage, SendResult};

pub mod bot;
pub mod recent;
pub mod relay_client;

#[cfg(feature = "telegram")]
pub mod telegram;

pub use bot::{BotAdapter, BotCommand};
pub use recent::RecentIds;
pub use relay_client::{RelayApi, RelayClient};

/// Receiver for inbound messages from a channel.
pub type InboundReceiver = mpsc::UnboundedReceiver<InboundMessage>;

/// Sender for inbound messages (used by channel implementations).
pub type InboundSender = mpsc::UnboundedSender<InboundMessage>;

/// A messaging platform the bot listens on and replies through.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Unique channel identifier (e.g., "telegram").
    fn id(&self) -> &str;

    /// Start receiving messages until `shutdown` fires.
    async fn start(&self, shutdown: CancellationToken) -> anyhow::Result<InboundReceiver>;

    /// Send a text message to a chat.
    async fn send(&self, chat_id: &str, text: &str) -> anyhow::Result<SendResult>;
}
