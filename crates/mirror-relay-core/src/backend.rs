//! The seam between the relay server and whatever executes commands.
//!
//! A relay next to the host uses the host supervisor; a public relay with no
//! host of its own uses the bridge hub, which forwards over the bridge.

use async_trait::async_trait;

use crate::command::{AppState, ChatFeedback, Command, CommandResult};
use crate::error::Result;
use crate::types::Issuer;

#[async_trait]
pub trait CommandTarget: Send + Sync + 'static {
    /// Execute a command at most once. Failures are reported in the result,
    /// never thrown.
    async fn dispatch(&self, command: Command, issuer: &Issuer) -> CommandResult;

    async fn app_state(&self) -> Result<AppState>;

    async fn chat_feedback(&self) -> Result<ChatFeedback>;

    /// Whether commands can currently reach the host.
    async fn is_connected(&self) -> bool;
}
