use async_trait::async_trait;
use parley_common::{ChatId, Result};
use serde::{Deserialize, Serialize};

/// Lifecycle management for a messaging channel (connect, disconnect, status).
#[async_trait]
pub trait ChannelLifecycle: Send {
    /// Human-readable display name.
    fn display_name(&self) -> &str;

    /// Start the channel, connecting to the external service.
    async fn connect(&mut self) -> Result<()>;

    /// Gracefully disconnect from the external service.
    async fn disconnect(&mut self) -> Result<()>;

    /// Current connection status.
    fn status(&self) -> ChannelStatus;
}

/// Reference to a message the bot has sent, so it can be edited later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentMessage {
    pub chat_id: ChatId,
    pub message_id: i32,
}

/// Outbound side of a messaging platform.
///
/// Text is in the platform's lightweight HTML markup: callers escape any
/// untrusted content with [`crate::escape_html`] first.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send `text` to `chat_id`, optionally as a reply to an inbound message.
    async fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
        reply_to: Option<i32>,
    ) -> Result<SentMessage>;

    /// Replace the text of a previously sent message in place.
    async fn edit_text(&self, message: &SentMessage, text: &str) -> Result<()>;

    /// Show a "typing" indicator in the chat.
    async fn send_typing(&self, chat_id: ChatId) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelStatus {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}
