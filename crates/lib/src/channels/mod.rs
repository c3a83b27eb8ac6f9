//! Chat platform (Telegram).
//!
//! [`ChatApi`] is the reply channel shared by the dispatcher and the offload worker.
//! Inbound webhook bodies are decoded into [`InboundEvent`]s.

mod inbound;
mod telegram;

pub use inbound::InboundEvent;
pub use telegram::{photo_file_name, TelegramClient, TelegramUpdate};

use async_trait::async_trait;

/// How text is rendered by the chat platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFormat {
    Plain,
    Html,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("chat api request failed: {0}")]
    Request(reqwest::Error),
    #[error("chat api error: {0}")]
    Api(String),
    #[error("chat api not configured: {0}")]
    NotConfigured(&'static str),
}

// Request URLs carry the bot token; never keep them in the error.
impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        ChatError::Request(e.without_url())
    }
}

/// Outbound calls to the chat platform.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Send a text message to a chat.
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        format: TextFormat,
    ) -> Result<(), ChatError>;

    /// Upload a photo to a chat.
    async fn send_photo(
        &self,
        chat_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<(), ChatError>;

    /// Acknowledge a callback query so the client stops its spinner.
    async fn answer_callback(&self, callback_id: &str) -> Result<(), ChatError>;
}
