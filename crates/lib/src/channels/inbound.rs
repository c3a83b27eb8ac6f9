//! Inbound event: one webhook delivery, decoded from the update body.

use crate::channels::telegram::TelegramUpdate;

/// A single webhook delivery. Only `update_id` is ever persisted (as a dedup marker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    /// Upstream-assigned id, unique per bot; the idempotency key.
    pub update_id: i64,
    /// Chat to reply to, when the update has one.
    pub chat_id: Option<String>,
    /// Message text, or callback data for callback updates. Empty when absent.
    pub raw_text: String,
    pub callback_id: Option<String>,
}

impl InboundEvent {
    pub fn dedup_key(&self) -> String {
        self.update_id.to_string()
    }
}

impl From<TelegramUpdate> for InboundEvent {
    fn from(update: TelegramUpdate) -> Self {
        let (message_chat, message_text) = match update.message {
            Some(m) => (m.chat.map(|c| c.id.to_string()), m.text),
            None => (None, None),
        };
        let (callback_chat, callback_data, callback_id) = match update.callback_query {
            Some(q) => (
                q.message.and_then(|m| m.chat).map(|c| c.id.to_string()),
                q.data,
                Some(q.id),
            ),
            None => (None, None, None),
        };
        Self {
            update_id: update.update_id,
            chat_id: message_chat.or(callback_chat),
            raw_text: message_text.or(callback_data).unwrap_or_default(),
            callback_id,
        }
    }
}
