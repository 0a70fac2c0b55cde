//! Relay outbound adapter: delivers relay dispatches through the bot.

use async_trait::async_trait;
use ocbridge_core::relay::{OutboundError, RelayOutbound};
use teloxide::prelude::*;

use crate::format::chunk_message;

/// Sends relay text to Telegram chats, chunked to the message limit.
pub struct TelegramOutbound {
    bot: Bot,
}

impl TelegramOutbound {
    /// Wrap a bot handle.
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl RelayOutbound for TelegramOutbound {
    async fn deliver(&self, chat_id: i64, text: &str) -> Result<(), OutboundError> {
        for chunk in chunk_message(text) {
            self.bot
                .send_message(ChatId(chat_id), chunk)
                .await
                .map_err(|e| Box::new(e) as OutboundError)?;
        }
        Ok(())
    }
}
