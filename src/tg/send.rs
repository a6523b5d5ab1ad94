//! Outbound delivery to a Telegram chat or forum topic.
//!
//! The relay talks to this module through the `MessageSink` trait; the
//! teloxide-backed `TelegramSink` is the production implementation.

use crate::transform::{MediaKind, NormalizedMessage};
use anyhow::Result;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatId, InputFile, MessageId, ParseMode, ThreadId};

/// Fixed text sent when an inbound message could not be relayed.
pub const FAILURE_NOTICE: &str = "⚠️ Failed to relay a message from VK.";

/// Target chat and optional forum topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    /// Telegram chat ID
    pub chat_id: i64,
    /// Forum topic within the chat, if any
    pub topic_id: Option<i32>,
}

/// Delivery seam between the relay loop and the destination platform.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Deliver one normalized message.
    async fn deliver(&self, message: &NormalizedMessage, destination: &Destination) -> Result<()>;

    /// Tell the destination that a message was dropped.
    ///
    /// Failure here is terminal only for the current cycle, never for the
    /// process.
    async fn notify_failure(&self, destination: &Destination) -> Result<()>;
}

/// teloxide-backed sink.
pub struct TelegramSink {
    bot: Bot,
}

impl TelegramSink {
    /// Wrap a configured bot.
    #[must_use]
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

/// Render the HTML body: bold sender header, escaped text, and the
/// forward/service markers that have no native media representation.
#[must_use]
pub fn render_text(message: &NormalizedMessage) -> String {
    let mut out = format!("<b>{}</b>", html_escape::encode_text(&message.sender_label));
    if !message.text.is_empty() {
        out.push('\n');
        out.push_str(&html_escape::encode_text(&message.text));
    }
    for item in &message.media {
        match item.kind {
            MediaKind::Forward => {
                out.push_str("\n↪ forwarded messages: ");
                out.push_str(&html_escape::encode_text(&item.payload));
            }
            MediaKind::Service => {
                out.push_str("\n• ");
                out.push_str(&html_escape::encode_text(&item.payload));
            }
            _ => {}
        }
    }
    out
}

fn thread_id(destination: &Destination) -> Option<ThreadId> {
    destination.topic_id.map(|topic| ThreadId(MessageId(topic)))
}

#[async_trait]
impl MessageSink for TelegramSink {
    async fn deliver(&self, message: &NormalizedMessage, destination: &Destination) -> Result<()> {
        let chat = ChatId(destination.chat_id);

        let mut request = self
            .bot
            .send_message(chat, render_text(message))
            .parse_mode(ParseMode::Html);
        if let Some(thread) = thread_id(destination) {
            request = request.message_thread_id(thread);
        }
        request.await?;

        for item in &message.media {
            // Forward/service markers are already folded into the text body.
            if matches!(item.kind, MediaKind::Forward | MediaKind::Service) {
                continue;
            }
            let file = InputFile::url(item.payload.parse()?);
            match item.kind {
                MediaKind::Photo | MediaKind::Sticker => {
                    let mut request = self.bot.send_photo(chat, file);
                    if let Some(thread) = thread_id(destination) {
                        request = request.message_thread_id(thread);
                    }
                    request.await?;
                }
                MediaKind::Video => {
                    let mut request = self.bot.send_video(chat, file);
                    if let Some(thread) = thread_id(destination) {
                        request = request.message_thread_id(thread);
                    }
                    request.await?;
                }
                MediaKind::Document => {
                    let mut request = self.bot.send_document(chat, file);
                    if let Some(thread) = thread_id(destination) {
                        request = request.message_thread_id(thread);
                    }
                    request.await?;
                }
                MediaKind::Forward | MediaKind::Service => {}
            }
        }

        Ok(())
    }

    async fn notify_failure(&self, destination: &Destination) -> Result<()> {
        // Plain text: the notice must not be able to fail on formatting.
        let mut request = self
            .bot
            .send_message(ChatId(destination.chat_id), FAILURE_NOTICE);
        if let Some(thread) = thread_id(destination) {
            request = request.message_thread_id(thread);
        }
        request.await?;
        Ok(())
    }
}
