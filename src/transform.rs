//! Turns a raw VK message record into a platform-agnostic outbound message.
//!
//! `build` is a pure function of its inputs except for media resolution:
//! video attachments need a follow-up `video.get` call to obtain a playable
//! URL. Resolutions run concurrently and are merged back in original
//! attachment order.

use crate::vk::api::VkApi;
use crate::vk::types::{VkAttachment, VkMessage, VkPhotoSize, VkProfile};
use crate::vk::VkError;
use futures_util::future::join_all;
use tracing::debug;

/// Label used when the sender is not present in the profile set.
const UNKNOWN_SENDER: &str = "Unknown sender";

/// Closed set of media kinds the relay renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// A photo URL
    Photo,
    /// A playable video URL
    Video,
    /// A document or voice-message URL
    Document,
    /// A sticker image URL
    Sticker,
    /// Forwarded-messages marker; payload is the count
    Forward,
    /// Service action marker; payload is the action kind
    Service,
}

/// One ordered media entry of a normalized message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    /// What the payload is
    pub kind: MediaKind,
    /// URL or marker text, depending on the kind
    pub payload: String,
}

/// Platform-agnostic representation of one chat message, ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedMessage {
    /// Message text, possibly empty
    pub text: String,
    /// Sender display label, includes the chat title when one exists
    pub sender_label: String,
    /// Media in original attachment order; empty for text-only messages
    pub media: Vec<MediaItem>,
}

/// Build a normalized message from one raw record.
///
/// Tolerates an empty `chat_title` and a profile set that does not contain
/// the sender. Always produces a `media` sequence, possibly empty.
///
/// # Errors
///
/// Returns `VkError` when a media resolution call fails.
pub async fn build(
    api: &dyn VkApi,
    access_token: &str,
    record: &VkMessage,
    profiles: &[VkProfile],
    chat_title: &str,
) -> Result<NormalizedMessage, VkError> {
    let resolutions = join_all(
        record
            .attachments
            .iter()
            .map(|attachment| resolve_attachment(api, access_token, attachment)),
    )
    .await;

    let mut media = Vec::with_capacity(record.attachments.len());
    for resolved in resolutions {
        if let Some(item) = resolved? {
            media.push(item);
        }
    }

    if !record.fwd_messages.is_empty() {
        media.push(MediaItem {
            kind: MediaKind::Forward,
            payload: record.fwd_messages.len().to_string(),
        });
    }
    if let Some(action) = &record.action {
        media.push(MediaItem {
            kind: MediaKind::Service,
            payload: action.kind.clone(),
        });
    }

    Ok(NormalizedMessage {
        text: record.text.clone(),
        sender_label: sender_label(record.from_id, profiles, chat_title),
        media,
    })
}

fn sender_label(from_id: i64, profiles: &[VkProfile], chat_title: &str) -> String {
    let name = profiles
        .iter()
        .find(|profile| profile.id == from_id)
        .map(|profile| format!("{} {}", profile.first_name, profile.last_name))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| UNKNOWN_SENDER.to_string());

    if chat_title.is_empty() {
        name
    } else {
        format!("{name} ({chat_title})")
    }
}

async fn resolve_attachment(
    api: &dyn VkApi,
    access_token: &str,
    attachment: &VkAttachment,
) -> Result<Option<MediaItem>, VkError> {
    match attachment {
        VkAttachment::Photo { photo } => Ok(largest_size(&photo.sizes).map(|url| MediaItem {
            kind: MediaKind::Photo,
            payload: url,
        })),
        VkAttachment::Video { video } => {
            let url = api
                .resolve_video_url(
                    access_token,
                    video.owner_id,
                    video.id,
                    video.access_key.as_deref(),
                )
                .await?;
            Ok(Some(MediaItem {
                kind: MediaKind::Video,
                payload: url,
            }))
        }
        VkAttachment::Doc { doc } => Ok(doc.url.clone().map(|url| MediaItem {
            kind: MediaKind::Document,
            payload: url,
        })),
        VkAttachment::Sticker { sticker } => {
            Ok(largest_size(&sticker.images).map(|url| MediaItem {
                kind: MediaKind::Sticker,
                payload: url,
            }))
        }
        VkAttachment::AudioMessage { audio_message } => Ok(audio_message
            .link_mp3
            .clone()
            .or_else(|| audio_message.link_ogg.clone())
            .map(|url| MediaItem {
                kind: MediaKind::Document,
                payload: url,
            })),
        VkAttachment::Unknown => {
            debug!("skipping unsupported attachment kind");
            Ok(None)
        }
    }
}

fn largest_size(sizes: &[VkPhotoSize]) -> Option<String> {
    sizes
        .iter()
        .max_by_key(|size| size.width * size.height)
        .filter(|size| !size.url.is_empty())
        .map(|size| size.url.clone())
}
