//! Wire types for the VK long-poll stream and message history.
//!
//! VK is loose about numeric types (`ts` arrives as a number or a string
//! depending on the endpoint), so the deserializers here are deliberately
//! lenient, mirror-struct style.

use crate::vk::VkError;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Long-poll update tag for a new message.
const EVENT_NEW_MESSAGE: i64 = 4;

/// Accepts a JSON number or a numeric string.
pub(crate) fn de_opt_i64_lenient<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom("number is not a valid i64")),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected number or string, got {other}"
        ))),
    }
}

/// Response of an `a_check` long-poll request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LongPollResponse {
    /// Server-acknowledged event stream position
    #[serde(default, deserialize_with = "de_opt_i64_lenient")]
    pub ts: Option<i64>,
    /// Raw event tuples; at most the first is meaningful to the relay
    #[serde(default)]
    pub updates: Vec<Value>,
    /// Session failure indicator: 1 = window lost, 2 = session invalid
    #[serde(default)]
    pub failed: Option<u8>,
}

/// One long-poll event, decoded from its positional tuple form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    /// Tag 4: a new message appeared in `peer_id`
    NewMessage {
        /// Message ID within the conversation
        message_id: i64,
        /// Event flag bitmask
        flags: i64,
        /// Originating chat/peer ID
        peer_id: i64,
    },
    /// Any other tag; carried for logging, never acted on
    Ignored {
        /// The unrecognized event tag
        tag: i64,
    },
}

impl RawEvent {
    /// Decode one entry of the `updates` array.
    ///
    /// # Errors
    ///
    /// Returns `VkError::Json` when the entry is not an event tuple or a
    /// new-message tuple is missing its positional fields.
    pub fn parse(value: &Value) -> Result<Self, VkError> {
        let tuple = value
            .as_array()
            .ok_or_else(|| VkError::Json(format!("event is not a tuple: {value}")))?;
        let tag = tuple
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| VkError::Json(format!("event has no numeric tag: {value}")))?;

        if tag != EVENT_NEW_MESSAGE {
            return Ok(Self::Ignored { tag });
        }

        let field = |index: usize, name: &str| {
            tuple.get(index).and_then(Value::as_i64).ok_or_else(|| {
                VkError::Json(format!("new-message event is missing {name}: {value}"))
            })
        };

        Ok(Self::NewMessage {
            message_id: field(1, "message_id")?,
            flags: field(2, "flags")?,
            peer_id: field(3, "peer_id")?,
        })
    }
}

/// Fresh session material from the credential resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// API access token derived from the session cookie
    pub access_token: String,
    /// Long-poll server host
    pub server: String,
    /// Long-poll session key
    pub key: String,
    /// Long-poll stream position
    pub ts: i64,
    /// History stream position; only issued at bootstrap (`need_pts`)
    pub pts: Option<i64>,
}

/// Output of the message fetcher.
#[derive(Debug, Clone, Default)]
pub struct MessageBatch {
    /// Raw message records, oldest first
    pub items: Vec<VkMessage>,
    /// Sender profiles referenced by the records
    pub profiles: Vec<VkProfile>,
    /// Conversation title; empty when the peer is not a group chat
    pub title: String,
    /// Server-advanced history cursor, when reported
    pub new_pts: Option<i64>,
}

/// Output of a history fetch for the resend utility.
#[derive(Debug, Clone, Default)]
pub struct HistoryBatch {
    /// Raw message records, newest first (VK API order)
    pub items: Vec<VkMessage>,
    /// Sender profiles referenced by the records
    pub profiles: Vec<VkProfile>,
    /// Conversation title; empty when unavailable
    pub title: String,
}

/// A raw VK message record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VkMessage {
    /// Message ID
    #[serde(default)]
    pub id: i64,
    /// Sender ID (negative for communities)
    #[serde(default)]
    pub from_id: i64,
    /// Conversation the message belongs to
    #[serde(default)]
    pub peer_id: i64,
    /// Unix timestamp
    #[serde(default)]
    pub date: i64,
    /// Message text, possibly empty
    #[serde(default)]
    pub text: String,
    /// Attachments in original order
    #[serde(default)]
    pub attachments: Vec<VkAttachment>,
    /// Forwarded messages; only the count is relayed
    #[serde(default)]
    pub fwd_messages: Vec<Value>,
    /// Service action (chat title change etc.), if any
    #[serde(default)]
    pub action: Option<VkAction>,
}

/// A service action attached to a message.
#[derive(Debug, Clone, Deserialize)]
pub struct VkAction {
    /// Action kind, e.g. `chat_title_update`
    #[serde(rename = "type")]
    pub kind: String,
}

/// A sender profile from the `profiles` block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VkProfile {
    /// User ID
    pub id: i64,
    /// First name
    #[serde(default)]
    pub first_name: String,
    /// Last name
    #[serde(default)]
    pub last_name: String,
}

/// A conversation entry from the `conversations` block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VkConversation {
    /// Group-chat settings; absent for dialogs
    #[serde(default)]
    pub chat_settings: Option<VkChatSettings>,
}

/// Group-chat settings carrying the title.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VkChatSettings {
    /// Chat title
    #[serde(default)]
    pub title: String,
}

/// One message attachment, tagged by its `type` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum VkAttachment {
    /// A photo with its size ladder
    #[serde(rename = "photo")]
    Photo {
        /// Photo payload
        photo: VkPhoto,
    },
    /// A video; the playable URL requires a follow-up call
    #[serde(rename = "video")]
    Video {
        /// Video payload
        video: VkVideo,
    },
    /// A document with a direct URL
    #[serde(rename = "doc")]
    Doc {
        /// Document payload
        doc: VkDoc,
    },
    /// A sticker with its image ladder
    #[serde(rename = "sticker")]
    Sticker {
        /// Sticker payload
        sticker: VkSticker,
    },
    /// A voice message with direct audio links
    #[serde(rename = "audio_message")]
    AudioMessage {
        /// Voice message payload
        audio_message: VkAudioMessage,
    },
    /// Any attachment kind the relay does not render
    #[serde(other)]
    Unknown,
}

/// Photo payload: a ladder of sizes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VkPhoto {
    /// Available sizes, unordered
    #[serde(default)]
    pub sizes: Vec<VkPhotoSize>,
}

/// One entry of a photo/sticker size ladder.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VkPhotoSize {
    /// Direct image URL
    #[serde(default)]
    pub url: String,
    /// Width in pixels
    #[serde(default)]
    pub width: i64,
    /// Height in pixels
    #[serde(default)]
    pub height: i64,
}

/// Video payload: enough to resolve a playable URL via `video.get`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VkVideo {
    /// Video ID
    #[serde(default)]
    pub id: i64,
    /// Owner ID
    #[serde(default)]
    pub owner_id: i64,
    /// Access key required for restricted videos
    #[serde(default)]
    pub access_key: Option<String>,
}

/// Document payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VkDoc {
    /// Direct download URL
    #[serde(default)]
    pub url: Option<String>,
}

/// Sticker payload: a ladder of rendered images.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VkSticker {
    /// Available renditions, unordered
    #[serde(default)]
    pub images: Vec<VkPhotoSize>,
}

/// Voice message payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VkAudioMessage {
    /// MP3 rendition URL
    #[serde(default)]
    pub link_mp3: Option<String>,
    /// OGG rendition URL
    #[serde(default)]
    pub link_ogg: Option<String>,
}
