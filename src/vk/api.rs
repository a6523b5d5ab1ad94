//! VK HTTP client.
//!
//! One trait seam (`VkApi`) for everything the relay asks of VK, plus the
//! reqwest implementation. Splitting the long-poll notification from the
//! message fetch mirrors the upstream API: the two cursor spaces (`ts` for
//! poll position, `pts` for history position) go stale independently, so
//! their error channels stay separate too.

use crate::vk::types::{
    de_opt_i64_lenient, Credentials, HistoryBatch, LongPollResponse, MessageBatch, VkConversation,
    VkMessage, VkProfile,
};
use crate::vk::VkError;
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// VK API method base.
const API_BASE: &str = "https://api.vk.me/method";
/// VK API version sent with every method call.
const API_VERSION: &str = "5.199";
/// Cookie-to-token exchange endpoint.
const TOKEN_EXCHANGE_URL: &str = "https://login.vk.com/";
/// Server-side hold time of a long-poll request, seconds.
const LONG_POLL_WAIT: u64 = 10;
/// Per-request timeout. Must exceed `LONG_POLL_WAIT` with headroom so a
/// held-open poll is not cut short by the client.
const HTTP_TIMEOUT_SECS: u64 = 30;
/// Profile fields requested with extended history calls.
const PROFILE_FIELDS: &str = "id,first_name,last_name";

/// Everything the relay and the resend utility ask of VK.
#[async_trait]
pub trait VkApi: Send + Sync {
    /// Issue one `a_check` long-poll request against the session server.
    async fn long_poll(&self, server: &str, key: &str, ts: i64)
        -> Result<LongPollResponse, VkError>;

    /// Fetch the message records behind the current history cursor.
    ///
    /// An upstream error payload maps to `VkError::AuthExpired`: the
    /// token/cursor pair is stale and the caller should re-authenticate.
    async fn fetch_messages(&self, access_token: &str, pts: i64)
        -> Result<MessageBatch, VkError>;

    /// Fetch recent history for one peer (resend utility).
    async fn fetch_history(
        &self,
        access_token: &str,
        peer_id: i64,
        count: u32,
    ) -> Result<HistoryBatch, VkError>;

    /// Exchange the session cookie for a token and a fresh long-poll triple.
    async fn resolve_credentials(&self, cookie: &str) -> Result<Credentials, VkError>;

    /// Resolve a playable URL for a video attachment.
    async fn resolve_video_url(
        &self,
        access_token: &str,
        owner_id: i64,
        video_id: i64,
        access_key: Option<&str>,
    ) -> Result<String, VkError>;
}

/// Creates an HTTP client with an explicit request timeout.
///
/// This bounds the hang risk of any single call, including the long-poll
/// request itself.
#[must_use]
pub fn create_http_client() -> HttpClient {
    HttpClient::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()
        .unwrap_or_else(|_| HttpClient::new())
}

/// reqwest-backed `VkApi` implementation.
pub struct HttpVkApi {
    http: HttpClient,
}

impl HttpVkApi {
    /// Create a client with the standard timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            http: create_http_client(),
        }
    }

    /// POST a VK API method call and return the raw JSON payload.
    ///
    /// Only transport and parse failures are mapped here; callers decide
    /// what an `error` payload means for their channel.
    async fn call_method(&self, method: &str, form: &[(&str, String)]) -> Result<Value, VkError> {
        let response = self
            .http
            .post(format!("{API_BASE}/{method}"))
            .query(&[("v", API_VERSION)])
            .form(form)
            .send()
            .await
            .map_err(|e| VkError::Network(e.to_string()))?;

        let payload: Value = response
            .json()
            .await
            .map_err(|e| VkError::Json(e.to_string()))?;

        debug!(method, "VK method call completed");
        Ok(payload)
    }
}

impl Default for HttpVkApi {
    fn default() -> Self {
        Self::new()
    }
}

/// `messages.getLongPollHistory` response body.
#[derive(Debug, Default, Deserialize)]
struct LongPollHistoryPayload {
    #[serde(default)]
    messages: MessageItems,
    #[serde(default)]
    profiles: Vec<VkProfile>,
    #[serde(default)]
    conversations: Vec<VkConversation>,
    #[serde(default, deserialize_with = "de_opt_i64_lenient")]
    new_pts: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct MessageItems {
    #[serde(default)]
    items: Vec<VkMessage>,
}

/// `messages.getHistory` response body.
#[derive(Debug, Default, Deserialize)]
struct HistoryPayload {
    #[serde(default)]
    items: Vec<VkMessage>,
    #[serde(default)]
    profiles: Vec<VkProfile>,
    #[serde(default)]
    conversations: Vec<VkConversation>,
}

/// `messages.getLongPollServer` response body.
#[derive(Debug, Deserialize)]
struct LongPollServerPayload {
    server: String,
    key: String,
    #[serde(default, deserialize_with = "de_opt_i64_lenient")]
    ts: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64_lenient")]
    pts: Option<i64>,
}

/// `video.get` item: preference-ordered direct files, then the player URL.
#[derive(Debug, Default, Deserialize)]
struct VideoItem {
    #[serde(default)]
    files: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    player: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct VideoPayload {
    #[serde(default)]
    items: Vec<VideoItem>,
}

fn title_of(conversations: &[VkConversation]) -> String {
    conversations
        .first()
        .and_then(|conversation| conversation.chat_settings.as_ref())
        .map(|settings| settings.title.clone())
        .unwrap_or_default()
}

fn parse_response<T: serde::de::DeserializeOwned>(payload: &Value) -> Result<T, VkError> {
    let response = payload
        .get("response")
        .ok_or_else(|| VkError::Json(format!("payload has no response block: {payload}")))?;
    serde_json::from_value(response.clone()).map_err(|e| VkError::Json(e.to_string()))
}

#[async_trait]
impl VkApi for HttpVkApi {
    async fn long_poll(
        &self,
        server: &str,
        key: &str,
        ts: i64,
    ) -> Result<LongPollResponse, VkError> {
        let response = self
            .http
            .post(format!("https://{server}"))
            .form(&[
                ("act", "a_check".to_string()),
                ("key", key.to_string()),
                ("ts", ts.to_string()),
                ("wait", LONG_POLL_WAIT.to_string()),
            ])
            .send()
            .await
            .map_err(|e| VkError::Network(e.to_string()))?;

        response
            .json()
            .await
            .map_err(|e| VkError::Json(e.to_string()))
    }

    async fn fetch_messages(
        &self,
        access_token: &str,
        pts: i64,
    ) -> Result<MessageBatch, VkError> {
        let payload = self
            .call_method(
                "messages.getLongPollHistory",
                &[
                    ("access_token", access_token.to_string()),
                    ("pts", pts.to_string()),
                    ("extended", "1".to_string()),
                    ("fields", PROFILE_FIELDS.to_string()),
                ],
            )
            .await?;

        // The error payload is the soft "needs reauth" channel, not a
        // transport failure.
        if let Some(error) = payload.get("error") {
            return Err(VkError::AuthExpired(error.to_string()));
        }

        let body: LongPollHistoryPayload = parse_response(&payload)?;
        Ok(MessageBatch {
            title: title_of(&body.conversations),
            items: body.messages.items,
            profiles: body.profiles,
            new_pts: body.new_pts,
        })
    }

    async fn fetch_history(
        &self,
        access_token: &str,
        peer_id: i64,
        count: u32,
    ) -> Result<HistoryBatch, VkError> {
        let payload = self
            .call_method(
                "messages.getHistory",
                &[
                    ("access_token", access_token.to_string()),
                    ("peer_id", peer_id.to_string()),
                    ("count", count.to_string()),
                    ("extended", "1".to_string()),
                    ("fields", PROFILE_FIELDS.to_string()),
                ],
            )
            .await?;

        if let Some(error) = payload.get("error") {
            return Err(VkError::Api(error.to_string()));
        }

        let body: HistoryPayload = parse_response(&payload)?;
        Ok(HistoryBatch {
            title: title_of(&body.conversations),
            items: body.items,
            profiles: body.profiles,
        })
    }

    async fn resolve_credentials(&self, cookie: &str) -> Result<Credentials, VkError> {
        // Cookie -> web token exchange.
        let response = self
            .http
            .get(TOKEN_EXCHANGE_URL)
            .query(&[("act", "web_token")])
            .header(reqwest::header::COOKIE, cookie)
            .send()
            .await
            .map_err(|e| VkError::Network(e.to_string()))?;

        let payload: Value = response
            .json()
            .await
            .map_err(|e| VkError::Json(e.to_string()))?;

        let access_token = payload
            .pointer("/data/access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| VkError::Auth(format!("cookie was not accepted: {payload}")))?
            .to_string();

        // Token -> fresh long-poll triple (and the initial history cursor).
        let payload = self
            .call_method(
                "messages.getLongPollServer",
                &[
                    ("access_token", access_token.clone()),
                    ("need_pts", "1".to_string()),
                ],
            )
            .await?;

        if let Some(error) = payload.get("error") {
            return Err(VkError::Auth(error.to_string()));
        }

        let body: LongPollServerPayload = parse_response(&payload)?;
        Ok(Credentials {
            access_token,
            server: body.server,
            key: body.key,
            ts: body.ts.unwrap_or_default(),
            pts: body.pts,
        })
    }

    async fn resolve_video_url(
        &self,
        access_token: &str,
        owner_id: i64,
        video_id: i64,
        access_key: Option<&str>,
    ) -> Result<String, VkError> {
        let videos = match access_key {
            Some(key) => format!("{owner_id}_{video_id}_{key}"),
            None => format!("{owner_id}_{video_id}"),
        };

        let payload = self
            .call_method(
                "video.get",
                &[
                    ("access_token", access_token.to_string()),
                    ("videos", videos.clone()),
                ],
            )
            .await?;

        if let Some(error) = payload.get("error") {
            return Err(VkError::Api(error.to_string()));
        }

        let body: VideoPayload = parse_response(&payload)?;
        let item = body
            .items
            .first()
            .ok_or_else(|| VkError::Api(format!("video {videos} not found")))?;

        // Direct files by descending quality, then the embed player.
        if let Some(files) = &item.files {
            for quality in ["mp4_1080", "mp4_720", "mp4_480", "mp4_360", "mp4_240"] {
                if let Some(url) = files.get(quality).and_then(Value::as_str) {
                    return Ok(url.to_string());
                }
            }
        }
        item.player
            .clone()
            .ok_or_else(|| VkError::Api(format!("video {videos} has no playable url")))
    }
}
