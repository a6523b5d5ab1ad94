//! Configuration and settings management
//!
//! Loads settings from environment variables and `.env` files.

use crate::tg::send::Destination;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashSet;

/// History depth used by the resend utility when none is configured.
const DEFAULT_HISTORY_DEPTH: u32 = 50;

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// VK web session cookie used for token exchange
    pub auth_cookie: String,

    /// Telegram Bot API token
    pub bot_token: String,

    /// Destination Telegram chat ID
    #[serde(default)]
    pub tg_chat_id: Option<String>,

    /// Legacy destination variable, used when `tg_chat_id` is absent
    #[serde(default)]
    pub tg_user_id: Option<String>,

    /// Optional forum topic inside the destination chat
    #[serde(default)]
    pub tg_topic_id: Option<String>,

    /// Comma-separated list of VK chat IDs allowed to relay
    #[serde(rename = "vk_chat_id")]
    #[serde(default)]
    pub vk_chat_ids_str: Option<String>,

    /// How many history items the resend utility inspects per peer
    #[serde(default)]
    pub resend_history_depth: Option<String>,
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails or a required value is
    /// missing.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start off by merging in the "default" configuration file
            .add_source(File::with_name("config/default").required(false))
            // Add in the current environment file
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Add in a local configuration file
            // This file shouldn't be checked into git
            .add_source(File::with_name("config/local").required(false))
            // Add in settings from environment variables directly
            // Note: Environment::default() auto-converts UPPER_SNAKE_CASE to snake_case
            // ignore_empty treats empty env vars as unset
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        s.try_deserialize()
    }

    /// VK chat IDs permitted to relay, in configuration order.
    #[must_use]
    pub fn allowed_chat_list(&self) -> Vec<i64> {
        self.vk_chat_ids_str
            .as_ref()
            .map(|s| {
                s.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
                    .filter(|token| !token.is_empty())
                    .filter_map(|id| id.parse::<i64>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// VK chat IDs permitted to relay, as a membership set.
    #[must_use]
    pub fn allowed_chats(&self) -> HashSet<i64> {
        self.allowed_chat_list().into_iter().collect()
    }

    /// Destination Telegram chat/topic, if one is configured.
    ///
    /// `tg_user_id` is honored as a fallback for `tg_chat_id`.
    #[must_use]
    pub fn destination(&self) -> Option<Destination> {
        let chat_id = self
            .tg_chat_id
            .as_ref()
            .or(self.tg_user_id.as_ref())
            .and_then(|id| id.trim().parse::<i64>().ok())?;

        let topic_id = self
            .tg_topic_id
            .as_ref()
            .and_then(|id| id.trim().parse::<i32>().ok());

        Some(Destination { chat_id, topic_id })
    }

    /// History depth for the resend utility.
    #[must_use]
    pub fn history_depth(&self) -> u32 {
        self.resend_history_depth
            .as_ref()
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .unwrap_or(DEFAULT_HISTORY_DEPTH)
    }
}
