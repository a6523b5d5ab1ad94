//! Manual resend of missed photo messages from recent VK history.
//!
//! Validates configuration up front, then runs one sequential pass over the
//! allow-listed peers. Messages dated before today's UTC midnight are
//! skipped.

use anyhow::Context;
use chrono::{NaiveTime, Utc};
use dotenvy::dotenv;
use teloxide::Bot;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};
use vkgram::config::Settings;
use vkgram::resend::resend_photos_for_peer;
use vkgram::tg::send::TelegramSink;
use vkgram::vk::api::{HttpVkApi, VkApi};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // All configuration problems must surface before any network activity.
    let settings =
        Settings::new().context("AUTH_COOKIE, BOT_TOKEN, TG_CHAT_ID and VK_CHAT_ID must be set")?;
    let destination = settings
        .destination()
        .context("TG_CHAT_ID (or TG_USER_ID) must be set")?;
    let peers = settings.allowed_chat_list();
    anyhow::ensure!(!peers.is_empty(), "VK_CHAT_ID must contain at least one peer id");

    info!(?peers, "starting manual resend");

    let threshold = Utc::now()
        .date_naive()
        .and_time(NaiveTime::MIN)
        .and_utc()
        .timestamp();

    let vk = HttpVkApi::new();
    let sink = TelegramSink::new(Bot::new(settings.bot_token.clone()));

    let credentials = vk.resolve_credentials(&settings.auth_cookie).await?;

    let mut total_sent = 0;
    for peer_id in peers {
        total_sent += resend_photos_for_peer(
            &vk,
            &sink,
            &credentials.access_token,
            peer_id,
            &destination,
            threshold,
            settings.history_depth(),
        )
        .await?;
    }

    info!(total_sent, "manual resend finished");
    Ok(())
}
