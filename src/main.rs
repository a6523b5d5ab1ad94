use dotenvy::dotenv;
use std::sync::Arc;
use teloxide::Bot;
use tracing::{error, info};
use tracing_subscriber::{prelude::*, EnvFilter};
use vkgram::config::Settings;
use vkgram::relay::{RelayLoop, Session};
use vkgram::tg::send::TelegramSink;
use vkgram::vk::api::{HttpVkApi, VkApi};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file
    dotenv().ok();

    init_logging();

    info!("Starting VK -> Telegram relay...");

    let settings = init_settings();

    let Some(destination) = settings.destination() else {
        error!("TG_CHAT_ID (or TG_USER_ID) must be set");
        std::process::exit(1);
    };
    let allowed_chats = settings.allowed_chats();
    if allowed_chats.is_empty() {
        error!("VK_CHAT_ID must contain at least one chat id");
        std::process::exit(1);
    }

    let vk = Arc::new(HttpVkApi::new());
    let sink = Arc::new(TelegramSink::new(Bot::new(settings.bot_token.clone())));

    let credentials = vk.resolve_credentials(&settings.auth_cookie).await?;
    info!("VK session established");

    let session = Session::from_credentials(credentials);
    let mut relay = RelayLoop::new(
        vk,
        sink,
        settings.auth_cookie.clone(),
        allowed_chats,
        destination,
        session,
    );

    relay.run().await;
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn init_settings() -> Settings {
    match Settings::new() {
        Ok(s) => {
            info!("Configuration loaded successfully.");
            s
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}
