use std::path::PathBuf;
use std::sync::Arc;

use teloxide::prelude::*;
use tracing::info;

use skynet_telegram::adapter::TelegramAdapter;
use skynet_telegram::app::TelegramAppState;
use skynet_telegram::handler::spawn_batch_drain;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skynet_telegram=info".into()),
        )
        .init();

    let config_path = std::env::var("SKYNET_CONFIG").ok();
    let config = skynet_core::config::SkynetConfig::load(config_path.as_deref())?;

    let bot = Bot::new(&config.telegram.bot_token);
    let tools_dir = std::env::var("HOME")
        .map(|home| PathBuf::from(home).join(".skynet/tools"))
        .unwrap_or_else(|_| PathBuf::from(".skynet/tools"));

    let (state, flusher, batch_rx) = TelegramAppState::new(&config, bot.clone(), &tools_dir)?;
    let state = Arc::new(state);

    let shutdown_tx = TelegramAppState::spawn_flusher(&config, flusher);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Telegram: shutdown signal received, draining write-behind queue");
        let _ = shutdown_tx.send(true);
    });

    spawn_batch_drain(bot, state.clone(), batch_rx);

    info!("Skynet Telegram bot starting long-polling dispatcher");
    let telegram_config = config.telegram.clone();
    let adapter = TelegramAdapter::new(&telegram_config, state);
    adapter.run(None).await;

    Ok(())
}
