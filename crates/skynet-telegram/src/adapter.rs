//! Telegram channel adapter.
//!
//! Wraps a teloxide `Bot` + `Dispatcher` and drives the long-polling event loop
//! until the process exits. Reconnects automatically on transport errors.

use std::sync::Arc;

use teloxide::prelude::*;
use tracing::info;

use skynet_core::config::TelegramConfig;
use skynet_core::reminder::ReminderDelivery;

use crate::context::TelegramAppContext;
use crate::handler::handle_message;

/// Telegram channel adapter.
///
/// Wraps a teloxide `Bot` and drives the Dispatcher event loop until the
/// process exits. Long polling — no public URL required.
pub struct TelegramAdapter<C: TelegramAppContext + 'static> {
    ctx: Arc<C>,
    config: TelegramConfig,
}

impl<C: TelegramAppContext + 'static> TelegramAdapter<C> {
    pub fn new(config: &TelegramConfig, ctx: Arc<C>) -> Self {
        Self {
            ctx,
            config: config.clone(),
        }
    }

    /// Connect to Telegram and drive the long-polling loop.
    ///
    /// Never returns — runs for the lifetime of the process.
    ///
    /// If `delivery_rx` is `Some`, a proactive reminder delivery task is spawned.
    pub async fn run(self, delivery_rx: Option<tokio::sync::mpsc::Receiver<ReminderDelivery>>) {
        let bot = Bot::new(&self.config.bot_token);

        // Spawn proactive reminder delivery task.
        if let Some(rx) = delivery_rx {
            let bot2 = bot.clone();
            tokio::spawn(crate::proactive::run_telegram_delivery(bot2, rx));
        }

        info!("Telegram: starting long-polling dispatcher");

        // Build the handler tree.
        let ctx = Arc::clone(&self.ctx);
        let config = self.config.clone();

        let handler = Update::filter_message().endpoint(handle_message::<C>);

        Dispatcher::builder(bot, handler)
            .dependencies(dptree::deps![ctx, config])
            .default_handler(|_upd| async {})
            .build()
            .dispatch()
            .await;
    }
}
