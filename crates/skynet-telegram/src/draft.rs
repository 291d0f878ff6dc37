//! Telegram binding of the streaming draft and chat-action primitives.
//!
//! Telegram's Bot API has no first-class "draft message" concept, so the
//! draft is realized the way `send.rs` already sends finished replies: one
//! message, sent once and edited in place as more text streams in, finalized
//! with one last edit. Edits are throttled — Telegram rate-limits
//! `editMessageText` — and an update that arrives inside the throttle window
//! is stashed as `pending_text` and flushed on the next tick or on `force`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use skynet_agent::chat_action::{ActionKind, ChatActionSink};
use skynet_agent::DraftHandle;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, MessageId, ParseMode, ThreadId};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::send::{escape_markdown_v2, split_chunks_smart};

/// Minimum gap between two `editMessageText` calls for the same draft.
const MIN_UPDATE_INTERVAL: Duration = Duration::from_millis(1500);

/// How often the background keepalive task refreshes the live draft so
/// Telegram doesn't treat it as stalled mid-generation.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3);

struct DraftState {
    message_id: Option<MessageId>,
    last_text: String,
    pending_text: Option<String>,
    last_update_at: Instant,
    finalized: bool,
}

impl Default for DraftState {
    fn default() -> Self {
        Self {
            message_id: None,
            last_text: String::new(),
            pending_text: None,
            last_update_at: Instant::now() - MIN_UPDATE_INTERVAL,
            finalized: false,
        }
    }
}

/// A `DraftHandle` bound to one Telegram chat (and, for forum groups, one
/// topic thread). Only the first chunk of a long reply gets the live-edit
/// treatment; `finalize` hands any overflow to `send_response`'s chunk
/// splitter the same way a non-streamed reply would.
pub struct TelegramDraft {
    bot: Bot,
    chat_id: ChatId,
    thread_id: Option<ThreadId>,
    state: Mutex<DraftState>,
}

impl TelegramDraft {
    pub fn new(bot: Bot, chat_id: ChatId, thread_id: Option<ThreadId>) -> Self {
        Self {
            bot,
            chat_id,
            thread_id,
            state: Mutex::new(DraftState::default()),
        }
    }

    async fn send_or_edit(&self, state: &mut DraftState, text: &str) {
        let escaped = escape_markdown_v2(text);
        match state.message_id {
            None => {
                let mut req = self.bot.send_message(self.chat_id, &escaped);
                if let Some(thread_id) = self.thread_id {
                    req = req.message_thread_id(thread_id);
                }
                match req.parse_mode(ParseMode::MarkdownV2).await {
                    Ok(msg) => state.message_id = Some(msg.id),
                    Err(_) => {
                        // MarkdownV2 rejected — retry with plain text.
                        let mut req = self.bot.send_message(self.chat_id, text);
                        if let Some(thread_id) = self.thread_id {
                            req = req.message_thread_id(thread_id);
                        }
                        match req.await {
                            Ok(msg) => state.message_id = Some(msg.id),
                            Err(e) => warn!(error = %e, "Telegram: failed to send draft"),
                        }
                    }
                }
            }
            Some(message_id) => {
                let result = self
                    .bot
                    .edit_message_text(self.chat_id, message_id, &escaped)
                    .parse_mode(ParseMode::MarkdownV2)
                    .await;
                if result.is_err() {
                    // MarkdownV2 rejected — retry with plain text.
                    if let Err(e) = self
                        .bot
                        .edit_message_text(self.chat_id, message_id, text)
                        .await
                    {
                        warn!(error = %e, "Telegram: failed to edit draft");
                    }
                }
            }
        }
        state.last_text = text.to_string();
        state.last_update_at = Instant::now();
        state.pending_text = None;
    }
}

#[async_trait]
impl DraftHandle for TelegramDraft {
    async fn update(&self, text: &str, force: bool) {
        let mut state = self.state.lock().await;
        if state.finalized || text == state.last_text {
            return;
        }

        if !force && state.last_update_at.elapsed() < MIN_UPDATE_INTERVAL {
            state.pending_text = Some(text.to_string());
            return;
        }

        let text = text.to_string();
        self.send_or_edit(&mut state, &text).await;
    }

    async fn keepalive(&self) {
        let mut state = self.state.lock().await;
        if state.finalized || state.last_text.is_empty() {
            return;
        }
        let text = state.last_text.clone();
        self.send_or_edit(&mut state, &text).await;
    }

    async fn finalize(&self, final_text: Option<&str>) {
        let mut state = self.state.lock().await;
        if state.finalized {
            return;
        }

        if let Some(pending) = state.pending_text.take() {
            if state.message_id.is_some() || final_text.is_none() {
                self.send_or_edit(&mut state, &pending).await;
            }
        }

        if let Some(final_text) = final_text {
            if final_text != state.last_text || state.message_id.is_none() {
                let chunks = split_chunks_smart(final_text);
                let mut chunks = chunks.into_iter();
                if let Some(first) = chunks.next() {
                    self.send_or_edit(&mut state, &first).await;
                }
                for chunk in chunks {
                    let mut req = self.bot.send_message(self.chat_id, &escape_markdown_v2(&chunk));
                    if let Some(thread_id) = self.thread_id {
                        req = req.message_thread_id(thread_id);
                    }
                    if let Err(e) = req.parse_mode(ParseMode::MarkdownV2).await {
                        warn!(error = %e, "Telegram: failed to send overflow chunk");
                    }
                }
            }
        }

        state.finalized = true;
    }

    async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.finalized = true;
    }
}

/// Owns the lifecycle of the current `TelegramDraft`: spawns its keepalive
/// task, and on a turn break commits the draft and opens a fresh one for
/// the text that follows. The orchestrator only ever borrows the draft
/// through `draft()`; this manager — not the orchestrator — owns the scope
/// that guarantees the keepalive task is stopped, on every exit path
/// including an error return.
pub struct DraftManager {
    bot: Bot,
    chat_id: ChatId,
    thread_id: Option<ThreadId>,
    draft: Arc<TelegramDraft>,
    keepalive_handle: JoinHandle<()>,
}

impl DraftManager {
    pub fn new(bot: Bot, chat_id: ChatId, thread_id: Option<ThreadId>) -> Self {
        let draft = Arc::new(TelegramDraft::new(bot.clone(), chat_id, thread_id));
        let keepalive_handle = spawn_keepalive(draft.clone());
        Self {
            bot,
            chat_id,
            thread_id,
            draft,
            keepalive_handle,
        }
    }

    /// Borrow the current draft to hand to the orchestrator.
    pub fn draft(&self) -> Arc<TelegramDraft> {
        self.draft.clone()
    }

    /// Commit the current draft as a permanent message, then open a new one
    /// for the text that follows (used at a turn-break boundary, after file
    /// delivery has been handed off by the caller).
    pub async fn commit_and_create_new(&mut self, final_text: &str) {
        self.draft.finalize(Some(final_text)).await;
        self.keepalive_handle.abort();

        let draft = Arc::new(TelegramDraft::new(self.bot.clone(), self.chat_id, self.thread_id));
        self.keepalive_handle = spawn_keepalive(draft.clone());
        self.draft = draft;
    }

    /// Commit the current draft as the turn's terminal message. Call this
    /// once at the end of a turn instead of reaching into `draft()` directly
    /// so the keepalive task is stopped in the same step.
    pub async fn finalize(&mut self, final_text: Option<&str>) {
        self.draft.finalize(final_text).await;
        self.keepalive_handle.abort();
    }
}

impl Drop for DraftManager {
    fn drop(&mut self) {
        // Guarantees no keepalive task survives this scope on any exit path,
        // including an early return from an error — abort() on an
        // already-finished task is a harmless no-op.
        self.keepalive_handle.abort();
    }
}

fn spawn_keepalive(draft: Arc<TelegramDraft>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        ticker.tick().await; // first tick fires immediately
        loop {
            ticker.tick().await;
            draft.keepalive().await;
        }
    })
}

/// Resolves a chat-action phase to Telegram's `sendChatAction` and fires it.
pub struct TelegramChatActionSink {
    bot: Bot,
    chat_id: ChatId,
    thread_id: Option<ThreadId>,
}

impl TelegramChatActionSink {
    pub fn new(bot: Bot, chat_id: ChatId, thread_id: Option<ThreadId>) -> Self {
        Self {
            bot,
            chat_id,
            thread_id,
        }
    }
}

#[async_trait]
impl ChatActionSink for TelegramChatActionSink {
    async fn send_action(&self, action: ActionKind) {
        let action = match action {
            ActionKind::Typing => ChatAction::Typing,
            ActionKind::UploadingPhoto => ChatAction::UploadPhoto,
            ActionKind::UploadingVideo => ChatAction::UploadVideo,
            ActionKind::UploadingAudio => ChatAction::UploadVoice,
            ActionKind::UploadingDocument => ChatAction::UploadDocument,
            ActionKind::FindingLocation => ChatAction::FindLocation,
        };
        let mut req = self.bot.send_chat_action(self.chat_id, action);
        if let Some(thread_id) = self.thread_id {
            req = req.message_thread_id(thread_id);
        }
        let _ = req.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_update_interval_is_positive() {
        assert!(MIN_UPDATE_INTERVAL > Duration::ZERO);
    }

    #[test]
    fn default_draft_state_is_not_finalized() {
        let state = DraftState::default();
        assert!(!state.finalized);
        assert!(state.message_id.is_none());
        assert!(state.last_text.is_empty());
    }

    #[test]
    fn keepalive_interval_is_shorter_than_telegram_draft_timeout() {
        assert!(KEEPALIVE_INTERVAL < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn draft_manager_drop_aborts_keepalive_task() {
        let bot = Bot::new("000000:test-token-not-a-real-bot");
        let manager = DraftManager::new(bot, ChatId(1), None);
        assert!(!manager.keepalive_handle.is_finished());
        drop(manager);
    }
}
