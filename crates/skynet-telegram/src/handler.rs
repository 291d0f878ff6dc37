//! Telegram message handler registered in the teloxide Dispatcher.

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::ThreadId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use skynet_agent::chat_action::ChatActionManager;
use skynet_agent::normalize::{IncomingMessage, IncomingReplyRef, MediaKind, Normalizer, PhotoSize};
use skynet_agent::prompt::SessionInfo;
use skynet_agent::tools::to_definitions;
use skynet_agent::{ChatRequest, Orchestrator};
use skynet_core::config::TelegramConfig;
use skynet_core::money::Money;
use skynet_memory::{MessageRole, NewMessage, QueuedFile, ReplyContext, ThreadKey};
use skynet_queue::EnvelopeKind;
use skynet_users::{BalanceGate, GateDecision, QueuedBalanceReceipt, QueuedUserStats};

use crate::allow;
use crate::context::TelegramAppContext;
use crate::draft::{DraftManager, TelegramChatActionSink};
use crate::send;

/// How many past messages from the thread are fed back to the model as
/// history, before the Context Formatter's token budget trims further.
const HISTORY_DEPTH: usize = 80;

/// Expiry applied to platform file bindings registered from an inbound turn.
const FILE_TTL_SECS: i64 = 24 * 60 * 60;

/// Main message handler registered in the teloxide Dispatcher.
///
/// Runs for every incoming `Message`. Performs:
/// 1. Bot-message filter
/// 2. Allowlist check (deny-by-default)
/// 3. DM guard
/// 4. `require_mention` guard for groups
/// 5. User resolution via `UserResolver`
/// 6. Thread resolution/creation
/// 7. Slash command interception
/// 8. Balance Gate pre-check
/// 9. Normalization (download/transcribe/upload attachments)
/// 10. Persist the user turn, then drive the streaming orchestrator
pub async fn handle_message<C: TelegramAppContext + 'static>(
    bot: Bot,
    msg: Message,
    ctx: Arc<C>,
    config: TelegramConfig,
) -> ResponseResult<()> {
    // 1. Ignore messages from other bots.
    if msg.from.as_ref().map(|u| u.is_bot).unwrap_or(false) {
        return Ok(());
    }

    // 2. Extract sender identity.
    let from = match msg.from.as_ref() {
        Some(u) => u,
        None => return Ok(()),
    };
    let username = from.username.as_deref().unwrap_or("");
    let telegram_user_id = from.id.0.to_string();

    // 3. Allowlist check (deny-by-default).
    if !allow::is_allowed(&config.allow_users, username, &telegram_user_id) {
        return Ok(());
    }

    // 4. DM guard.
    if msg.chat.is_private() && !config.dm_allowed {
        return Ok(());
    }

    // 5. require_mention guard for group/supergroup.
    if (msg.chat.is_group() || msg.chat.is_supergroup()) && config.require_mention {
        let bot_info = bot.get_me().await;
        let bot_username = bot_info
            .as_ref()
            .ok()
            .and_then(|me| me.user.username.as_deref())
            .unwrap_or("");
        let text_for_mention = msg.text().or(msg.caption()).unwrap_or("");
        if !contains_mention(text_for_mention, bot_username) {
            return Ok(());
        }
    }

    // 6. Resolve Telegram user to Skynet user ID via UserResolver.
    let skynet_uid = match ctx.users().resolve("telegram", &telegram_user_id) {
        Ok(resolved) => resolved.user().id.clone(),
        Err(e) => {
            warn!(error = %e, "Telegram: user resolution failed");
            return Ok(());
        }
    };

    // 7. Resolve (or create) the thread this message belongs to.
    let chat_id_str = msg.chat.id.0.to_string();
    let topic = msg.thread_id.map(|t| t.0.to_string());
    let thread_key = ThreadKey::new(chat_id_str.clone(), skynet_uid.clone(), topic.clone());
    let thread = match ctx.threads().get_or_create_thread(&thread_key) {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "Telegram: failed to resolve thread");
            return Ok(());
        }
    };

    let text = msg.text().or(msg.caption()).unwrap_or("").to_string();

    // 8. Slash command interception.
    if text.starts_with('/') {
        if let Some(response) = handle_local_command(&text, &ctx, &thread_key, &skynet_uid).await {
            send::send_response(&bot, msg.chat.id, &response).await;
        }
        return Ok(());
    }

    let has_media = msg.photo().is_some()
        || msg.document().is_some()
        || msg.video().is_some()
        || msg.audio().is_some()
        || msg.voice().is_some()
        || msg.video_note().is_some();

    if text.is_empty() && !has_media {
        return Ok(());
    }

    // 9. Balance Gate pre-check — never place an unaffordable turn on the model.
    {
        let conn = ctx.users_db().lock().unwrap();
        match BalanceGate::check(&conn, &skynet_uid, ctx.balance().floor, false) {
            GateDecision::Allowed => {}
            GateDecision::Denied { balance, floor } => {
                drop(conn);
                send::send_response(
                    &bot,
                    msg.chat.id,
                    &format!(
                        "Balance too low to continue ({balance} available, {floor} required). \
                         Top up to keep chatting."
                    ),
                )
                .await;
                return Ok(());
            }
        }
    }

    // 10. Normalize the platform message (downloads/transcribes/uploads attachments).
    let incoming = to_incoming_message(&msg, &telegram_user_id, username, &topic);
    let processed = match Normalizer::new(ctx.platform()).normalize(incoming).await {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "Telegram: normalization failed");
            send::send_response(&bot, msg.chat.id, "Sorry, I couldn't process that message.").await;
            return Ok(());
        }
    };

    let user_text = match &processed.transcript {
        Some(t) if processed.text.is_empty() => t.text.clone(),
        Some(t) => format!("{}\n\n[voice transcript: {}]", processed.text, t.text),
        None => processed.text.clone(),
    };
    let transcript_cost = processed.transcript.as_ref().map(|t| t.cost).unwrap_or(Money::ZERO);

    let user_message = match ctx.threads().append_message(NewMessage {
        chat_id: chat_id_str.clone(),
        platform_message_id: msg.id.0 as i64,
        thread_id: thread.id,
        role: MessageRole::User,
        text: user_text,
        content_blob: None,
        sender_display: Some(processed.sender_display.clone()),
        reply: processed.reply.as_ref().map(|r| ReplyContext {
            snippet: r.snippet.clone(),
            sender_display: r.sender_display.clone(),
        }),
        forward: processed.forward.clone(),
        quote: processed.quote.clone(),
        has_attachments: !processed.files.is_empty(),
        model_used: None,
        tokens_in: 0,
        tokens_out: 0,
        cost: transcript_cost,
    }) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "Telegram: failed to persist user turn");
            return Ok(());
        }
    };

    for file in &processed.files {
        let payload = QueuedFile {
            platform_file_id: file.platform_file_id.clone(),
            mime_type: file.mime_type.clone(),
            kind: file.kind,
            message_id: Some(user_message.id),
            ttl_secs: FILE_TTL_SECS,
            llm_file_id: Some(file.llm_file_id.clone()),
        };
        if let Err(e) = ctx.queue().push(EnvelopeKind::File, serde_json::to_value(&payload).unwrap()) {
            warn!(error = %e, "Telegram: failed to enqueue file registration");
        }
    }

    // 11. Hand the turn off to the batch coordinator, which debounces rapid
    // bursts on the same thread into a single orchestrator run.
    let request = RunTurnRequest {
        chat_id: msg.chat.id,
        thread_id: msg.thread_id,
        thread_pk: thread.id,
        turn_count: thread.message_count,
        is_group_chat: processed.is_group_chat,
        skynet_uid,
    };
    ctx.batch().push(thread.id.to_string(), request);

    Ok(())
}

/// One inbound message normalized into what `run_turn` needs to build and
/// bill a turn. What the Batch Coordinator coalesces and `spawn_batch_drain`
/// dequeues.
#[derive(Debug, Clone)]
pub struct RunTurnRequest {
    pub chat_id: ChatId,
    pub thread_id: Option<ThreadId>,
    pub thread_pk: i64,
    pub turn_count: u32,
    pub is_group_chat: bool,
    pub skynet_uid: String,
}

/// Drains the Batch Coordinator's debounced batches, one turn per thread per
/// window: only the most recent request in a coalesced batch is run, since
/// `run_turn` always reloads the full, current thread history anyway.
pub fn spawn_batch_drain<C: TelegramAppContext + 'static>(
    bot: Bot,
    ctx: Arc<C>,
    mut rx: mpsc::UnboundedReceiver<(String, Vec<RunTurnRequest>)>,
) {
    tokio::spawn(async move {
        while let Some((_thread_key, mut items)) = rx.recv().await {
            let Some(request) = items.pop() else { continue };
            tokio::spawn(run_turn(bot.clone(), ctx.clone(), request));
        }
    });
}

/// Build the conversation, stream a reply through the orchestrator — looping
/// through any turn-break continuations — and persist + bill the resulting
/// assistant turn.
async fn run_turn<C: TelegramAppContext + 'static>(bot: Bot, ctx: Arc<C>, request: RunTurnRequest) {
    let RunTurnRequest {
        chat_id,
        thread_id,
        thread_pk,
        turn_count,
        is_group_chat,
        skynet_uid,
    } = request;

    let history = match ctx.threads().get_recent_messages(thread_pk, HISTORY_DEPTH) {
        Ok(h) => h,
        Err(e) => {
            warn!(error = %e, "Telegram: failed to load thread history");
            return;
        }
    };

    let opts = skynet_agent::FormatOptions::new(is_group_chat, ctx.context_window_tokens(), 4096);
    let mut conversation = skynet_agent::ContextFormatter::format(&history, &opts);

    let model = ctx.agent().get_model().await;
    let session_info = SessionInfo {
        session_key: format!("telegram:{}", chat_id.0),
        turn_count,
        timestamp: chrono::Utc::now().to_rfc3339(),
    };
    let system_prompt = ctx.agent().prompt().await.build_prompt(None, Some(&session_info));
    let system = system_prompt.to_plain_text();

    let request_template = ChatRequest {
        model: model.clone(),
        system,
        system_prompt: Some(system_prompt),
        messages: Vec::new(),
        max_tokens: 4096,
        stream: true,
        thinking: None,
        tools: to_definitions(ctx.tools()),
        raw_messages: None,
    };

    let mut manager = DraftManager::new(bot.clone(), chat_id, thread_id);
    let sink = TelegramChatActionSink::new(bot.clone(), chat_id, thread_id);
    let chat_action = ChatActionManager::new(Arc::new(sink));
    let cancel = CancellationToken::new();

    let mut tokens_in = 0u32;
    let mut tokens_out = 0u32;
    let mut has_delivered_files = false;

    // Turn-break tools (e.g. "send this file, then keep talking") end one
    // `stream` call with `needs_continuation`; the draft is committed, any
    // files are delivered, and the model resumes with the returned
    // conversation until a call finally finishes without a turn break.
    let result = loop {
        let draft = manager.draft();
        let orchestrator = Orchestrator::new(
            ctx.agent().provider(),
            ctx.tools(),
            draft.as_ref(),
            chat_action.clone(),
            Some(ctx.queue().clone()),
        );
        let sr = match orchestrator
            .stream(conversation.clone(), request_template.clone(), &cancel)
            .await
        {
            Ok(sr) => sr,
            Err(e) => break Err(e),
        };

        tokens_in += sr.tokens_in;
        tokens_out += sr.tokens_out;
        has_delivered_files |= sr.has_delivered_files;

        if !sr.needs_continuation {
            for file in &sr.delivered_files {
                ctx.platform().send_file(chat_id, thread_id, file).await;
            }
            manager.finalize(None).await;
            break Ok(sr);
        }

        manager.commit_and_create_new(&sr.text).await;
        for file in &sr.delivered_files {
            ctx.platform().send_file(chat_id, thread_id, file).await;
        }
        conversation = sr.conversation;
    };

    match result {
        Ok(sr) => {
            let cost = ctx.pricing().estimate_turn_cost(&model, tokens_in, tokens_out);

            let assistant_turn = NewMessage {
                chat_id: chat_id.0.to_string(),
                platform_message_id: -chrono::Utc::now().timestamp_millis(),
                thread_id: thread_pk,
                role: MessageRole::Assistant,
                text: sr.text,
                content_blob: Some(serde_json::Value::Array(sr.final_message_blocks)),
                sender_display: None,
                reply: None,
                forward: None,
                quote: None,
                has_attachments: has_delivered_files,
                model_used: Some(model.clone()),
                tokens_in,
                tokens_out,
                cost,
            };
            if let Err(e) = ctx
                .queue()
                .push(EnvelopeKind::Message, serde_json::to_value(&assistant_turn).unwrap())
            {
                warn!(error = %e, "Telegram: failed to enqueue assistant turn");
            }

            let stats = QueuedUserStats {
                user_id: skynet_uid.clone(),
                tokens: (tokens_in + tokens_out) as u64,
            };
            if let Err(e) = ctx.queue().push(EnvelopeKind::UserStats, serde_json::to_value(&stats).unwrap()) {
                warn!(error = %e, "Telegram: failed to enqueue token usage stats");
            }

            if !cost.is_negative() && cost != Money::ZERO {
                let charge_result = {
                    let conn = ctx.users_db().lock().unwrap();
                    BalanceGate::charge(&conn, &skynet_uid, cost, &format!("telegram turn ({model})"), None)
                };
                match charge_result {
                    Ok(_) => {
                        let receipt = QueuedBalanceReceipt {
                            user_id: skynet_uid,
                            kind: "charge".to_string(),
                            amount_micros: -cost.micros(),
                            related_message: None,
                            description: format!("telegram turn ({model})"),
                        };
                        if let Err(e) =
                            ctx.queue().push(EnvelopeKind::BalanceOp, serde_json::to_value(&receipt).unwrap())
                        {
                            warn!(error = %e, "Telegram: failed to enqueue balance receipt");
                        }
                    }
                    Err(e) => warn!(error = %e, "Telegram: failed to charge balance"),
                }
            }
        }
        Err(e) => {
            manager.finalize(None).await;
            warn!(error = %e, "Telegram: orchestrator stream failed");
            send::send_response(&bot, chat_id, &format!("Sorry, something went wrong: {e}")).await;
        }
    }
}

/// Map a teloxide `Message` into the platform-neutral shape the normalizer
/// consumes. Stickers have no `MediaKind` counterpart and fall back to
/// whatever caption/text is present; forward/quote metadata is left for a
/// future pass since Bot API 7's forward-origin shape isn't exercised here.
fn to_incoming_message(
    msg: &Message,
    telegram_user_id: &str,
    username: &str,
    topic: &Option<String>,
) -> IncomingMessage {
    let sender_display = if username.is_empty() {
        msg.from.as_ref().map(|u| u.first_name.clone())
    } else {
        Some(username.to_string())
    };

    let media = if let Some(photos) = msg.photo() {
        MediaKind::Photo {
            sizes: photos
                .iter()
                .map(|p| PhotoSize {
                    file_id: p.file.id.clone(),
                    width: p.width,
                    height: p.height,
                })
                .collect(),
        }
    } else if let Some(doc) = msg.document() {
        MediaKind::Document {
            file_id: doc.file.id.clone(),
        }
    } else if let Some(video) = msg.video() {
        MediaKind::Video {
            file_id: video.file.id.clone(),
        }
    } else if let Some(audio) = msg.audio() {
        MediaKind::Audio {
            file_id: audio.file.id.clone(),
        }
    } else if let Some(voice) = msg.voice() {
        MediaKind::Voice {
            file_id: voice.file.id.clone(),
        }
    } else if let Some(video_note) = msg.video_note() {
        MediaKind::VideoNote {
            file_id: video_note.file.id.clone(),
        }
    } else {
        MediaKind::Text
    };

    let mime_type = msg
        .document()
        .and_then(|d| d.mime_type.as_ref())
        .or_else(|| msg.video().and_then(|v| v.mime_type.as_ref()))
        .or_else(|| msg.audio().and_then(|a| a.mime_type.as_ref()))
        .or_else(|| msg.voice().and_then(|v| v.mime_type.as_ref()))
        .map(|m| m.to_string());

    let reply_to = msg.reply_to_message().map(|r| IncomingReplyRef {
        snippet: r.text().or(r.caption()).unwrap_or("").chars().take(200).collect(),
        sender_display: r
            .from
            .as_ref()
            .map(|u| u.username.clone().unwrap_or_else(|| u.first_name.clone()))
            .unwrap_or_else(|| "unknown".to_string()),
    });

    IncomingMessage {
        chat_id: msg.chat.id.0.to_string(),
        platform_message_id: msg.id.0 as i64,
        sender_id: Some(telegram_user_id.to_string()),
        sender_display,
        text: msg.text().or(msg.caption()).unwrap_or("").to_string(),
        mime_type,
        media,
        reply_to,
        forward_origin: None,
        quote: None,
        is_group_chat: msg.chat.is_group() || msg.chat.is_supergroup(),
        topic: topic.clone(),
    }
}

/// Handle commands local to the Telegram adapter.
///
/// Returns `Some(response)` if handled, `None` if not a known command.
async fn handle_local_command<C: TelegramAppContext>(
    text: &str,
    ctx: &Arc<C>,
    thread_key: &ThreadKey,
    skynet_uid: &str,
) -> Option<String> {
    let trimmed = text.trim();

    if trimmed.eq_ignore_ascii_case("/clear") {
        return match ctx.threads().soft_delete_thread(thread_key) {
            Ok(()) => Some("Conversation cleared. Starting fresh.".to_string()),
            Err(e) => {
                warn!(error = %e, "Telegram: /clear failed");
                Some("Couldn't clear this conversation.".to_string())
            }
        };
    }

    if trimmed.eq_ignore_ascii_case("/whoami") {
        return Some(format!(
            "User: `{skynet_uid}`\nThread: `{}`\nProvider: `{}`",
            thread_key.format(),
            ctx.agent().provider().name()
        ));
    }

    if trimmed.eq_ignore_ascii_case("/balance") {
        let conn = ctx.users_db().lock().unwrap();
        return match BalanceGate::get_balance(&conn, skynet_uid) {
            Ok(balance) => Some(format!("Current balance: {balance}")),
            Err(e) => {
                warn!(error = %e, "Telegram: /balance lookup failed");
                Some("Couldn't look up your balance.".to_string())
            }
        };
    }

    None
}

/// Return `true` if `text` contains a `@bot_username` mention.
fn contains_mention(text: &str, bot_username: &str) -> bool {
    if bot_username.is_empty() {
        return false;
    }
    let mention = format!("@{bot_username}");
    text.contains(&mention)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_mention_positive() {
        assert!(contains_mention("Hey @mybot, help!", "mybot"));
    }

    #[test]
    fn contains_mention_negative() {
        assert!(!contains_mention("Hello there", "mybot"));
    }

    #[test]
    fn contains_mention_empty_username() {
        assert!(!contains_mention("@foo bar", ""));
    }
}
