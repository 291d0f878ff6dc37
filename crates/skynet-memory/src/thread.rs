use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use skynet_core::money::Money;
use tracing::{debug, instrument};

use crate::error::{MemoryError, Result};
use crate::types::{
    ForwardOrigin, Message, MessageRole, NewMessage, QuoteContext, ReplyContext, Thread, ThreadKey,
};

/// History reads are cached per thread for this long before a fresh SQLite
/// round-trip is forced.
const HISTORY_CACHE_TTL_SECS: i64 = 30;
const HISTORY_CACHE_MAX_ENTRIES: usize = 512;

struct CachedHistory {
    messages: Vec<Message>,
    cached_at: chrono::DateTime<Utc>,
}

/// Read-through cache over the Thread/Message relational state.
///
/// Every write goes straight to SQLite (there is no write-behind buffering
/// here — that is `skynet-queue`'s job one layer up); what this cache saves
/// is the repeated `SELECT ... ORDER BY created_at` a chatty thread would
/// otherwise issue on every Context Formatter call.
pub struct ThreadCache {
    db: Mutex<Connection>,
    history: Mutex<HashMap<i64, CachedHistory>>,
}

impl ThreadCache {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Return the thread for `key`, creating it if this is the first time
    /// this (chat, user, topic) tuple has been seen. Never resurrects a
    /// soft-deleted thread under a *different* key — deletion is per row.
    #[instrument(skip(self), fields(key = %key))]
    pub fn get_or_create_thread(&self, key: &ThreadKey) -> Result<Thread> {
        if let Some(thread) = self.get_thread(key)? {
            return Ok(thread);
        }

        let now = Utc::now().to_rfc3339();
        let key_str = key.format();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO threads
             (thread_key, chat_id, user_id, topic, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![key_str, key.chat_id, key.user_id, key.topic, now],
        )?;
        drop(db);

        self.get_thread(key)?
            .ok_or_else(|| MemoryError::ThreadNotFound { key: key_str })
    }

    pub fn get_thread(&self, key: &ThreadKey) -> Result<Option<Thread>> {
        let key_str = key.format();
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, thread_key, title, message_count, total_tokens, last_model,
                    created_at, updated_at, deleted_at
             FROM threads WHERE thread_key = ?1",
            params![key_str],
            row_to_thread,
        )
        .optional()
        .map_err(MemoryError::from)
    }

    /// Logical delete — flips `deleted_at`, never removes the row or its
    /// messages. A later `get_or_create_thread` with the same key returns
    /// the same (still-deleted) row rather than a fresh one; callers that
    /// want to resume a conversation must clear `deleted_at` explicitly.
    #[instrument(skip(self), fields(key = %key))]
    pub fn soft_delete_thread(&self, key: &ThreadKey) -> Result<()> {
        let key_str = key.format();
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let rows = db.execute(
            "UPDATE threads SET deleted_at = ?1, updated_at = ?1 WHERE thread_key = ?2",
            params![now, key_str],
        )?;
        if rows == 0 {
            return Err(MemoryError::ThreadNotFound { key: key_str });
        }
        Ok(())
    }

    /// Insert a message, realizing at-most-once semantics on
    /// `(chat_id, platform_message_id)`: a duplicate insert is a silent
    /// no-op that returns the row already on file, not an error.
    #[instrument(skip(self, msg), fields(chat_id = %msg.chat_id, platform_message_id = msg.platform_message_id))]
    pub fn append_message(&self, msg: NewMessage) -> Result<Message> {
        let now = Utc::now().to_rfc3339();
        let content_blob_json = msg
            .content_blob
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let reply_json = msg.reply.as_ref().map(serde_json::to_string).transpose()?;
        let forward_json = msg.forward.as_ref().map(serde_json::to_string).transpose()?;
        let quote_json = msg.quote.as_ref().map(serde_json::to_string).transpose()?;

        let db = self.db.lock().unwrap();
        let rows = db.execute(
            "INSERT OR IGNORE INTO messages
             (chat_id, platform_message_id, thread_id, role, text, content_blob,
              sender_display, reply_json, forward_json, quote_json, has_attachments,
              model_used, tokens_in, tokens_out, cost_micros, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                msg.chat_id,
                msg.platform_message_id,
                msg.thread_id,
                msg.role.to_string(),
                msg.text,
                content_blob_json,
                msg.sender_display,
                reply_json,
                forward_json,
                quote_json,
                msg.has_attachments as i64,
                msg.model_used,
                msg.tokens_in,
                msg.tokens_out,
                msg.cost.micros(),
                now,
            ],
        )?;

        if rows > 0 {
            let tokens = (msg.tokens_in + msg.tokens_out) as i64;
            db.execute(
                "UPDATE threads
                 SET message_count = message_count + 1,
                     total_tokens  = total_tokens + ?1,
                     last_model    = COALESCE(?2, last_model),
                     updated_at    = ?3
                 WHERE id = ?4",
                params![tokens, msg.model_used, now, msg.thread_id],
            )?;
        } else {
            debug!(
                chat_id = %msg.chat_id,
                platform_message_id = msg.platform_message_id,
                "duplicate message envelope ignored"
            );
        }
        let thread_id = msg.thread_id;
        drop(db);

        self.invalidate_history(thread_id);

        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, chat_id, platform_message_id, thread_id, role, text, content_blob,
                    sender_display, reply_json, forward_json, quote_json, has_attachments,
                    edit_count, original_text, model_used, tokens_in, tokens_out,
                    cost_micros, created_at
             FROM messages WHERE chat_id = ?1 AND platform_message_id = ?2",
            params![msg.chat_id, msg.platform_message_id],
            row_to_message,
        )
        .map_err(MemoryError::from)
    }

    /// Record an edit to an existing message: bumps `edit_count`, preserves
    /// the first-seen body in `original_text`, and updates the live `text`.
    #[instrument(skip(self, new_text), fields(chat_id, platform_message_id))]
    pub fn record_edit(&self, chat_id: &str, platform_message_id: i64, new_text: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let existing: Option<(i64, i64, Option<String>, String)> = db
            .query_row(
                "SELECT id, thread_id, original_text, text FROM messages
                 WHERE chat_id = ?1 AND platform_message_id = ?2",
                params![chat_id, platform_message_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let Some((id, thread_id, original_text, old_text)) = existing else {
            return Err(MemoryError::ThreadNotFound {
                key: format!("{chat_id}:{platform_message_id}"),
            });
        };

        let original = original_text.unwrap_or(old_text);
        db.execute(
            "UPDATE messages
             SET text = ?1, edit_count = edit_count + 1, original_text = ?2
             WHERE id = ?3",
            params![new_text, original, id],
        )?;
        drop(db);
        self.invalidate_history(thread_id);
        Ok(())
    }

    /// Recent messages for a thread, oldest first — the shape the Context
    /// Formatter wants. Served from cache when fresh.
    #[instrument(skip(self), fields(thread_id, limit))]
    pub fn get_recent_messages(&self, thread_id: i64, limit: usize) -> Result<Vec<Message>> {
        if let Some(cached) = self.cached_history(thread_id) {
            return Ok(cached);
        }

        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, chat_id, platform_message_id, thread_id, role, text, content_blob,
                    sender_display, reply_json, forward_json, quote_json, has_attachments,
                    edit_count, original_text, model_used, tokens_in, tokens_out,
                    cost_micros, created_at
             FROM messages
             WHERE thread_id = ?1
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![thread_id, limit as i64], row_to_message)?;
        let mut messages: Vec<Message> = rows.filter_map(|r| r.ok()).collect();
        messages.reverse();
        drop(stmt);
        drop(db);

        self.store_history_cache(thread_id, messages.clone());
        Ok(messages)
    }

    fn cached_history(&self, thread_id: i64) -> Option<Vec<Message>> {
        let cache = self.history.lock().unwrap();
        let entry = cache.get(&thread_id)?;
        let age = Utc::now().signed_duration_since(entry.cached_at).num_seconds();
        if age < HISTORY_CACHE_TTL_SECS {
            Some(entry.messages.clone())
        } else {
            None
        }
    }

    fn store_history_cache(&self, thread_id: i64, messages: Vec<Message>) {
        let mut cache = self.history.lock().unwrap();
        if cache.len() >= HISTORY_CACHE_MAX_ENTRIES && !cache.contains_key(&thread_id) {
            let oldest = cache
                .iter()
                .min_by_key(|(_, v)| v.cached_at)
                .map(|(k, _)| *k);
            if let Some(k) = oldest {
                cache.remove(&k);
            }
        }
        cache.insert(
            thread_id,
            CachedHistory {
                messages,
                cached_at: Utc::now(),
            },
        );
    }

    fn invalidate_history(&self, thread_id: i64) {
        self.history.lock().unwrap().remove(&thread_id);
    }
}

fn row_to_thread(row: &rusqlite::Row<'_>) -> rusqlite::Result<Thread> {
    let key_str: String = row.get(1)?;
    let key = ThreadKey::parse(&key_str).unwrap_or(ThreadKey {
        chat_id: String::new(),
        user_id: String::new(),
        topic: None,
    });
    Ok(Thread {
        id: row.get(0)?,
        key,
        title: row.get(2)?,
        message_count: row.get::<_, i64>(3)? as u32,
        total_tokens: row.get::<_, i64>(4)? as u64,
        last_model: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        deleted_at: row.get(8)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role_str: String = row.get(4)?;
    let content_blob_str: Option<String> = row.get(6)?;
    let reply_str: Option<String> = row.get(8)?;
    let forward_str: Option<String> = row.get(9)?;
    let quote_str: Option<String> = row.get(10)?;

    Ok(Message {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        platform_message_id: row.get(2)?,
        thread_id: row.get(3)?,
        role: role_str.parse().unwrap_or(MessageRole::User),
        text: row.get(5)?,
        content_blob: content_blob_str.and_then(|s| serde_json::from_str(&s).ok()),
        sender_display: row.get(7)?,
        reply: reply_str.and_then(|s| serde_json::from_str::<ReplyContext>(&s).ok()),
        forward: forward_str.and_then(|s| serde_json::from_str::<ForwardOrigin>(&s).ok()),
        quote: quote_str.and_then(|s| serde_json::from_str::<QuoteContext>(&s).ok()),
        has_attachments: row.get::<_, i64>(11)? != 0,
        edit_count: row.get::<_, i64>(12)? as u32,
        original_text: row.get(13)?,
        model_used: row.get(14)?,
        tokens_in: row.get(15)?,
        tokens_out: row.get(16)?,
        cost: Money::from_micros(row.get(17)?),
        created_at: row.get(18)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_cache() -> ThreadCache {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        ThreadCache::new(conn)
    }

    fn sample_message(chat_id: &str, platform_message_id: i64, thread_id: i64) -> NewMessage {
        NewMessage {
            chat_id: chat_id.to_string(),
            platform_message_id,
            thread_id,
            role: MessageRole::User,
            text: "hello".to_string(),
            content_blob: None,
            sender_display: Some("Alice".to_string()),
            reply: None,
            forward: None,
            quote: None,
            has_attachments: false,
            model_used: None,
            tokens_in: 10,
            tokens_out: 0,
            cost: Money::ZERO,
        }
    }

    #[test]
    fn get_or_create_thread_is_idempotent() {
        let cache = open_cache();
        let key = ThreadKey::new("chat1", "user1", None);
        let t1 = cache.get_or_create_thread(&key).unwrap();
        let t2 = cache.get_or_create_thread(&key).unwrap();
        assert_eq!(t1.id, t2.id);
    }

    #[test]
    fn soft_delete_preserves_row() {
        let cache = open_cache();
        let key = ThreadKey::new("chat1", "user1", None);
        cache.get_or_create_thread(&key).unwrap();
        cache.soft_delete_thread(&key).unwrap();
        let thread = cache.get_thread(&key).unwrap().unwrap();
        assert!(thread.is_deleted());
    }

    #[test]
    fn duplicate_message_insert_is_noop() {
        let cache = open_cache();
        let key = ThreadKey::new("chat1", "user1", None);
        let thread = cache.get_or_create_thread(&key).unwrap();

        cache.append_message(sample_message("chat1", 42, thread.id)).unwrap();
        cache.append_message(sample_message("chat1", 42, thread.id)).unwrap();

        let history = cache.get_recent_messages(thread.id, 10).unwrap();
        assert_eq!(history.len(), 1);
        let reloaded = cache.get_thread(&key).unwrap().unwrap();
        assert_eq!(reloaded.message_count, 1);
    }

    #[test]
    fn recent_messages_are_oldest_first() {
        let cache = open_cache();
        let key = ThreadKey::new("chat1", "user1", None);
        let thread = cache.get_or_create_thread(&key).unwrap();

        cache.append_message(sample_message("chat1", 1, thread.id)).unwrap();
        cache.append_message(sample_message("chat1", 2, thread.id)).unwrap();

        let history = cache.get_recent_messages(thread.id, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].platform_message_id, 1);
        assert_eq!(history[1].platform_message_id, 2);
    }

    #[test]
    fn record_edit_preserves_original_text_once() {
        let cache = open_cache();
        let key = ThreadKey::new("chat1", "user1", None);
        let thread = cache.get_or_create_thread(&key).unwrap();
        cache.append_message(sample_message("chat1", 1, thread.id)).unwrap();

        cache.record_edit("chat1", 1, "hello (edited)").unwrap();
        cache.record_edit("chat1", 1, "hello (edited again)").unwrap();

        let history = cache.get_recent_messages(thread.id, 10).unwrap();
        assert_eq!(history[0].text, "hello (edited again)");
        assert_eq!(history[0].original_text.as_deref(), Some("hello"));
        assert_eq!(history[0].edit_count, 2);
    }

    #[test]
    fn thread_key_round_trips_with_topic() {
        let key = ThreadKey::new("123", "456", Some("7".to_string()));
        let parsed = ThreadKey::parse(&key.format()).unwrap();
        assert_eq!(key, parsed);
    }
}
