use rusqlite::{Connection, Result};

/// Initialise memory tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_user_memory_table(conn)?;
    create_fts_index(conn)?;
    create_threads_table(conn)?;
    create_messages_table(conn)?;
    create_user_files_table(conn)?;
    Ok(())
}

fn create_user_memory_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS user_memory (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     TEXT NOT NULL,
            category    TEXT NOT NULL,
            key         TEXT NOT NULL,
            value       TEXT NOT NULL,
            confidence  REAL NOT NULL DEFAULT 0.8,
            source      TEXT NOT NULL DEFAULT 'inferred',
            expires_at  TEXT,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            UNIQUE(user_id, category, key)
        );
        CREATE INDEX IF NOT EXISTS idx_memory_user
            ON user_memory(user_id);",
    )
}

/// FTS5 virtual table for full-text search across memory keys and values.
/// content='' makes it an external-content table — we sync manually on write.
fn create_fts_index(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS user_memory_fts
            USING fts5(key, value, content='user_memory', content_rowid='id');",
    )
}

/// Threads are the unit of LLM context: `(chat, user, optional topic)`.
/// Destruction is logical — `deleted_at` is set, the row is kept — so a
/// re-opened chat with the same key resumes its history.
fn create_threads_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS threads (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            thread_key     TEXT NOT NULL UNIQUE,
            chat_id        TEXT NOT NULL,
            user_id        TEXT NOT NULL,
            topic          TEXT,
            title          TEXT,
            message_count  INTEGER NOT NULL DEFAULT 0,
            total_tokens   INTEGER NOT NULL DEFAULT 0,
            last_model     TEXT,
            created_at     TEXT NOT NULL,
            updated_at     TEXT NOT NULL,
            deleted_at     TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_threads_chat_user
            ON threads(chat_id, user_id, updated_at DESC);",
    )
}

/// Messages carry the opaque content blob (see `types::Message`) alongside
/// per-role metadata. Composite key `(chat_id, platform_message_id)` backs
/// the at-most-once insert the write-behind flusher relies on.
fn create_messages_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            id                    INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id               TEXT NOT NULL,
            platform_message_id   INTEGER NOT NULL,
            thread_id             INTEGER NOT NULL,
            role                  TEXT NOT NULL,
            text                  TEXT NOT NULL,
            content_blob          TEXT,
            sender_display        TEXT,
            reply_json            TEXT,
            forward_json          TEXT,
            quote_json            TEXT,
            has_attachments       INTEGER NOT NULL DEFAULT 0,
            edit_count            INTEGER NOT NULL DEFAULT 0,
            original_text         TEXT,
            model_used            TEXT,
            tokens_in             INTEGER NOT NULL DEFAULT 0,
            tokens_out            INTEGER NOT NULL DEFAULT 0,
            cost_micros           INTEGER NOT NULL DEFAULT 0,
            created_at            TEXT NOT NULL,
            UNIQUE(chat_id, platform_message_id)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_thread
            ON messages(thread_id, created_at);",
    )
}

fn create_user_files_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS user_files (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            platform_file_id TEXT NOT NULL,
            llm_file_id      TEXT,
            mime_type        TEXT NOT NULL,
            kind             TEXT NOT NULL,
            message_id       INTEGER,
            expires_at       TEXT NOT NULL,
            created_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_user_files_message
            ON user_files(message_id);",
    )
}
