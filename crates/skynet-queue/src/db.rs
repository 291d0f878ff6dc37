use rusqlite::Connection;

use crate::error::Result;

/// Initialise the write-behind queue table. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS write_queue (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            kind         TEXT NOT NULL,
            payload      TEXT NOT NULL,
            enqueued_at  TEXT NOT NULL,
            attempts     INTEGER NOT NULL DEFAULT 0,
            retry_after  TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_write_queue_ready
            ON write_queue (id) WHERE retry_after IS NULL;",
    )?;
    Ok(())
}
