//! [`skynet_queue::QueueConsumer`] implementation for the `ToolCall`
//! envelope kind, per the ownership convention documented on `Flusher`:
//! tool invocation history is this crate's own concern.

use std::sync::{Arc, Mutex as StdMutex};

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use skynet_queue::{EnvelopeKind, FlushOutcome, QueueConsumer, WriteEnvelope};

/// Initialise the `tool_calls` log table. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tool_calls (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            tool_call_id  TEXT NOT NULL,
            name          TEXT NOT NULL,
            is_error      INTEGER NOT NULL DEFAULT 0,
            duration_ms   INTEGER NOT NULL,
            logged_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tool_calls_name ON tool_calls (name, logged_at);",
    )
}

/// Payload for a queued `ToolCall` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedToolCall {
    pub tool_call_id: String,
    pub name: String,
    pub is_error: bool,
    pub duration_ms: u64,
}

/// Durable log of every tool invocation, for the `/tools` usage report and
/// for debugging which tool call produced a given result.
pub struct ToolCallLog {
    conn: Arc<StdMutex<Connection>>,
}

impl ToolCallLog {
    pub fn new(conn: Arc<StdMutex<Connection>>) -> Self {
        Self { conn }
    }

    pub fn record(&self, call: &QueuedToolCall) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tool_calls (tool_call_id, name, is_error, duration_ms, logged_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                call.tool_call_id,
                call.name,
                call.is_error as i64,
                call.duration_ms as i64,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Count of calls to `name` that ended in error, for the last `limit` logged.
    pub fn count_for_tool(&self, name: &str) -> rusqlite::Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM tool_calls WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
    }
}

/// Drains `ToolCall` envelopes into [`ToolCallLog::record`].
pub struct ToolCallConsumer {
    log: Arc<ToolCallLog>,
}

impl ToolCallConsumer {
    pub fn new(log: Arc<ToolCallLog>) -> Self {
        Self { log }
    }
}

#[async_trait::async_trait]
impl QueueConsumer for ToolCallConsumer {
    async fn apply_batch(&self, _kind: EnvelopeKind, batch: Vec<WriteEnvelope>) -> FlushOutcome {
        let mut succeeded = 0;
        let mut failed = Vec::new();
        for env in batch {
            match serde_json::from_value::<QueuedToolCall>(env.payload.clone()) {
                Ok(call) => match self.log.record(&call) {
                    Ok(()) => succeeded += 1,
                    Err(e) => {
                        tracing::warn!("queued tool-call write failed: {e}");
                        failed.push(env);
                    }
                },
                Err(e) => {
                    tracing::warn!("queued tool-call envelope is malformed, dropping: {e}");
                }
            }
        }
        FlushOutcome { succeeded, failed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_log() -> Arc<ToolCallLog> {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        Arc::new(ToolCallLog::new(Arc::new(StdMutex::new(conn))))
    }

    #[tokio::test]
    async fn consumer_records_queued_calls() {
        let log = open_log();
        let consumer = ToolCallConsumer::new(log.clone());

        let call = QueuedToolCall {
            tool_call_id: "t1".into(),
            name: "read_file".into(),
            is_error: false,
            duration_ms: 12,
        };
        let env = WriteEnvelope {
            id: 1,
            kind: EnvelopeKind::ToolCall,
            payload: serde_json::to_value(&call).unwrap(),
            enqueued_at: "now".into(),
            attempts: 0,
            retry_after: None,
        };

        let outcome = consumer.apply_batch(EnvelopeKind::ToolCall, vec![env]).await;
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(log.count_for_tool("read_file").unwrap(), 1);
    }
}
