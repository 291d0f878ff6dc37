use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::warn;

use crate::db::init_db;
use crate::error::Result;
use crate::types::{EnvelopeKind, WriteEnvelope};

/// Durable FIFO backing the write-behind queue.
///
/// Realizes the same push/pop/retry contract a Redis list + per-item retry
/// metadata would give you, as a SQLite table instead — this workspace has
/// no Redis dependency anywhere, and a single `Mutex<Connection>` is the
/// idiom every other manager in this codebase already uses for shared
/// SQLite state.
pub struct QueueStore {
    conn: Arc<Mutex<Connection>>,
}

impl QueueStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Push a new write onto the back of the queue.
    pub fn push(&self, kind: EnvelopeKind, payload: serde_json::Value) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO write_queue (kind, payload, enqueued_at, attempts, retry_after)
             VALUES (?1, ?2, ?3, 0, NULL)",
            params![
                kind.as_str(),
                serde_json::to_string(&payload)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Current queue depth (all rows, including ones waiting out a retry delay).
    pub fn depth(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM write_queue", [], |r| r.get(0))?;
        Ok(n as u64)
    }

    /// Pop up to `batch_size` envelopes that are ready for processing (no
    /// `retry_after` in the future), oldest first, and delete them from the
    /// table. Callers that fail to apply an envelope must re-push it via
    /// `requeue_with_backoff` — a popped-but-unprocessed envelope is gone.
    pub fn pop_batch(&self, batch_size: usize) -> Result<Vec<WriteEnvelope>> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();

        let rows: Vec<WriteEnvelope> = {
            let mut stmt = conn.prepare(
                "SELECT id, kind, payload, enqueued_at, attempts, retry_after
                 FROM write_queue
                 WHERE retry_after IS NULL OR retry_after <= ?1
                 ORDER BY id ASC
                 LIMIT ?2",
            )?;
            let out = stmt
                .query_map(params![now, batch_size as i64], |row| {
                    let kind_str: String = row.get(1)?;
                    let payload_str: String = row.get(2)?;
                    Ok((
                        row.get::<_, i64>(0)?,
                        kind_str,
                        payload_str,
                        row.get::<_, String>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                })?
                .filter_map(|r| r.ok())
                .filter_map(|(id, kind_str, payload_str, enqueued_at, attempts, retry_after)| {
                    let kind = EnvelopeKind::parse(&kind_str)?;
                    let payload = serde_json::from_str(&payload_str).ok()?;
                    Some(WriteEnvelope {
                        id,
                        kind,
                        payload,
                        enqueued_at,
                        attempts,
                        retry_after,
                    })
                })
                .collect();
            out
        };

        if rows.is_empty() {
            return Ok(rows);
        }

        let ids: Vec<i64> = rows.iter().map(|e| e.id).collect();
        let placeholders: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        conn.execute(
            &format!(
                "DELETE FROM write_queue WHERE id IN ({})",
                placeholders.join(",")
            ),
            [],
        )?;

        Ok(rows)
    }

    /// Re-insert an envelope that failed processing, bumping `attempts` and
    /// computing `retry_after = now + base^attempts` seconds. Returns `false`
    /// (and drops the envelope) once `attempts` exceeds `max_attempts`.
    pub fn requeue_with_backoff(
        &self,
        mut envelope: WriteEnvelope,
        max_attempts: u32,
        backoff_base_secs: u64,
    ) -> Result<bool> {
        envelope.attempts += 1;
        if envelope.attempts > max_attempts {
            warn!(
                id = envelope.id,
                kind = envelope.kind.as_str(),
                attempts = envelope.attempts,
                "write envelope discarded after exceeding max retry attempts"
            );
            return Ok(false);
        }

        let delay_secs = backoff_base_secs.saturating_pow(envelope.attempts);
        let retry_after = Utc::now() + chrono::Duration::seconds(delay_secs as i64);

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO write_queue (kind, payload, enqueued_at, attempts, retry_after)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                envelope.kind.as_str(),
                serde_json::to_string(&envelope.payload)?,
                envelope.enqueued_at,
                envelope.attempts,
                retry_after.to_rfc3339(),
            ],
        )?;
        Ok(true)
    }
}
