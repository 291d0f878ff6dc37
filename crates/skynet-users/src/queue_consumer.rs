//! [`skynet_queue::QueueConsumer`] implementations for the envelope kinds
//! this crate owns: `UserStats` and `BalanceOp`, per the ownership
//! convention documented on `Flusher`.
//!
//! `BalanceGate::charge`/`topup` stay synchronous calls in the request path
//! — the live balance and its ledger must never disagree, so that write
//! can't be deferred. `BalanceOp` envelopes carry a receipt of an
//! already-committed operation for `balance_receipts`, not the mutation
//! itself.

use std::sync::{Arc, Mutex as StdMutex};

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use skynet_queue::{EnvelopeKind, FlushOutcome, QueueConsumer, WriteEnvelope};

use crate::permissions::{PermissionCheck, PermissionChecker};

/// Payload for a queued `UserStats` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedUserStats {
    pub user_id: String,
    pub tokens: u64,
}

/// Drains `UserStats` envelopes into [`PermissionChecker::record_token_usage`].
pub struct UserStatsConsumer {
    conn: Arc<StdMutex<Connection>>,
}

impl UserStatsConsumer {
    pub fn new(conn: Arc<StdMutex<Connection>>) -> Self {
        Self { conn }
    }
}

#[async_trait::async_trait]
impl QueueConsumer for UserStatsConsumer {
    async fn apply_batch(&self, _kind: EnvelopeKind, batch: Vec<WriteEnvelope>) -> FlushOutcome {
        let mut succeeded = 0;
        let mut failed = Vec::new();
        let conn = self.conn.lock().unwrap();
        for env in batch {
            match serde_json::from_value::<QueuedUserStats>(env.payload.clone()) {
                Ok(stats) => {
                    match PermissionChecker::record_token_usage(&conn, &stats.user_id, stats.tokens) {
                        Ok(PermissionCheck::BudgetExceeded { used, limit }) => {
                            tracing::warn!(
                                user_id = %stats.user_id,
                                used,
                                limit,
                                "daily token budget exceeded"
                            );
                            succeeded += 1;
                        }
                        Ok(_) => succeeded += 1,
                        Err(e) => {
                            tracing::warn!("queued user-stats write failed: {e}");
                            failed.push(env);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("queued user-stats envelope is malformed, dropping: {e}");
                }
            }
        }
        FlushOutcome { succeeded, failed }
    }
}

/// Payload for a queued `BalanceOp` envelope — a receipt of an operation
/// [`crate::balance::BalanceGate`] already committed synchronously.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedBalanceReceipt {
    pub user_id: String,
    pub kind: String,
    pub amount_micros: i64,
    pub related_message: Option<i64>,
    pub description: String,
}

/// Drains `BalanceOp` envelopes into the `balance_receipts` audit table.
pub struct BalanceReceiptConsumer {
    conn: Arc<StdMutex<Connection>>,
}

impl BalanceReceiptConsumer {
    pub fn new(conn: Arc<StdMutex<Connection>>) -> Self {
        Self { conn }
    }
}

#[async_trait::async_trait]
impl QueueConsumer for BalanceReceiptConsumer {
    async fn apply_batch(&self, _kind: EnvelopeKind, batch: Vec<WriteEnvelope>) -> FlushOutcome {
        let mut succeeded = 0;
        let mut failed = Vec::new();
        let conn = self.conn.lock().unwrap();
        for env in batch {
            match serde_json::from_value::<QueuedBalanceReceipt>(env.payload.clone()) {
                Ok(receipt) => {
                    let result = conn.execute(
                        "INSERT INTO balance_receipts
                            (user_id, kind, amount_micros, related_message, description, received_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            receipt.user_id,
                            receipt.kind,
                            receipt.amount_micros,
                            receipt.related_message,
                            receipt.description,
                            chrono::Utc::now().to_rfc3339(),
                        ],
                    );
                    match result {
                        Ok(_) => succeeded += 1,
                        Err(e) => {
                            tracing::warn!("queued balance receipt write failed: {e}");
                            failed.push(env);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("queued balance-op envelope is malformed, dropping: {e}");
                }
            }
        }
        FlushOutcome { succeeded, failed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::create_user;
    use skynet_core::types::UserRole;

    fn open_conn() -> Arc<StdMutex<Connection>> {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        Arc::new(StdMutex::new(conn))
    }

    #[tokio::test]
    async fn user_stats_consumer_updates_daily_counter() {
        let conn = open_conn();
        let user_id = {
            let guard = conn.lock().unwrap();
            create_user(&guard, "alice", UserRole::User).unwrap().id
        };
        let consumer = UserStatsConsumer::new(conn.clone());

        let stats = QueuedUserStats { user_id: user_id.clone(), tokens: 250 };
        let env = WriteEnvelope {
            id: 1,
            kind: EnvelopeKind::UserStats,
            payload: serde_json::to_value(&stats).unwrap(),
            enqueued_at: "now".into(),
            attempts: 0,
            retry_after: None,
        };

        let outcome = consumer.apply_batch(EnvelopeKind::UserStats, vec![env]).await;
        assert_eq!(outcome.succeeded, 1);

        let guard = conn.lock().unwrap();
        let used: i64 = guard
            .query_row("SELECT tokens_used_today FROM users WHERE id = ?1", params![user_id], |r| r.get(0))
            .unwrap();
        assert_eq!(used, 250);
    }

    #[tokio::test]
    async fn balance_receipt_consumer_records_entry() {
        let conn = open_conn();
        let user_id = {
            let guard = conn.lock().unwrap();
            create_user(&guard, "bob", UserRole::User).unwrap().id
        };
        let consumer = BalanceReceiptConsumer::new(conn.clone());

        let receipt = QueuedBalanceReceipt {
            user_id: user_id.clone(),
            kind: "usage".into(),
            amount_micros: -1_000_000,
            related_message: Some(42),
            description: "llm usage".into(),
        };
        let env = WriteEnvelope {
            id: 1,
            kind: EnvelopeKind::BalanceOp,
            payload: serde_json::to_value(&receipt).unwrap(),
            enqueued_at: "now".into(),
            attempts: 0,
            retry_after: None,
        };

        let outcome = consumer.apply_batch(EnvelopeKind::BalanceOp, vec![env]).await;
        assert_eq!(outcome.succeeded, 1);

        let guard = conn.lock().unwrap();
        let count: i64 = guard
            .query_row("SELECT COUNT(*) FROM balance_receipts WHERE user_id = ?1", params![user_id], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
