use chrono::Utc;
use rusqlite::{params, Connection};
use skynet_core::money::Money;

use crate::error::{Result, UserError};
use crate::types::{BalanceOpKind, BalanceOperation};

/// Balance floor below which a request is blocked. Free commands (help,
/// settings, balance inquiries) bypass this check entirely.
pub const DEFAULT_FLOOR: Money = Money::ZERO;

/// Outcome of a pre-gate balance check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allowed,
    Denied { balance: Money, floor: Money },
}

/// Serializes every balance mutation through a single atomic read-then-write,
/// mirroring `PermissionChecker::record_token_usage`'s pattern for the daily
/// token counter. Each charge/topup both updates `users.balance_micros` and
/// appends an immutable `balance_operations` row in the same critical section
/// so the two can never drift apart.
pub struct BalanceGate;

impl BalanceGate {
    /// Pre-gate check: does this user have enough balance to proceed?
    ///
    /// Free commands bypass the check (`is_free_command = true`). On a
    /// database error the gate fails open — a transient DB hiccup should
    /// never itself block a user from talking to the agent.
    pub fn check(conn: &Connection, user_id: &str, floor: Money, is_free_command: bool) -> GateDecision {
        if is_free_command {
            return GateDecision::Allowed;
        }
        match Self::get_balance(conn, user_id) {
            Ok(balance) if balance >= floor => GateDecision::Allowed,
            Ok(balance) => GateDecision::Denied { balance, floor },
            Err(_) => GateDecision::Allowed,
        }
    }

    /// Read the current balance without locking a transaction.
    pub fn get_balance(conn: &Connection, user_id: &str) -> Result<Money> {
        let micros: i64 = conn
            .query_row(
                "SELECT balance_micros FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => UserError::NotFound(user_id.to_string()),
                other => UserError::DatabaseError(other),
            })?;
        Ok(Money::from_micros(micros))
    }

    /// Deduct `amount` (a positive cost) from the user's balance and record
    /// the operation. The balance is allowed to go negative — callers gate
    /// on that via `check()` *before* doing the work that incurs the cost,
    /// not after, since usage cost is only known once the call completes.
    pub fn charge(
        conn: &Connection,
        user_id: &str,
        amount: Money,
        description: &str,
        related_message: Option<i64>,
    ) -> Result<BalanceOperation> {
        Self::apply(conn, user_id, BalanceOpKind::Usage, Money::ZERO - amount, description, related_message)
    }

    /// Record an externally-settled payment (e.g. via a payment provider
    /// webhook) that increases the balance.
    pub fn topup(
        conn: &Connection,
        user_id: &str,
        amount: Money,
        description: &str,
    ) -> Result<BalanceOperation> {
        Self::apply(conn, user_id, BalanceOpKind::Payment, amount, description, None)
    }

    /// Refund a prior charge, tied back to the original message for audit.
    pub fn refund(
        conn: &Connection,
        user_id: &str,
        amount: Money,
        description: &str,
        related_message: Option<i64>,
    ) -> Result<BalanceOperation> {
        Self::apply(conn, user_id, BalanceOpKind::Refund, amount, description, related_message)
    }

    /// Manual admin-granted credit, outside the normal payment flow.
    pub fn admin_topup(
        conn: &Connection,
        user_id: &str,
        amount: Money,
        description: &str,
    ) -> Result<BalanceOperation> {
        Self::apply(conn, user_id, BalanceOpKind::AdminTopup, amount, description, None)
    }

    /// List operations for a user, most recent first.
    pub fn list_operations(conn: &Connection, user_id: &str, limit: usize) -> Result<Vec<BalanceOperation>> {
        let mut stmt = conn.prepare(
            "SELECT id, user_id, kind, amount_micros, before_micros, after_micros,
                    related_message, description, created_at
             FROM balance_operations
             WHERE user_id = ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], row_to_operation)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Sum of every recorded operation's signed amount for a user. Used by
    /// tests to verify the amount ledger matches the live balance column.
    pub fn sum_operations(conn: &Connection, user_id: &str) -> Result<Money> {
        let micros: Option<i64> = conn.query_row(
            "SELECT SUM(amount_micros) FROM balance_operations WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(Money::from_micros(micros.unwrap_or(0)))
    }

    fn apply(
        conn: &Connection,
        user_id: &str,
        kind: BalanceOpKind,
        signed_amount: Money,
        description: &str,
        related_message: Option<i64>,
    ) -> Result<BalanceOperation> {
        let before = Self::get_balance(conn, user_id)?;
        let after = before + signed_amount;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "UPDATE users SET balance_micros = ?2, updated_at = ?3 WHERE id = ?1",
            params![user_id, after.micros(), now],
        )?;
        conn.execute(
            "INSERT INTO balance_operations
                (user_id, kind, amount_micros, before_micros, after_micros,
                 related_message, description, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                user_id,
                kind.to_string(),
                signed_amount.micros(),
                before.micros(),
                after.micros(),
                related_message,
                description,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();

        Ok(BalanceOperation {
            id,
            user_id: user_id.to_string(),
            kind,
            amount: signed_amount,
            before,
            after,
            related_message,
            description: description.to_string(),
            created_at: now,
        })
    }
}

fn row_to_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<BalanceOperation> {
    use std::str::FromStr;
    let kind_str: String = row.get(2)?;
    Ok(BalanceOperation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: BalanceOpKind::from_str(&kind_str).unwrap_or(BalanceOpKind::Usage),
        amount: Money::from_micros(row.get(3)?),
        before: Money::from_micros(row.get(4)?),
        after: Money::from_micros(row.get(5)?),
        related_message: row.get(6)?,
        description: row.get(7)?,
        created_at: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::create_user;
    use skynet_core::types::UserRole;

    fn open_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        conn
    }

    #[test]
    fn charge_then_topup_sums_to_balance() {
        let conn = open_db();
        let user = create_user(&conn, "alice", UserRole::User).unwrap();

        BalanceGate::topup(&conn, &user.id, Money::from_units(10.0), "card payment").unwrap();
        BalanceGate::charge(&conn, &user.id, Money::from_units(2.5), "llm usage", Some(1)).unwrap();
        BalanceGate::charge(&conn, &user.id, Money::from_units(1.0), "llm usage", Some(2)).unwrap();

        let balance = BalanceGate::get_balance(&conn, &user.id).unwrap();
        assert_eq!(balance, Money::from_units(6.5));
        assert_eq!(BalanceGate::sum_operations(&conn, &user.id).unwrap(), balance);
    }

    #[test]
    fn gate_denies_below_floor() {
        let conn = open_db();
        let user = create_user(&conn, "bob", UserRole::User).unwrap();
        BalanceGate::charge(&conn, &user.id, Money::from_units(1.0), "usage", None).unwrap();

        let decision = BalanceGate::check(&conn, &user.id, Money::ZERO, false);
        assert_eq!(
            decision,
            GateDecision::Denied {
                balance: Money::from_units(-1.0),
                floor: Money::ZERO,
            }
        );
    }

    #[test]
    fn free_command_bypasses_gate_even_at_negative_balance() {
        let conn = open_db();
        let user = create_user(&conn, "carol", UserRole::User).unwrap();
        BalanceGate::charge(&conn, &user.id, Money::from_units(50.0), "usage", None).unwrap();

        assert_eq!(
            BalanceGate::check(&conn, &user.id, Money::ZERO, true),
            GateDecision::Allowed
        );
    }

    #[test]
    fn gate_fails_open_for_unknown_user() {
        let conn = open_db();
        assert_eq!(
            BalanceGate::check(&conn, "ghost", Money::ZERO, false),
            GateDecision::Allowed
        );
    }

    #[test]
    fn list_operations_orders_most_recent_first() {
        let conn = open_db();
        let user = create_user(&conn, "dave", UserRole::User).unwrap();
        BalanceGate::topup(&conn, &user.id, Money::from_units(5.0), "first").unwrap();
        BalanceGate::admin_topup(&conn, &user.id, Money::from_units(1.0), "second").unwrap();

        let ops = BalanceGate::list_operations(&conn, &user.id, 10).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].description, "second");
        assert_eq!(ops[1].description, "first");
    }
}
