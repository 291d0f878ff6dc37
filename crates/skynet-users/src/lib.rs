pub mod balance;
pub mod db;
pub mod error;
pub mod identity;
pub mod permissions;
pub mod queue_consumer;
pub mod resolver;
pub mod types;

pub use balance::{BalanceGate, GateDecision};
pub use error::UserError;
pub use permissions::{Permission, PermissionCheck, PermissionChecker};
pub use queue_consumer::{BalanceReceiptConsumer, QueuedBalanceReceipt, QueuedUserStats, UserStatsConsumer};
pub use resolver::{ResolvedUser, UserResolver};
pub use types::{BalanceOpKind, BalanceOperation, ContentFilter, User, UserIdentity};
