use skynet_core::money::Money;
use thiserror::Error;

/// All user-layer errors. Kept separate from SkynetError so the gateway
/// can map them to appropriate WS response codes without coupling layers.
#[derive(Debug, Error)]
pub enum UserError {
    #[error("User not found: {0}")]
    NotFound(String),

    #[error("User already exists: {0}")]
    AlreadyExists(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Invalid role: {0}")]
    InvalidRole(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Raised when daily token quota is exceeded — caller decides whether to
    /// hard-block or queue the request for admin approval.
    #[error("Budget exceeded: used {used}, limit {limit}")]
    BudgetExceeded { used: u64, limit: u64 },

    /// Raised by the balance gate when a charge would take the balance below
    /// its floor. Callers decide whether to fail the request or fail open.
    #[error("Balance exceeded: required {required}, available {available}")]
    BalanceExceeded { required: Money, available: Money },
}

pub type Result<T> = std::result::Result<T, UserError>;
