use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("memory not found: {category}/{key}")]
    NotFound { category: String, key: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("thread not found: {key}")]
    ThreadNotFound { key: String },

    #[error("invalid thread key: {0}")]
    InvalidKey(String),
}

impl From<serde_json::Error> for MemoryError {
    fn from(e: serde_json::Error) -> Self {
        MemoryError::Serialization(e.to_string())
    }
}
