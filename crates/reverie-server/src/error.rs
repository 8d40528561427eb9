// crates/reverie-server/src/error.rs
// Standardized error types for Reverie

use crate::embeddings::ProviderError;
use reverie_types::ChatId;
use thiserror::Error;

/// Main error type for the Reverie library
#[derive(Error, Debug)]
pub enum ReverieError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("embedding provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("vector index unavailable for chat {chat_id}: {reason}")]
    IndexUnavailable { chat_id: ChatId, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("consistency violation in chat {chat_id}: {detail}")]
    ConsistencyViolation { chat_id: ChatId, detail: String },

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("message store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("task cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown error: {0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using ReverieError
pub type Result<T> = std::result::Result<T, ReverieError>;

impl ReverieError {
    pub fn index_unavailable(chat_id: ChatId, reason: impl Into<String>) -> Self {
        ReverieError::IndexUnavailable {
            chat_id,
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation later could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ReverieError::Provider(e) => e.is_retryable(),
            ReverieError::Timeout(_) | ReverieError::StoreUnavailable(_) => true,
            ReverieError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Convert to user-facing string for CLI boundaries
    pub fn to_user_string(&self) -> String {
        self.to_string()
    }
}

impl From<String> for ReverieError {
    fn from(s: String) -> Self {
        ReverieError::Other(s)
    }
}

impl From<tokio::task::JoinError> for ReverieError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            ReverieError::Cancelled
        } else {
            ReverieError::Other(err.to_string())
        }
    }
}

impl From<ReverieError> for String {
    fn from(err: ReverieError) -> Self {
        err.to_string()
    }
}
