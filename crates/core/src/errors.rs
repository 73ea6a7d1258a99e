//! Error types shared by the sync engine and its adapters.

use thiserror::Error;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Retry policy class for failed operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Retryable,
    Permanent,
}

/// Errors that can occur while running a sync cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Remote API rejected the call with an HTTP status.
    #[error("remote API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Transport-level failure talking to the remote API.
    #[error("transport error: {0}")]
    Transport(String),

    /// Target database failure (pool, connection, statement).
    #[error("database error: {0}")]
    Database(String),

    /// Invalid or inconsistent sync configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Column mapping refers to data that does not exist.
    #[error("mapping error: {0}")]
    Mapping(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Create a remote API error from status and message.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a mapping error.
    pub fn mapping(message: impl Into<String>) -> Self {
        Self::Mapping(message.into())
    }

    /// HTTP status if this is a remote API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify the error for retry policy.
    ///
    /// Transient remote failures (network, 408/429, 5xx) and infrastructure
    /// failures (pool exhaustion, broken connections) are retryable; every
    /// other 4xx and all local data problems are permanent.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Api { status, .. } => match *status {
                408 | 429 => RetryClass::Retryable,
                500..=599 => RetryClass::Retryable,
                _ => RetryClass::Permanent,
            },
            Self::Transport(_) => RetryClass::Retryable,
            Self::Database(_) => RetryClass::Retryable,
            Self::Config(_) => RetryClass::Permanent,
            Self::Mapping(_) => RetryClass::Permanent,
            Self::Json(_) => RetryClass::Permanent,
        }
    }

    /// Whether a retry wrapper should attempt this error again.
    pub fn is_retryable(&self) -> bool {
        self.retry_class() == RetryClass::Retryable
    }
}
