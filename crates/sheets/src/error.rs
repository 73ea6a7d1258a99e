//! Error types for the spreadsheet API client.

use sheetbridge_core::{RetryClass, SyncError};
use thiserror::Error;

/// Result type alias for spreadsheet operations.
pub type Result<T> = std::result::Result<T, SheetsError>;

/// Errors that can occur while talking to the spreadsheet API.
#[derive(Debug, Error)]
pub enum SheetsError {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API error response from the spreadsheet service
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Invalid request (bad range, malformed header, etc.)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl SheetsError {
    /// Create an API error from status and message.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Create an invalid request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// HTTP status if this is an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Http(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Classify for retry policy: transport errors, 408/429 and 5xx are
    /// retryable, everything else is permanent.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Api { status, .. } => match *status {
                408 | 429 => RetryClass::Retryable,
                500..=599 => RetryClass::Retryable,
                _ => RetryClass::Permanent,
            },
            Self::Http(_) => RetryClass::Retryable,
            Self::Json(_) => RetryClass::Permanent,
            Self::InvalidRequest(_) => RetryClass::Permanent,
        }
    }
}

impl From<SheetsError> for SyncError {
    fn from(err: SheetsError) -> Self {
        match err {
            SheetsError::Api { status, message } => SyncError::Api { status, message },
            SheetsError::Http(inner) => SyncError::Transport(inner.to_string()),
            SheetsError::Json(inner) => SyncError::Json(inner),
            SheetsError::InvalidRequest(message) => SyncError::Config(message),
        }
    }
}
