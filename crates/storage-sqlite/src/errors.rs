//! Storage error types.

use sheetbridge_core::SyncError;
use thiserror::Error;

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("query error: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("data error: {0}")]
    Data(String),

    #[error("blocking task error: {0}")]
    Runtime(String),
}

impl StorageError {
    pub fn data(message: impl Into<String>) -> Self {
        Self::Data(message.into())
    }
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        SyncError::Database(err.to_string())
    }
}
