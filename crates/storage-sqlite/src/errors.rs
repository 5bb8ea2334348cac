//! Storage error type and its conversion into the core `StoreError`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("writer task unavailable: {0}")]
    Writer(String),

    #[error("{0}")]
    Other(String),
}

impl StorageError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

impl From<StorageError> for fieldsync_core::StoreError {
    fn from(err: StorageError) -> Self {
        fieldsync_core::StoreError::new(err.to_string())
    }
}

impl From<StorageError> for fieldsync_core::SyncError {
    fn from(err: StorageError) -> Self {
        fieldsync_core::SyncError::Store(err.into())
    }
}
