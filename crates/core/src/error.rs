//! Error taxonomy for the sync core.
//!
//! Mirrors the retry classification used throughout the cloud sync client:
//! every failure is either retryable, permanent, or requires re-auth, and
//! that classification — not the raw status code — is what callers branch
//! on.

use thiserror::Error;

/// Result type alias used across the sync core.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Retry policy classification for a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

/// Classify an HTTP status code into a retry policy.
pub fn classify_http_status(status: u16) -> RetryClass {
    match status {
        401 | 403 => RetryClass::ReauthRequired,
        408 | 409 | 423 | 425 | 429 => RetryClass::Retryable,
        500..=599 => RetryClass::Retryable,
        _ => RetryClass::Permanent,
    }
}

/// Errors surfaced by a `NetworkPort` implementation.
#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("http error ({status}): {message}")]
    Http { status: u16, message: String },

    #[error("offline")]
    Offline,
}

impl NetworkError {
    pub fn retry_class(&self) -> RetryClass {
        match self {
            NetworkError::Http { status, .. } => classify_http_status(*status),
            NetworkError::Transport(_) => RetryClass::Retryable,
            NetworkError::Offline => RetryClass::Retryable,
        }
    }
}

/// Errors surfaced by a durable-store port implementation.
#[derive(Debug, Clone, Error)]
#[error("durable store error: {0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Top-level error returned by the engine, mutation queue, and scheduler.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// `baseUrl`/`authToken`/`technicianId` not all set (§4.4.1).
    #[error("sync engine is not configured")]
    NotConfigured,

    /// `syncEntity(name)` called for a name absent from the registry (§4.1).
    #[error("entity '{0}' is not registered")]
    EntityNotRegistered(String),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid payload for entity '{entity}': {message}")]
    InvalidPayload { entity: String, message: String },

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    pub fn retry_class(&self) -> RetryClass {
        match self {
            SyncError::NotConfigured => RetryClass::Permanent,
            SyncError::EntityNotRegistered(_) => RetryClass::Permanent,
            SyncError::Network(err) => err.retry_class(),
            SyncError::Store(_) => RetryClass::Retryable,
            SyncError::InvalidPayload { .. } => RetryClass::Permanent,
            SyncError::Other(_) => RetryClass::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_http_status_for_retry_policy() {
        assert_eq!(classify_http_status(500), RetryClass::Retryable);
        assert_eq!(classify_http_status(429), RetryClass::Retryable);
        assert_eq!(classify_http_status(401), RetryClass::ReauthRequired);
        assert_eq!(classify_http_status(400), RetryClass::Permanent);
    }

    #[test]
    fn network_offline_is_retryable() {
        assert_eq!(NetworkError::Offline.retry_class(), RetryClass::Retryable);
    }
}
