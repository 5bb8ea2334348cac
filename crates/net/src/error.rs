//! Transport error type and its conversion into the core `NetworkError`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NetError>;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
}

impl NetError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

}

impl From<NetError> for fieldsync_core::NetworkError {
    fn from(err: NetError) -> Self {
        match err {
            NetError::Http(e) => fieldsync_core::NetworkError::Transport(e.to_string()),
            NetError::Json(e) => fieldsync_core::NetworkError::Transport(e.to_string()),
            NetError::Api { status, message } => fieldsync_core::NetworkError::Http { status, message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_carries_status_and_message() {
        let err = NetError::api(429, "too many requests");
        match err {
            NetError::Api { status, message } => {
                assert_eq!(status, 429);
                assert_eq!(message, "too many requests");
            }
            _ => panic!("expected Api variant"),
        }
    }
}
