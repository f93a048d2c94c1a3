//! Error types for cluster calls.

use std::time::Duration;

use thiserror::Error;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("connection to {address} failed: {message}")]
    Connect { address: String, message: String },

    #[error("tls error: {0}")]
    Tls(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("http error: {0}")]
    Http(String),

    #[error("{method} {path} returned {status}: {body}")]
    Status {
        method: String,
        path: String,
        status: u16,
        body: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    Request(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    /// Worth retrying: network trouble, timeouts, throttling and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Connect { .. }
            | ClientError::Timeout(_)
            | ClientError::Http(_)
            | ClientError::Unavailable(_) => true,
            ClientError::Status { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
