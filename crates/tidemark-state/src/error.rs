//! Error types for the Tidemark state store.

use thiserror::Error;

use tidemark_core::CoreError;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Invalid(#[from] CoreError),
}

impl StateError {
    /// Rejected because of caller-supplied configuration rather than storage.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            StateError::NotFound(_)
                | StateError::AlreadyExists(_)
                | StateError::Config(_)
                | StateError::Invalid(_)
        )
    }
}
