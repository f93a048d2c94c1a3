//! Error types for lifecycle stages.

use thiserror::Error;

use tidemark_client::ClientError;
use tidemark_core::{CoreError, NameError};
use tidemark_state::StateError;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("cluster call failed: {0}")]
    Client(#[from] ClientError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Name(#[from] NameError),

    #[error("table {0} has no index on its cluster")]
    NoIndex(String),

    #[error("index {0} is not ready")]
    NotReady(String),

    #[error("table {0} not found")]
    TableNotFound(String),

    #[error("routing publish failed: {0}")]
    Routing(String),
}

impl LifecycleError {
    /// Worth another attempt on the next cycle without operator action.
    pub fn is_transient(&self) -> bool {
        match self {
            LifecycleError::Client(e) => e.is_transient(),
            LifecycleError::NotReady(_) => true,
            _ => false,
        }
    }

    /// Introduced by table or cluster configuration.
    pub fn is_configuration(&self) -> bool {
        match self {
            LifecycleError::State(e) => e.is_configuration(),
            LifecycleError::Core(_) | LifecycleError::TableNotFound(_) => true,
            _ => false,
        }
    }
}
