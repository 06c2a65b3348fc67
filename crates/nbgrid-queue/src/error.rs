//! Error types for the queue broker.

use nbgrid_core::ErrorKind;
use thiserror::Error;

/// Result type alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("queue {queue} is full ({depth} pending)")]
    Full { queue: String, depth: u64 },

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {id} is not leased by {worker}")]
    NotLeaseHolder { id: String, worker: String },

    #[error("job {id} is {status}")]
    InvalidState { id: String, status: String },
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Storage(_) => ErrorKind::QueueUnavailable,
            QueueError::Full { .. } => ErrorKind::QueueFull,
            QueueError::NotFound(_) => ErrorKind::NotFound,
            QueueError::Serialize(_) => ErrorKind::ValidationFailed,
            QueueError::Deserialize(_)
            | QueueError::NotLeaseHolder { .. }
            | QueueError::InvalidState { .. } => ErrorKind::IntegrityError,
        }
    }
}

impl From<nbgrid_state::StateError> for QueueError {
    fn from(e: nbgrid_state::StateError) -> Self {
        QueueError::Storage(e.to_string())
    }
}
