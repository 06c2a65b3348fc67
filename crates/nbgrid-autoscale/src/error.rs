//! Controller error types.

use std::time::Duration;

use nbgrid_cluster::{ClusterError, ProviderError};
use nbgrid_core::ErrorKind;
use nbgrid_queue::QueueError;
use nbgrid_state::StateError;
use thiserror::Error;

pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("provider call failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("registry error: {0}")]
    State(#[from] StateError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("tick exceeded its {0:?} deadline")]
    Deadline(Duration),

    #[error("provider pool unavailable: {0}")]
    Pool(String),
}

impl ControllerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControllerError::Cluster(e) => e.kind(),
            ControllerError::Provider(e) => e.kind(),
            ControllerError::State(e) => e.kind(),
            ControllerError::Queue(e) => e.kind(),
            ControllerError::Deadline(_) => ErrorKind::Timeout,
            ControllerError::Pool(_) => ErrorKind::ProviderError,
        }
    }
}
