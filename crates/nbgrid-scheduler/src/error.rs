//! Scheduler error types.

use nbgrid_core::ErrorKind;
use nbgrid_core::error::ValidationError;
use nbgrid_queue::QueueError;
use nbgrid_state::StateError;
use thiserror::Error;

/// Errors raised by the scheduler, dispatcher and janitor.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid workflow: {0}")]
    Validation(#[from] ValidationError),

    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("runtime not found: {0}")]
    RuntimeNotFound(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::Validation(_) | SchedulerError::InvalidCron { .. } => {
                ErrorKind::ValidationFailed
            }
            SchedulerError::ProjectNotFound(_)
            | SchedulerError::WorkflowNotFound(_)
            | SchedulerError::RuntimeNotFound(_) => ErrorKind::NotFound,
            SchedulerError::State(e) => e.kind(),
            SchedulerError::Queue(e) => e.kind(),
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
