//! Agent error types.

use nbgrid_core::ErrorKind;
use nbgrid_queue::QueueError;
use nbgrid_state::StateError;
use thiserror::Error;

pub type AgentResult<T> = Result<T, AgentError>;

/// Errors raised by workers and the heartbeat reporter.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid agent configuration: {0}")]
    Config(String),

    #[error("execution record missing: {0}")]
    MissingExecution(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Config(_) => ErrorKind::Fatal,
            AgentError::MissingExecution(_) => ErrorKind::NotFound,
            AgentError::State(e) => e.kind(),
            AgentError::Queue(e) => e.kind(),
        }
    }
}

/// Failure reported by a notebook executor. Recorded on the execution as
/// an `executor` error.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("executor i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("notebook exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("{0}")]
    Other(String),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
