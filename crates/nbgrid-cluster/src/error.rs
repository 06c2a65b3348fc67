//! Error types for the cluster model and machine providers.

use nbgrid_core::ErrorKind;
use nbgrid_state::StateError;
use thiserror::Error;

/// Result type alias for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Result type alias for provider calls.
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse {what}: {reason}")]
    Parse { what: String, reason: String },

    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl ClusterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClusterError::Read { .. } | ClusterError::Parse { .. } | ClusterError::Validation(_) => {
                ErrorKind::ValidationFailed
            }
            ClusterError::NotFound(_) => ErrorKind::NotFound,
            ClusterError::State(e) => e.kind(),
            ClusterError::Provider(e) => e.kind(),
        }
    }
}

/// Failures reported by a machine backend.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The backend refused the request or was unreachable.
    #[error("provider api error: {0}")]
    Api(String),

    /// A machine with this name exists with different labels.
    #[error("machine name in use: {0}")]
    NameInUse(String),

    #[error("provider i/o error: {0}")]
    Io(String),

    #[error("provider not configured: {0}")]
    Config(String),

    #[error("unknown provider: {0}")]
    Unknown(String),
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::NameInUse(_) => ErrorKind::AlreadyExists,
            ProviderError::Config(_) | ProviderError::Unknown(_) => ErrorKind::ValidationFailed,
            ProviderError::Api(_) | ProviderError::Io(_) => ErrorKind::ProviderError,
        }
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(e: std::io::Error) -> Self {
        ProviderError::Io(e.to_string())
    }
}
