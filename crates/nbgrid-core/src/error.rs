//! Error taxonomy shared by every crate.
//!
//! Each crate keeps its own `thiserror` enum; `ErrorKind` is the coarse
//! classification callers branch on (retry, surface, or abort).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    ValidationFailed,
    ProviderError,
    QueueFull,
    QueueUnavailable,
    Timeout,
    IntegrityError,
    /// The embedded store failed an I/O or transaction step.
    Storage,
    Fatal,
}

impl ErrorKind {
    /// Transient kinds are retried by background loops on their next tick.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::ProviderError
                | ErrorKind::QueueFull
                | ErrorKind::QueueUnavailable
                | ErrorKind::Storage
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::ValidationFailed => "validation_failed",
            ErrorKind::ProviderError => "provider_error",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::QueueUnavailable => "queue_unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::IntegrityError => "integrity_error",
            ErrorKind::Storage => "storage",
            ErrorKind::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// A domain validation failure (malformed definition, bad name, ...).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
