//! Job records and the views handed to callers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Started,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Started => "started",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Lifecycle registries kept per queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Registry {
    Enqueued,
    Started,
    Finished,
    Failed,
}

impl Registry {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Registry::Enqueued => "enqueued",
            Registry::Started => "started",
            Registry::Finished => "finished",
            Registry::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The job ran past its timeout (or its lease lapsed).
    Timeout,
    /// The worker reported an error.
    Error,
    /// Removed from the queue or abandoned on shutdown.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Stored form of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct JobRecord {
    pub id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub timeout_secs: u64,
    pub seq: u64,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub worker: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub failure: Option<JobFailure>,
}

#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Idempotency key; a fresh id is generated when absent.
    pub id: Option<String>,
    pub timeout: Duration,
}

impl EnqueueOptions {
    pub fn new(timeout: Duration) -> Self {
        Self { id: None, timeout }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
    pub queue: String,
    /// False when the id already existed and nothing was enqueued.
    pub created: bool,
}

/// A job leased to one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ReservedJob {
    pub id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    pub timeout: Duration,
    pub started_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}

impl ReservedJob {
    pub fn decode<T: DeserializeOwned>(&self) -> QueueResult<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| QueueError::Deserialize(format!("job {}: {e}", self.id)))
    }
}

/// Snapshot returned by `fetch`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub id: String,
    pub queue: String,
    pub status: JobStatus,
    pub payload: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub failure: Option<JobFailure>,
    /// Zero-based place in the queue while pending.
    pub position: Option<usize>,
    pub worker: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A started job whose lease lapsed and was failed by the reaper.
#[derive(Debug, Clone, PartialEq)]
pub struct ReapedJob {
    pub id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    pub worker: Option<String>,
    pub timeout: Duration,
    pub started_at: Option<DateTime<Utc>>,
    /// End of the lease (`started_at + timeout + grace`).
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub reaped_at: DateTime<Utc>,
}
