//! Domain types persisted by nbgrid.
//!
//! Projects own workflows and runtimes; workflows produce executions. The
//! graph is modelled with ids only: nothing here holds a reference to its
//! owner, lookups go through the state store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// 16-char opaque workflow identifier.
pub type WorkflowId = String;

/// 16-char opaque execution identifier; also the id of its queue jobs.
pub type ExecutionId = String;

/// 10-char opaque project identifier.
pub type ProjectId = String;

/// `<project_id>/<name>/<version>`.
pub type RuntimeId = String;

/// Notebook parameters: string keys mapped to JSON scalars.
pub type Params = BTreeMap<String, serde_json::Value>;

// ── Schedule ───────────────────────────────────────────────────────

/// When a workflow fires. Exactly one kind per workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Only runs through `enqueue_now`.
    #[default]
    None,
    /// Standard 5-field cron expression evaluated in UTC.
    Cron {
        expr: String,
        #[serde(default)]
        repeat: Option<u32>,
    },
    /// Fixed wall-clock spacing after an initial delay.
    Interval {
        every_seconds: u64,
        #[serde(default)]
        repeat: Option<u32>,
        #[serde(default)]
        start_delay_min: u32,
    },
}

impl ScheduleSpec {
    pub fn is_scheduled(&self) -> bool {
        !matches!(self, ScheduleSpec::None)
    }

    /// Maximum number of fires, `None` meaning unbounded.
    pub fn repeat(&self) -> Option<u32> {
        match self {
            ScheduleSpec::None => Some(0),
            ScheduleSpec::Cron { repeat, .. } | ScheduleSpec::Interval { repeat, .. } => *repeat,
        }
    }
}

// ── Workflow ───────────────────────────────────────────────────────

/// Points a workflow at a built runtime; latest version when unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeRef {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// User-supplied workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDef {
    /// Notebook file name, without directories.
    pub nb_name: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub schedule: ScheduleSpec,
    /// Target queue the run job is enqueued on.
    pub queue: String,
    pub timeout_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Human name, unique within the project.
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub runtime: Option<RuntimeRef>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl WorkflowDef {
    /// Structural validation. Cron syntax is checked by the scheduler.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.nb_name.trim().is_empty() {
            return Err(ValidationError::new("nb_name", "must not be empty"));
        }
        if self.nb_name.contains('/') || self.nb_name.contains("..") {
            return Err(ValidationError::new("nb_name", "must be a plain file name"));
        }
        if self.queue.trim().is_empty() {
            return Err(ValidationError::new("queue", "must not be empty"));
        }
        if self.timeout_secs == 0 {
            return Err(ValidationError::new("timeout_secs", "must be positive"));
        }
        for (key, value) in &self.params {
            if key.is_empty() {
                return Err(ValidationError::new("params", "empty parameter name"));
            }
            if value.is_array() || value.is_object() {
                return Err(ValidationError::new(
                    format!("params.{key}"),
                    "parameter values must be JSON scalars",
                ));
            }
        }
        match &self.schedule {
            ScheduleSpec::None => {}
            ScheduleSpec::Cron { expr, .. } => {
                if expr.trim().is_empty() {
                    return Err(ValidationError::new("schedule.expr", "must not be empty"));
                }
            }
            ScheduleSpec::Interval { every_seconds, .. } => {
                if *every_seconds == 0 {
                    return Err(ValidationError::new(
                        "schedule.every_seconds",
                        "must be positive",
                    ));
                }
            }
        }
        if let Some(alias) = &self.alias
            && (alias.is_empty()
                || !alias
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        {
            return Err(ValidationError::new(
                "alias",
                "only letters, digits, '_', '-' and '.' are allowed",
            ));
        }
        Ok(())
    }
}

/// Lifecycle state of a stored workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Enabled,
    Disabled,
    Deleted,
}

/// A workflow definition as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub workflow_id: WorkflowId,
    pub project_id: ProjectId,
    pub def: WorkflowDef,
    /// Bumped on every write; used for optimistic updates.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl WorkflowRecord {
    pub fn state(&self) -> WorkflowState {
        if self.deleted_at.is_some() {
            WorkflowState::Deleted
        } else if self.def.enabled {
            WorkflowState::Enabled
        } else {
            WorkflowState::Disabled
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether this workflow must own exactly one armed trigger.
    pub fn wants_trigger(&self) -> bool {
        self.state() == WorkflowState::Enabled && self.def.schedule.is_scheduled()
    }
}

// ── Execution ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Ok,
    Failed,
    Error,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Ok
                | ExecutionStatus::Failed
                | ExecutionStatus::Error
                | ExecutionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    /// The job exceeded its timeout.
    Timeout,
    /// The notebook executor reported a failure.
    Executor,
    /// The worker holding the job disappeared.
    Lost,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

/// One run of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub project_id: ProjectId,
    pub nb_name: String,
    /// Effective parameters, reserved keys included.
    pub params: Params,
    pub status: ExecutionStatus,
    pub queue: String,
    pub timeout_secs: u64,
    pub input_path: String,
    pub output_path: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub elapsed_secs: Option<f64>,
    #[serde(default)]
    pub machine: Option<String>,
    #[serde(default)]
    pub error: Option<ExecutionError>,
}

impl ExecutionRecord {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Mark the execution as picked up by a worker.
    pub fn start(&mut self, machine: &str, at: DateTime<Utc>) {
        self.status = ExecutionStatus::Running;
        self.machine = Some(machine.to_string());
        self.started_at = Some(at);
    }

    /// Close the execution with a terminal status.
    ///
    /// `elapsed_secs` is measured by the caller so it reflects the time the
    /// notebook actually ran rather than queue wait.
    pub fn finish(
        &mut self,
        status: ExecutionStatus,
        error: Option<ExecutionError>,
        elapsed_secs: f64,
        at: DateTime<Utc>,
    ) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.error = error;
        self.elapsed_secs = Some(elapsed_secs);
        self.finished_at = Some(at);
    }
}

// ── Project ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub project_id: ProjectId,
    /// Normalized, filename-safe name.
    pub name: String,
    pub owner: String,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    /// Create a project with a fresh id and a normalized name.
    pub fn new(name: &str, owner: &str, created_at: DateTime<Utc>) -> Result<Self, ValidationError> {
        let normalized = normalize_name(name);
        if normalized.is_empty() {
            return Err(ValidationError::new("name", "empty after normalization"));
        }
        Ok(Self {
            project_id: crate::id::project_id(),
            name: normalized,
            owner: owner.to_string(),
            repository: None,
            description: None,
            created_at,
        })
    }
}

/// Lowercase, spaces to underscores, anything not filename-safe dropped.
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        .collect()
}

// ── Runtime ────────────────────────────────────────────────────────

/// GPU requirements of a runtime or machine type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuSpec {
    pub name: String,
    #[serde(default = "default_gpu_count")]
    pub count: u32,
}

fn default_gpu_count() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    pub base_image: String,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub requirements: Option<String>,
    #[serde(default)]
    pub gpu: Option<GpuSpec>,
}

/// Metadata of one built runtime image. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeRecord {
    pub runtime_id: RuntimeId,
    pub project_id: ProjectId,
    pub name: String,
    pub version: String,
    pub docker_name: String,
    pub spec: RuntimeSpec,
    pub created_at: DateTime<Utc>,
}

impl RuntimeRecord {
    pub fn runtime_id_for(project_id: &str, name: &str, version: &str) -> RuntimeId {
        format!("{project_id}/{name}/{version}")
    }

    /// Image reference including the version tag.
    pub fn image(&self) -> String {
        format!("{}:{}", self.docker_name, self.version)
    }
}

// ── Machine catalogue ──────────────────────────────────────────────

/// Provider-level sizing of a machine class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineType {
    pub size: String,
    pub image: String,
    pub vcpus: u32,
    #[serde(default)]
    pub network: Option<String>,
}

/// One machine class of the inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineDef {
    pub provider: String,
    pub location: String,
    pub machine_type: MachineType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuSpec>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A block-storage volume definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStorage {
    pub size_gb: u32,
    #[serde(default = "default_volume_kind")]
    pub kind: String,
    pub location: String,
    /// Mount point on the machine; `/` marks the boot disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_volume_kind() -> String {
    "ssd".to_string()
}

impl BlockStorage {
    pub fn is_boot(&self) -> bool {
        self.mount.as_deref() == Some("/")
    }
}
