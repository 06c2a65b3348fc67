//! Queue job payloads.
//!
//! Both payloads travel as JSON. The control job deliberately carries ids
//! only so the dispatcher always reads the definition current at dispatch
//! time.

use serde::{Deserialize, Serialize};

use crate::types::{ExecutionId, Params, ProjectId, WorkflowId};

/// Queue job ids are global, so a control job is keyed by its execution id
/// under this prefix and the run job by the bare execution id.
const CONTROL_ID_PREFIX: &str = "ctl-";

/// Emitted by the scheduler on the control queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlJob {
    pub project_id: ProjectId,
    pub workflow_id: WorkflowId,
}

impl ControlJob {
    /// Queue job id of the control job for `execution_id`.
    pub fn job_id(execution_id: &str) -> String {
        format!("{CONTROL_ID_PREFIX}{execution_id}")
    }

    /// Execution id carried by a control job id.
    pub fn execution_id(job_id: &str) -> &str {
        job_id.strip_prefix(CONTROL_ID_PREFIX).unwrap_or(job_id)
    }
}

/// Emitted by the dispatcher on a workflow's target queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunJob {
    pub project_id: ProjectId,
    pub workflow_id: WorkflowId,
    pub execution_id: ExecutionId,
    pub params: Params,
    pub nb_name: String,
    pub timeout_secs: u64,
    pub docker_image: String,
    #[serde(default)]
    pub runtime_version: Option<String>,
    pub input_path: String,
    pub output_path: String,
    pub workdir: String,
}
