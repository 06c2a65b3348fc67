//! Execution context: everything a run needs, resolved at dispatch time.
//!
//! Building a context is a pure function of its inputs. Reserved
//! parameters are injected last and always win over user values:
//!
//! | Key      | Value                         |
//! |----------|-------------------------------|
//! | `WFID`   | workflow id                   |
//! | `EXECID` | execution id                  |
//! | `NOW`    | fire time, ISO-8601 UTC       |

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use nbgrid_core::{
    ExecutionRecord, ExecutionStatus, Params, Project, RunJob, RuntimeRecord, Settings,
    WorkflowRecord, id,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const PARAM_WORKFLOW_ID: &str = "WFID";
pub const PARAM_EXECUTION_ID: &str = "EXECID";
pub const PARAM_NOW: &str = "NOW";

/// Filesystem layout and defaults the builder draws on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextPaths {
    pub base_path: PathBuf,
    pub output_path: PathBuf,
    pub default_image: String,
}

impl ContextPaths {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            base_path: settings.base_path.clone(),
            output_path: settings.output_path.clone(),
            default_image: settings.default_image.clone(),
        }
    }
}

/// Inputs of [`build`].
#[derive(Debug, Clone, Copy)]
pub struct ContextInput<'a> {
    pub workflow: &'a WorkflowRecord,
    pub project: &'a Project,
    pub runtime: Option<&'a RuntimeRecord>,
    pub overrides: Option<&'a Params>,
    pub execution_id: Option<&'a str>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub project_id: String,
    pub nb_name: String,
    pub params: Params,
    pub queue: String,
    pub timeout_secs: u64,
    pub docker_image: String,
    pub runtime_version: Option<String>,
    pub input_path: String,
    pub output_path: String,
    pub workdir: String,
    pub created_at: DateTime<Utc>,
    /// User parameters overwritten by reserved keys.
    pub warnings: Vec<String>,
}

impl ExecutionContext {
    pub fn run_job(&self) -> RunJob {
        RunJob {
            project_id: self.project_id.clone(),
            workflow_id: self.workflow_id.clone(),
            execution_id: self.execution_id.clone(),
            params: self.params.clone(),
            nb_name: self.nb_name.clone(),
            timeout_secs: self.timeout_secs,
            docker_image: self.docker_image.clone(),
            runtime_version: self.runtime_version.clone(),
            input_path: self.input_path.clone(),
            output_path: self.output_path.clone(),
            workdir: self.workdir.clone(),
        }
    }

    /// A `queued` execution record for this context.
    pub fn execution_record(&self) -> ExecutionRecord {
        ExecutionRecord {
            execution_id: self.execution_id.clone(),
            workflow_id: self.workflow_id.clone(),
            project_id: self.project_id.clone(),
            nb_name: self.nb_name.clone(),
            params: self.params.clone(),
            status: ExecutionStatus::Queued,
            queue: self.queue.clone(),
            timeout_secs: self.timeout_secs,
            input_path: self.input_path.clone(),
            output_path: self.output_path.clone(),
            created_at: self.created_at,
            started_at: None,
            finished_at: None,
            elapsed_secs: None,
            machine: None,
            error: None,
        }
    }
}

pub fn build(input: ContextInput<'_>, paths: &ContextPaths) -> ExecutionContext {
    let workflow = input.workflow;
    let def = &workflow.def;
    let execution_id = input
        .execution_id
        .map_or_else(id::execution_id, str::to_string);

    let mut params = def.params.clone();
    if let Some(overrides) = input.overrides {
        params.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    let reserved = [
        (PARAM_WORKFLOW_ID, workflow.workflow_id.clone()),
        (PARAM_EXECUTION_ID, execution_id.clone()),
        (
            PARAM_NOW,
            input.now.to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
    ];
    let mut warnings = Vec::new();
    for (key, value) in reserved {
        if params.contains_key(key) {
            warn!(workflow_id = %workflow.workflow_id, param = key, "reserved parameter overridden");
            warnings.push(format!("parameter {key} is reserved and was replaced"));
        }
        params.insert(key.to_string(), serde_json::Value::String(value));
    }

    let notebook = def.nb_name.trim_end_matches(".ipynb");
    let project_dir = paths.base_path.join(&input.project.name);
    let input_path = project_dir.join(format!("{notebook}.ipynb"));
    let output_path = paths
        .output_path
        .join(&input.project.name)
        .join(input.now.format("%Y-%m-%d").to_string())
        .join(format!("{execution_id}-{notebook}.ipynb"));

    ExecutionContext {
        execution_id,
        workflow_id: workflow.workflow_id.clone(),
        project_id: workflow.project_id.clone(),
        nb_name: def.nb_name.clone(),
        params,
        queue: def.queue.clone(),
        timeout_secs: def.timeout_secs,
        docker_image: input
            .runtime
            .map_or_else(|| paths.default_image.clone(), RuntimeRecord::image),
        runtime_version: input.runtime.map(|r| r.version.clone()),
        input_path: path_string(&input_path),
        output_path: path_string(&output_path),
        workdir: path_string(&project_dir),
        created_at: input.now,
        warnings,
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
