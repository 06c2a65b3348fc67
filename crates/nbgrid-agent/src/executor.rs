//! The notebook executor contract and its command-line implementation.
//!
//! The executor itself (papermill inside the project's runtime image) is
//! external. `CommandExecutor` starts it as a child process:
//!
//! ```text
//! docker run --rm -i {docker_image} nb-exec     ◄── RunJob as JSON on stdin
//! ```
//!
//! Arguments may reference job fields as `{field}` placeholders.

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use nbgrid_core::RunJob;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{ExecutorError, ExecutorResult};

/// Bytes of stdout/stderr kept in reports and errors.
const TAIL_BYTES: usize = 2048;

/// What an executor hands back on success. Stored as the queue job result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    /// Tail of the executor's stdout.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log_tail: String,
}

/// Runs one notebook job to completion.
///
/// Dropping the returned future must stop the run; the worker drops it on
/// timeout and on shutdown.
#[async_trait]
pub trait NotebookExecutor: Send + Sync {
    async fn execute(&self, job: &RunJob) -> ExecutorResult<ExecutorReport>;
}

/// Runs a configured program with the job on stdin.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: BTreeMap::new(),
        }
    }

    /// `docker run` of the job's runtime image as the given user.
    pub fn docker(uid: u32, gid: u32) -> Self {
        Self::new(
            "docker",
            [
                "run",
                "--rm",
                "-i",
                "--user",
                &format!("{uid}:{gid}"),
                "-v",
                "{workdir}:{workdir}",
                "-w",
                "{workdir}",
                "{docker_image}",
                "nb-exec",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        )
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Arguments with `{field}` placeholders filled from `job`.
    pub fn render_args(&self, job: &RunJob) -> Vec<String> {
        let fields = [
            ("{execution_id}", job.execution_id.as_str()),
            ("{workflow_id}", job.workflow_id.as_str()),
            ("{project_id}", job.project_id.as_str()),
            ("{nb_name}", job.nb_name.as_str()),
            ("{docker_image}", job.docker_image.as_str()),
            ("{input_path}", job.input_path.as_str()),
            ("{output_path}", job.output_path.as_str()),
            ("{workdir}", job.workdir.as_str()),
        ];
        self.args
            .iter()
            .map(|arg| {
                fields
                    .iter()
                    .fold(arg.clone(), |acc, (from, to)| acc.replace(from, to))
            })
            .collect()
    }
}

#[async_trait]
impl NotebookExecutor for CommandExecutor {
    async fn execute(&self, job: &RunJob) -> ExecutorResult<ExecutorReport> {
        let args = self.render_args(job);
        debug!(execution_id = %job.execution_id, program = %self.program, ?args, "starting executor");

        let mut child = Command::new(&self.program)
            .args(&args)
            .envs(&self.env)
            .env("NB_EXECUTION_ID", &job.execution_id)
            .env("NB_WORKFLOW_ID", &job.workflow_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let input = serde_json::to_vec(job).map_err(|e| ExecutorError::Other(e.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await?;
            // Close stdin so the executor sees EOF.
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(ExecutorError::Failed {
                code: output.status.code(),
                stderr: tail(&output.stderr),
            });
        }
        Ok(ExecutorReport {
            output_path: Some(job.output_path.clone()),
            log_tail: tail(&output.stdout),
        })
    }
}

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_end();
    let mut start = text.len().saturating_sub(TAIL_BYTES);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
