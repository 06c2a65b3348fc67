//! Dispatcher — turns control jobs into run jobs.
//!
//! Each control job names a workflow. The dispatcher reads the definition
//! current at dispatch time, builds the execution context, records the
//! execution as `queued` and enqueues the run job on the workflow's queue.
//! The control job's id carries the execution id, which keys the execution
//! record and the run job, so a control job dispatched twice still yields
//! one execution.

use std::sync::Arc;
use std::time::Duration;

use nbgrid_core::{
    ControlJob, Event, EventKind, EventSink, ExecutionError, ExecutionErrorKind, ExecutionId,
    ExecutionStatus, RuntimeRecord, SharedClock, WorkflowRecord, WorkflowState,
};
use nbgrid_queue::{
    CONTROL_QUEUE, EnqueueOptions, FailureKind, JobFailure, QueueBroker, ReservedJob,
};
use nbgrid_state::StateStore;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::context::{self, ContextInput, ContextPaths};
use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduler::WorkflowScheduler;

/// Trigger operations the dispatcher needs to self-heal.
pub trait TriggerControl: Send + Sync {
    /// Drop the trigger of a workflow that no longer exists.
    fn cancel_trigger(&self, workflow_id: &str) -> SchedulerResult<bool>;
}

impl TriggerControl for WorkflowScheduler {
    fn cancel_trigger(&self, workflow_id: &str) -> SchedulerResult<bool> {
        WorkflowScheduler::cancel_trigger(self, workflow_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The workflow is gone; its trigger was cancelled.
    Missing,
    Disabled,
}

/// What became of one control job. Stored as the control job's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Enqueued {
        execution_id: ExecutionId,
        queue: String,
        /// False when the run job already existed.
        created: bool,
    },
    Dropped {
        reason: DropReason,
    },
}

#[derive(Clone)]
pub struct Dispatcher {
    store: StateStore,
    broker: QueueBroker,
    clock: SharedClock,
    triggers: Arc<dyn TriggerControl>,
    events: Arc<dyn EventSink>,
    paths: ContextPaths,
    worker_id: String,
}

impl Dispatcher {
    pub fn new(
        store: StateStore,
        broker: QueueBroker,
        clock: SharedClock,
        triggers: Arc<dyn TriggerControl>,
        events: Arc<dyn EventSink>,
        paths: ContextPaths,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            broker,
            clock,
            triggers,
            events,
            paths,
            worker_id: worker_id.into(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Dispatch one control job as execution `execution_id`.
    pub fn dispatch(
        &self,
        execution_id: &str,
        job: &ControlJob,
    ) -> SchedulerResult<DispatchOutcome> {
        let workflow = match self.store.get_workflow(&job.workflow_id)? {
            Some(record) if !record.is_deleted() => record,
            _ => {
                let cancelled = self.triggers.cancel_trigger(&job.workflow_id)?;
                warn!(
                    workflow_id = %job.workflow_id,
                    %execution_id,
                    cancelled,
                    "control job for missing workflow dropped"
                );
                return Ok(DispatchOutcome::Dropped {
                    reason: DropReason::Missing,
                });
            }
        };
        if workflow.state() == WorkflowState::Disabled {
            debug!(workflow_id = %job.workflow_id, %execution_id, "workflow disabled, control job dropped");
            return Ok(DispatchOutcome::Dropped {
                reason: DropReason::Disabled,
            });
        }

        let project = self
            .store
            .get_project(&workflow.project_id)?
            .ok_or_else(|| SchedulerError::ProjectNotFound(workflow.project_id.clone()))?;
        let runtime = self.resolve_runtime(&workflow)?;
        let now = self.clock.now();
        let ctx = context::build(
            ContextInput {
                workflow: &workflow,
                project: &project,
                runtime: runtime.as_ref(),
                overrides: None,
                execution_id: Some(execution_id),
                now,
            },
            &self.paths,
        );

        if self.store.get_execution(&ctx.execution_id)?.is_none() {
            self.store.create_execution(&ctx.execution_record())?;
        }

        let opts = EnqueueOptions::new(Duration::from_secs(ctx.timeout_secs))
            .with_id(ctx.execution_id.clone());
        let handle = match self.broker.enqueue(&ctx.queue, &ctx.run_job(), opts) {
            Ok(handle) => handle,
            Err(e) => {
                self.abandon(&ctx.execution_id, &e.to_string());
                return Err(e.into());
            }
        };

        if handle.created {
            self.events.emit(&Event {
                kind: EventKind::Enqueued,
                project_id: ctx.project_id.clone(),
                workflow_id: ctx.workflow_id.clone(),
                execution_id: ctx.execution_id.clone(),
                at: now,
            });
        }
        info!(
            workflow_id = %ctx.workflow_id,
            execution_id = %ctx.execution_id,
            queue = %ctx.queue,
            created = handle.created,
            "run job enqueued"
        );
        Ok(DispatchOutcome::Enqueued {
            execution_id: handle.id,
            queue: handle.queue,
            created: handle.created,
        })
    }

    /// Reserve and dispatch the next control job, if any. The control job
    /// is completed with its outcome or failed with the dispatch error.
    pub fn process_next(&self) -> SchedulerResult<Option<DispatchOutcome>> {
        match self.broker.reserve(CONTROL_QUEUE, &self.worker_id)? {
            Some(job) => self.handle(job).map(Some),
            None => Ok(None),
        }
    }

    /// Drain the control queue until `shutdown` flips.
    pub async fn run(&self, max_wait: Duration, mut shutdown: watch::Receiver<bool>) {
        let queues = vec![CONTROL_QUEUE.to_string()];
        info!(worker = %self.worker_id, "dispatcher started");

        loop {
            tokio::select! {
                reserved = self.broker.reserve_wait(&queues, &self.worker_id, max_wait) => {
                    match reserved {
                        Ok(Some(job)) => {
                            // Failures are recorded on the control job.
                            let _ = self.handle(job);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!(worker = %self.worker_id, error = %e, "control queue unavailable");
                            tokio::time::sleep(max_wait).await;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!(worker = %self.worker_id, "dispatcher shutting down");
                    break;
                }
            }
        }
    }

    fn handle(&self, job: ReservedJob) -> SchedulerResult<DispatchOutcome> {
        let result = job
            .decode::<ControlJob>()
            .map_err(SchedulerError::from)
            .and_then(|control| self.dispatch(ControlJob::execution_id(&job.id), &control));

        match result {
            Ok(outcome) => {
                self.broker.complete(&job.id, &self.worker_id, &outcome)?;
                Ok(outcome)
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "dispatch failed");
                let failure = JobFailure::new(FailureKind::Error, e.to_string());
                if let Err(fail_err) = self.broker.fail(&job.id, &self.worker_id, failure) {
                    warn!(job_id = %job.id, error = %fail_err, "failed to fail control job");
                }
                Err(e)
            }
        }
    }

    fn resolve_runtime(&self, workflow: &WorkflowRecord) -> SchedulerResult<Option<RuntimeRecord>> {
        let Some(runtime) = &workflow.def.runtime else {
            return Ok(None);
        };
        let project_id = &workflow.project_id;
        let found = match &runtime.version {
            Some(version) => self.store.get_runtime(&RuntimeRecord::runtime_id_for(
                project_id,
                &runtime.name,
                version,
            ))?,
            None => self.store.latest_runtime(project_id, &runtime.name)?,
        };
        match found {
            Some(record) => Ok(Some(record)),
            None => Err(SchedulerError::RuntimeNotFound(format!(
                "{}:{}",
                runtime.name,
                runtime.version.as_deref().unwrap_or("latest")
            ))),
        }
    }

    /// Close a queued execution whose run job could not be enqueued.
    fn abandon(&self, execution_id: &str, reason: &str) {
        let record = match self.store.get_execution(execution_id) {
            Ok(Some(record)) if record.status == ExecutionStatus::Queued => record,
            Ok(_) => return,
            Err(e) => {
                warn!(%execution_id, error = %e, "failed to load execution");
                return;
            }
        };
        let mut record = record;
        record.finish(
            ExecutionStatus::Cancelled,
            Some(ExecutionError {
                kind: ExecutionErrorKind::Cancelled,
                message: format!("run job not enqueued: {reason}"),
            }),
            0.0,
            self.clock.now(),
        );
        if let Err(e) = self.store.put_execution(&record) {
            warn!(%execution_id, error = %e, "failed to close execution");
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("worker_id", &self.worker_id)
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}
