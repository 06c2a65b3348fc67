//! Worker — reserves run jobs and drives them through the executor.
//!
//! ```text
//! reserve ──► record running ──► execute (under job timeout)
//!                                   │
//!        ┌────────────┬─────────────┼──────────────┐
//!        ▼            ▼             ▼              ▼
//!       ok          error     failed/timeout   cancelled (shutdown)
//!        │            │             │              │
//!   complete job   fail job      fail job       fail job
//! ```
//!
//! The execution record is closed on the same path. If the janitor already
//! closed it (the lease lapsed first), the worker's late result is dropped.

use std::sync::Arc;
use std::time::Duration;

use nbgrid_core::{
    ExecutionError, ExecutionErrorKind, ExecutionId, ExecutionStatus, RunJob, SharedClock,
};
use nbgrid_queue::{FailureKind, JobFailure, QueueBroker, ReservedJob};
use nbgrid_state::{StateError, StateStore};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::{AgentError, AgentResult};
use crate::executor::{ExecutorReport, NotebookExecutor};
use crate::heartbeat::Activity;

/// How one job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Ok(ExecutorReport),
    Error(String),
    TimedOut(Duration),
    Cancelled,
}

impl JobOutcome {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            JobOutcome::Ok(_) => ExecutionStatus::Ok,
            JobOutcome::Error(_) => ExecutionStatus::Error,
            JobOutcome::TimedOut(_) => ExecutionStatus::Failed,
            JobOutcome::Cancelled => ExecutionStatus::Cancelled,
        }
    }

    fn error(&self) -> Option<ExecutionError> {
        let (kind, message) = match self {
            JobOutcome::Ok(_) => return None,
            JobOutcome::Error(msg) => (ExecutionErrorKind::Executor, msg.clone()),
            JobOutcome::TimedOut(limit) => (
                ExecutionErrorKind::Timeout,
                format!("no result within {}s", limit.as_secs()),
            ),
            JobOutcome::Cancelled => (
                ExecutionErrorKind::Cancelled,
                "agent shut down mid-run".to_string(),
            ),
        };
        Some(ExecutionError { kind, message })
    }

    fn failure(&self) -> Option<JobFailure> {
        let kind = match self {
            JobOutcome::Ok(_) => return None,
            JobOutcome::Error(_) => FailureKind::Error,
            JobOutcome::TimedOut(_) => FailureKind::Timeout,
            JobOutcome::Cancelled => FailureKind::Cancelled,
        };
        let message = self.error().map(|e| e.message).unwrap_or_default();
        Some(JobFailure::new(kind, message))
    }
}

/// A finished job.
#[derive(Debug, Clone, PartialEq)]
pub struct Processed {
    pub execution_id: ExecutionId,
    pub outcome: JobOutcome,
    pub elapsed_secs: f64,
}

#[derive(Clone)]
pub struct Worker {
    worker_id: String,
    machine: String,
    queues: Vec<String>,
    store: StateStore,
    broker: QueueBroker,
    clock: SharedClock,
    executor: Arc<dyn NotebookExecutor>,
    activity: Arc<Activity>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: impl Into<String>,
        machine: impl Into<String>,
        queues: Vec<String>,
        store: StateStore,
        broker: QueueBroker,
        clock: SharedClock,
        executor: Arc<dyn NotebookExecutor>,
        activity: Arc<Activity>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            machine: machine.into(),
            queues,
            store,
            broker,
            clock,
            executor,
            activity,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Wait up to `max_wait` for a job and run it. `None` when no job came.
    pub async fn process_next(
        &self,
        max_wait: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> AgentResult<Option<Processed>> {
        let Some(job) = self
            .broker
            .reserve_wait(&self.queues, &self.worker_id, max_wait)
            .await?
        else {
            return Ok(None);
        };
        self.run_job(job, shutdown).await.map(Some)
    }

    /// Serve the queues until `shutdown` flips. A job in flight at shutdown
    /// is cancelled.
    pub async fn run(&self, max_wait: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.worker_id, queues = ?self.queues, "worker started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!(worker = %self.worker_id, "worker shutting down");
                    break;
                }
                reserved = self.broker.reserve_wait(&self.queues, &self.worker_id, max_wait) => {
                    match reserved {
                        Ok(Some(job)) => {
                            if let Err(e) = self.run_job(job, shutdown.clone()).await {
                                error!(worker = %self.worker_id, error = %e, "job handling failed");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!(worker = %self.worker_id, error = %e, "queue unavailable");
                            tokio::time::sleep(max_wait).await;
                        }
                    }
                }
            }
        }
    }

    async fn run_job(
        &self,
        job: ReservedJob,
        mut shutdown: watch::Receiver<bool>,
    ) -> AgentResult<Processed> {
        let run = match job.decode::<RunJob>() {
            Ok(run) => run,
            Err(e) => {
                self.broker.fail(
                    &job.id,
                    &self.worker_id,
                    JobFailure::new(FailureKind::Error, e.to_string()),
                )?;
                return Err(e.into());
            }
        };

        let Some(mut record) = self.store.get_execution(&job.id)? else {
            self.broker.fail(
                &job.id,
                &self.worker_id,
                JobFailure::new(FailureKind::Error, "no execution record"),
            )?;
            return Err(AgentError::MissingExecution(job.id));
        };
        if record.is_terminal() {
            warn!(execution_id = %job.id, status = ?record.status, "execution already closed, skipping");
            self.broker.fail(
                &job.id,
                &self.worker_id,
                JobFailure::new(FailureKind::Cancelled, "execution already closed"),
            )?;
            return Ok(Processed {
                execution_id: job.id,
                outcome: JobOutcome::Cancelled,
                elapsed_secs: 0.0,
            });
        }

        record.start(&self.machine, self.clock.now());
        self.store.put_execution(&record)?;
        info!(
            execution_id = %job.id,
            workflow_id = %run.workflow_id,
            queue = %job.queue,
            worker = %self.worker_id,
            "execution started"
        );

        self.activity.begin();
        let started = Instant::now();
        let outcome = tokio::select! {
            result = tokio::time::timeout(job.timeout, self.executor.execute(&run)) => match result {
                Ok(Ok(report)) => JobOutcome::Ok(report),
                Ok(Err(e)) => JobOutcome::Error(e.to_string()),
                Err(_) => JobOutcome::TimedOut(job.timeout),
            },
            _ = shutdown.changed() => JobOutcome::Cancelled,
        };
        let elapsed_secs = started.elapsed().as_secs_f64();
        self.activity.end(self.clock.now());

        self.settle_queue(&job, &outcome);
        record.finish(
            outcome.status(),
            outcome.error(),
            elapsed_secs,
            self.clock.now(),
        );
        match self.store.put_execution(&record) {
            Ok(()) => {}
            Err(StateError::Integrity(reason)) => {
                warn!(execution_id = %job.id, %reason, "execution closed elsewhere, result dropped");
            }
            Err(e) => return Err(e.into()),
        }
        info!(
            execution_id = %job.id,
            status = ?record.status,
            elapsed_secs,
            "execution finished"
        );

        Ok(Processed {
            execution_id: job.id,
            outcome,
            elapsed_secs,
        })
    }

    /// Report the outcome to the queue. A lapsed lease means the job was
    /// already reaped; that is logged, not raised.
    fn settle_queue(&self, job: &ReservedJob, outcome: &JobOutcome) {
        let result = match (outcome, outcome.failure()) {
            (JobOutcome::Ok(report), _) => self.broker.complete(&job.id, &self.worker_id, report),
            (_, Some(failure)) => self.broker.fail(&job.id, &self.worker_id, failure),
            (_, None) => Ok(()),
        };
        if let Err(e) = result {
            warn!(execution_id = %job.id, error = %e, "could not settle queue job");
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.worker_id)
            .field("machine", &self.machine)
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}
