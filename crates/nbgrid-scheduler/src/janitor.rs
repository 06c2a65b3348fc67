//! ExecutionJanitor — closes executions whose run job outlived its lease.
//!
//! Workers enforce job timeouts themselves; the janitor covers workers that
//! died mid-run. Each sweep fails every started job whose lease
//! (`timeout + grace`) lapsed and closes its execution record as `failed`
//! with a `timeout` error. Expired KV entries are purged on the same tick.

use std::time::Duration;

use nbgrid_core::{
    ExecutionError, ExecutionErrorKind, ExecutionId, ExecutionStatus, SharedClock,
};
use nbgrid_queue::{CONTROL_QUEUE, QueueBroker, ReapedJob};
use nbgrid_state::{KvStore, StateStore};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::SchedulerResult;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Executions closed as timed out.
    pub closed: Vec<ExecutionId>,
    /// Control jobs whose dispatcher vanished.
    pub control_jobs: usize,
    pub purged_keys: usize,
}

#[derive(Clone)]
pub struct ExecutionJanitor {
    store: StateStore,
    kv: KvStore,
    broker: QueueBroker,
    clock: SharedClock,
}

impl ExecutionJanitor {
    pub fn new(store: StateStore, kv: KvStore, broker: QueueBroker, clock: SharedClock) -> Self {
        Self {
            store,
            kv,
            broker,
            clock,
        }
    }

    pub fn sweep(&self) -> SchedulerResult<SweepReport> {
        let mut report = SweepReport::default();

        for job in self.broker.reap_expired()? {
            if job.queue == CONTROL_QUEUE {
                warn!(job_id = %job.id, worker = ?job.worker, "control job lease expired");
                report.control_jobs += 1;
                continue;
            }
            match self.close(&job) {
                Ok(true) => report.closed.push(job.id),
                Ok(false) => {}
                Err(e) => {
                    warn!(execution_id = %job.id, error = %e, "failed to close timed-out execution");
                }
            }
        }

        report.purged_keys = self.kv.purge_expired()?;
        if !report.closed.is_empty() || report.purged_keys > 0 {
            debug!(
                closed = report.closed.len(),
                purged = report.purged_keys,
                "janitor sweep"
            );
        }
        Ok(report)
    }

    /// Run sweeps every `interval` until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "execution janitor started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sweep() {
                        error!(error = %e, "janitor sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("execution janitor shutting down");
                    break;
                }
            }
        }
    }

    /// Close the execution of a reaped run job. Returns false when there
    /// was nothing left to close.
    fn close(&self, job: &ReapedJob) -> SchedulerResult<bool> {
        let Some(mut record) = self.store.get_execution(&job.id)? else {
            warn!(execution_id = %job.id, queue = %job.queue, "reaped job has no execution record");
            return Ok(false);
        };
        if record.is_terminal() {
            return Ok(false);
        }

        // The job ended when its lease lapsed, not when the sweep noticed.
        let ended = job
            .lease_expires_at
            .map_or(job.reaped_at, |lease| lease.min(job.reaped_at));
        let started = job.started_at.or(record.started_at).unwrap_or(ended);
        let elapsed = (ended - started).num_milliseconds().max(0) as f64 / 1000.0;
        record.finish(
            ExecutionStatus::Failed,
            Some(ExecutionError {
                kind: ExecutionErrorKind::Timeout,
                message: format!(
                    "no result within {}s (worker {})",
                    job.timeout.as_secs(),
                    job.worker.as_deref().unwrap_or("unknown")
                ),
            }),
            elapsed,
            self.clock.now(),
        );
        self.store.put_execution(&record)?;
        info!(execution_id = %job.id, elapsed_secs = elapsed, "execution timed out");
        Ok(true)
    }
}

impl std::fmt::Debug for ExecutionJanitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionJanitor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use nbgrid_core::{Clock, ManualClock, Params, Project, ScheduleSpec, WorkflowDef};
    use nbgrid_queue::{BrokerConfig, EnqueueOptions, JobStatus};
    use serde_json::json;

    use crate::context::{self, ContextInput, ContextPaths};

    struct Harness {
        janitor: ExecutionJanitor,
        store: StateStore,
        kv: KvStore,
        broker: QueueBroker,
        clock: ManualClock,
    }

    fn harness() -> Harness {
        let store = StateStore::open_in_memory().unwrap();
        let clock = ManualClock::at_epoch();
        let kv = KvStore::new(&store, clock.shared());
        let broker = QueueBroker::new(
            &store,
            clock.shared(),
            BrokerConfig {
                grace: Duration::from_secs(30),
                max_depth: None,
            },
        )
        .unwrap();
        let janitor =
            ExecutionJanitor::new(store.clone(), kv.clone(), broker.clone(), clock.shared());
        Harness {
            janitor,
            store,
            kv,
            broker,
            clock,
        }
    }

    /// Store a queued execution and enqueue its run job with `timeout_secs`.
    fn queued_execution(h: &Harness, timeout_secs: u64) -> String {
        let now = h.clock.now();
        let project = Project::new("demo", "alice", now).unwrap();
        let workflow = nbgrid_core::WorkflowRecord {
            workflow_id: "wf00000000000001".to_string(),
            project_id: project.project_id.clone(),
            def: WorkflowDef {
                nb_name: "hello".to_string(),
                params: Params::new(),
                schedule: ScheduleSpec::None,
                queue: "cpu.default".to_string(),
                timeout_secs,
                enabled: true,
                alias: None,
                runtime: None,
                description: None,
            },
            revision: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        let ctx = context::build(
            ContextInput {
                workflow: &workflow,
                project: &project,
                runtime: None,
                overrides: None,
                execution_id: None,
                now,
            },
            &ContextPaths {
                base_path: PathBuf::from("/srv/nb"),
                output_path: PathBuf::from("/srv/out"),
                default_image: "nbgrid/runtime:latest".to_string(),
            },
        );
        h.store.create_execution(&ctx.execution_record()).unwrap();
        h.broker
            .enqueue(
                &ctx.queue,
                &ctx.run_job(),
                EnqueueOptions::new(Duration::from_secs(timeout_secs))
                    .with_id(ctx.execution_id.clone()),
            )
            .unwrap();
        ctx.execution_id
    }

    #[test]
    fn lapsed_lease_closes_the_execution_as_timed_out() {
        let h = harness();
        let exec_id = queued_execution(&h, 60);
        h.broker.reserve("cpu.default", "agent-1").unwrap().unwrap();
        let mut record = h.store.get_execution(&exec_id).unwrap().unwrap();
        record.start("agent-1", h.clock.now());
        h.store.put_execution(&record).unwrap();

        // Still within timeout + grace.
        h.clock.advance_secs(89);
        assert!(h.janitor.sweep().unwrap().closed.is_empty());

        h.clock.advance_secs(1);
        let report = h.janitor.sweep().unwrap();
        assert_eq!(report.closed, vec![exec_id.clone()]);

        let record = h.store.get_execution(&exec_id).unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        let error = record.error.unwrap();
        assert_eq!(error.kind, ExecutionErrorKind::Timeout);
        assert_eq!(record.elapsed_secs, Some(90.0));
        assert_eq!(
            h.broker.fetch(&exec_id).unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    #[test]
    fn every_started_job_ends_within_its_bound() {
        let h = harness();
        let short = queued_execution(&h, 10);
        let long = queued_execution(&h, 600);
        h.broker.reserve("cpu.default", "agent-1").unwrap();
        h.broker.reserve("cpu.default", "agent-2").unwrap();

        h.clock.advance_secs(40);
        assert_eq!(h.janitor.sweep().unwrap().closed, vec![short.clone()]);
        h.clock.advance_secs(600);
        assert_eq!(h.janitor.sweep().unwrap().closed, vec![long.clone()]);
        assert!(h.broker.started_ids("cpu.default").unwrap().is_empty());

        // Both sweeps ran after the lease lapsed; elapsed stops at the lease.
        for (id, bound) in [(short, 40.0), (long, 630.0)] {
            let record = h.store.get_execution(&id).unwrap().unwrap();
            assert_eq!(record.elapsed_secs, Some(bound), "{id}");
        }
    }

    #[test]
    fn late_sweep_reports_elapsed_up_to_the_lease() {
        let h = harness();
        let exec_id = queued_execution(&h, 60);
        h.broker.reserve("cpu.default", "agent-1").unwrap().unwrap();

        h.clock.advance_secs(95);
        assert_eq!(h.janitor.sweep().unwrap().closed, vec![exec_id.clone()]);
        let record = h.store.get_execution(&exec_id).unwrap().unwrap();
        assert_eq!(record.elapsed_secs, Some(90.0));
    }

    #[test]
    fn terminal_records_are_left_alone() {
        let h = harness();
        let exec_id = queued_execution(&h, 10);
        h.broker.reserve("cpu.default", "agent-1").unwrap();
        let mut record = h.store.get_execution(&exec_id).unwrap().unwrap();
        record.finish(ExecutionStatus::Ok, None, 3.0, h.clock.now());
        h.store.put_execution(&record).unwrap();

        h.clock.advance_secs(60);
        assert!(h.janitor.sweep().unwrap().closed.is_empty());
        let record = h.store.get_execution(&exec_id).unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Ok);
    }

    #[test]
    fn control_jobs_are_counted_not_closed() {
        let h = harness();
        h.broker
            .enqueue(
                CONTROL_QUEUE,
                &json!({"project_id": "p", "workflow_id": "w"}),
                EnqueueOptions::new(Duration::from_secs(5)),
            )
            .unwrap();
        h.broker.reserve(CONTROL_QUEUE, "dispatcher-0").unwrap();

        h.clock.advance_secs(60);
        let report = h.janitor.sweep().unwrap();
        assert_eq!(report.control_jobs, 1);
        assert!(report.closed.is_empty());
    }

    #[test]
    fn expired_kv_entries_are_purged() {
        let h = harness();
        h.kv
            .set("heartbeat:gone", &json!({}), Some(Duration::from_secs(5)))
            .unwrap();
        h.clock.advance_secs(10);
        assert_eq!(h.janitor.sweep().unwrap().purged_keys, 1);
    }
}
