//! WorkflowScheduler — owns workflow definitions and their triggers.
//!
//! The scheduler:
//! - Validates and persists workflow definitions
//! - Keeps exactly one armed trigger per enabled, scheduled workflow
//! - Enqueues a control job on the `control` queue at every fire
//! - Persists armed triggers to the KV store so a restart resumes them
//!
//! Fires and definition changes serialize on one lock: an update is
//! ordered strictly before or after any fire of the same workflow. A trigger
//! record is written in the same transaction as the definition change or
//! control job that moves it, and the in-memory set only changes once that
//! transaction committed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nbgrid_core::{
    ControlJob, ExecutionId, ScheduleSpec, Settings, SharedClock, WorkflowDef, WorkflowId,
    WorkflowRecord, WorkflowState, id,
};
use nbgrid_queue::{CONTROL_QUEUE, EnqueueOptions, QueueBroker};
use nbgrid_state::{KvStore, Pipeline, StateStore};
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

use crate::cron::CronExpr;
use crate::error::{SchedulerError, SchedulerResult};
use crate::trigger::{Trigger, TriggerState};
use crate::triggers::TriggerSet;

pub const TRIGGER_PREFIX: &str = "trigger:";

pub fn trigger_key(workflow_id: &str) -> String {
    format!("{TRIGGER_PREFIX}{workflow_id}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Longest the loop sleeps without re-checking the heap.
    pub max_wait: Duration,
    /// Timeout of control jobs.
    pub control_timeout: Duration,
    /// Delay before retrying a fire whose enqueue failed.
    pub retry_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(5),
            control_timeout: Duration::from_secs(60),
            retry_backoff: Duration::from_secs(5),
        }
    }
}

impl SchedulerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_wait: settings.scheduler_max_wait(),
            control_timeout: settings.control_timeout(),
            ..Self::default()
        }
    }
}

/// One successful fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fired {
    pub workflow_id: WorkflowId,
    pub execution_id: ExecutionId,
    /// The slot that fired; earlier than `at` when the trigger was overdue.
    pub scheduled_for: DateTime<Utc>,
    pub at: DateTime<Utc>,
}

/// Thread-safe workflow scheduler. Cloning shares the trigger set.
#[derive(Clone)]
pub struct WorkflowScheduler {
    store: StateStore,
    kv: KvStore,
    broker: QueueBroker,
    clock: SharedClock,
    config: SchedulerConfig,
    triggers: Arc<Mutex<TriggerSet>>,
    wake: Arc<Notify>,
}

impl WorkflowScheduler {
    pub fn new(
        store: StateStore,
        kv: KvStore,
        broker: QueueBroker,
        clock: SharedClock,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            kv,
            broker,
            clock,
            config,
            triggers: Arc::new(Mutex::new(TriggerSet::new())),
            wake: Arc::new(Notify::new()),
        }
    }

    // ── Definitions ────────────────────────────────────────────────

    /// Store a new workflow and arm its trigger.
    pub fn create(&self, project_id: &str, def: WorkflowDef) -> SchedulerResult<WorkflowId> {
        validate(&def)?;
        if self.store.get_project(project_id)?.is_none() {
            return Err(SchedulerError::ProjectNotFound(project_id.to_string()));
        }

        let mut triggers = self.triggers.lock();
        let now = self.clock.now();
        let record = WorkflowRecord {
            workflow_id: id::workflow_id(),
            project_id: project_id.to_string(),
            def,
            revision: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        let mut trigger = None;
        self.store.create_workflow_with(&record, |txn, record| {
            let (pipe, next) = plan(record, None, now)?;
            self.kv.stage(txn, &pipe)?;
            trigger = next;
            Ok::<(), SchedulerError>(())
        })?;
        if let Some(armed) = &trigger {
            triggers.arm(armed.clone());
        }
        drop(triggers);

        self.wake.notify_one();
        info!(
            workflow_id = %record.workflow_id,
            %project_id,
            next_fire = ?trigger.map(|t| t.next_fire),
            "workflow created"
        );
        Ok(record.workflow_id)
    }

    /// Replace a workflow's definition and swap its trigger.
    ///
    /// A trigger whose schedule is unchanged keeps its slot grid and fire
    /// count; any other change arms a fresh trigger. Disabling keeps the
    /// persisted trigger so that re-enabling resumes it.
    pub fn update(
        &self,
        project_id: &str,
        workflow_id: &str,
        def: WorkflowDef,
        expected_revision: Option<u64>,
    ) -> SchedulerResult<WorkflowRecord> {
        validate(&def)?;

        let mut triggers = self.triggers.lock();
        self.live_workflow(project_id, workflow_id)?;
        let now = self.clock.now();
        let previous = match triggers.get(workflow_id) {
            Some(trigger) => Some(trigger.clone()),
            None => self.kv.get::<Trigger>(&trigger_key(workflow_id))?,
        };

        let mut trigger = None;
        let record = self.store.update_workflow_with(
            workflow_id,
            def,
            expected_revision,
            now,
            |txn, record| {
                let (pipe, next) = plan(record, previous, now)?;
                self.kv.stage(txn, &pipe)?;
                trigger = next;
                Ok::<(), SchedulerError>(())
            },
        )?;
        triggers.cancel(workflow_id);
        if let Some(armed) = &trigger {
            triggers.arm(armed.clone());
        }
        drop(triggers);

        self.wake.notify_one();
        info!(
            %workflow_id,
            revision = record.revision,
            state = ?record.state(),
            next_fire = ?trigger.map(|t| t.next_fire),
            "workflow updated"
        );
        Ok(record)
    }

    /// Soft-delete a workflow and cancel its trigger. Running executions
    /// are left alone.
    pub fn delete(&self, project_id: &str, workflow_id: &str) -> SchedulerResult<()> {
        let mut triggers = self.triggers.lock();
        self.live_workflow(project_id, workflow_id)?;
        self.store
            .mark_workflow_deleted(workflow_id, self.clock.now())?;
        triggers.cancel(workflow_id);
        self.kv.delete(&trigger_key(workflow_id))?;
        drop(triggers);

        self.wake.notify_one();
        info!(%workflow_id, %project_id, "workflow deleted");
        Ok(())
    }

    /// Fire a workflow immediately, outside its schedule.
    pub fn enqueue_now(&self, project_id: &str, workflow_id: &str) -> SchedulerResult<ExecutionId> {
        self.live_workflow(project_id, workflow_id)?;
        let execution_id = self.enqueue_control(project_id, workflow_id, None)?;
        info!(%workflow_id, %execution_id, "workflow enqueued on demand");
        Ok(execution_id)
    }

    pub fn get(&self, project_id: &str, workflow_id: &str) -> SchedulerResult<WorkflowRecord> {
        self.live_workflow(project_id, workflow_id)
    }

    pub fn list(&self, project_id: &str) -> SchedulerResult<Vec<WorkflowRecord>> {
        Ok(self.store.list_workflows(Some(project_id))?)
    }

    /// The armed trigger of a workflow, if any.
    pub fn trigger(&self, workflow_id: &str) -> Option<Trigger> {
        self.triggers.lock().get(workflow_id).cloned()
    }

    pub fn armed_count(&self) -> usize {
        self.triggers.lock().len()
    }

    /// Drop a workflow's trigger without touching its definition. Returns
    /// whether one was armed.
    pub fn cancel_trigger(&self, workflow_id: &str) -> SchedulerResult<bool> {
        let mut triggers = self.triggers.lock();
        let cancelled = triggers.cancel(workflow_id).is_some();
        self.kv.delete(&trigger_key(workflow_id))?;
        if cancelled {
            info!(%workflow_id, "trigger cancelled");
        }
        Ok(cancelled)
    }

    // ── Startup ────────────────────────────────────────────────────

    /// Re-arm every enabled scheduled workflow, resuming persisted triggers
    /// and dropping records of workflows that no longer qualify. Records of
    /// disabled workflows are kept. Returns the number of armed triggers.
    pub fn restore(&self) -> SchedulerResult<usize> {
        let mut triggers = self.triggers.lock();
        let now = self.clock.now();

        let mut persisted: HashMap<String, Trigger> = self
            .kv
            .scan_prefix::<Trigger>(TRIGGER_PREFIX)?
            .into_iter()
            .map(|(_, trigger)| (trigger.workflow_id.clone(), trigger))
            .collect();

        let mut kept = Vec::new();
        for record in self.store.list_workflows(None)? {
            if !record.wants_trigger() {
                if record.state() == WorkflowState::Disabled && record.def.schedule.is_scheduled() {
                    kept.push(record.workflow_id.clone());
                }
                continue;
            }
            let previous = match triggers.cancel(&record.workflow_id) {
                Some(trigger) => Some(trigger),
                None => persisted.remove(&record.workflow_id),
            };
            match self.install(&mut triggers, &record, previous, now) {
                Ok(_) => kept.push(record.workflow_id.clone()),
                Err(e) => {
                    warn!(workflow_id = %record.workflow_id, error = %e, "failed to restore trigger");
                }
            }
        }

        for workflow_id in persisted.keys().filter(|id| !kept.contains(id)) {
            self.kv.delete(&trigger_key(workflow_id))?;
            debug!(%workflow_id, "dropped stale trigger record");
        }

        let armed = triggers.len();
        info!(armed, "triggers restored");
        Ok(armed)
    }

    // ── Firing ─────────────────────────────────────────────────────

    /// Earliest pending fire time.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.triggers.lock().next_deadline()
    }

    /// Fire every trigger due now, in fire-time order.
    ///
    /// The control job and the advanced trigger record commit together. A
    /// failed fire leaves the trigger armed with a short backoff, does not
    /// count against its repeat limit and leaves the stored record at the
    /// missed slot.
    pub fn fire_due(&self) -> Vec<Fired> {
        let mut triggers = self.triggers.lock();
        let now = self.clock.now();
        let mut fired = Vec::new();

        for mut trigger in triggers.pop_due(now) {
            let workflow_id = trigger.workflow_id.clone();
            let mut advanced = trigger.clone();
            let rearm = match advanced.advance(now) {
                Ok(more) => more,
                Err(e) => {
                    error!(%workflow_id, error = %e, "trigger cannot advance");
                    advanced.state = TriggerState::Cancelled;
                    false
                }
            };

            match self.enqueue_control(&trigger.project_id, &workflow_id, Some(&advanced)) {
                Ok(execution_id) => {
                    info!(
                        %workflow_id,
                        %execution_id,
                        scheduled_for = %trigger.next_fire,
                        "trigger fired"
                    );
                    fired.push(Fired {
                        workflow_id: workflow_id.clone(),
                        execution_id,
                        scheduled_for: trigger.next_fire,
                        at: now,
                    });
                    if rearm {
                        triggers.arm(advanced);
                    } else if advanced.state == TriggerState::Fired {
                        info!(%workflow_id, fired = advanced.fired, "trigger exhausted");
                    }
                }
                Err(e) => {
                    warn!(%workflow_id, error = %e, "trigger fire failed, will retry");
                    trigger.retry_at(now + self.config.retry_backoff);
                    triggers.arm(trigger);
                }
            }
        }
        fired
    }

    /// Run the fire loop until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(max_wait_ms = self.config.max_wait.as_millis() as u64, "scheduler started");

        loop {
            self.fire_due();

            let wait = self
                .next_deadline()
                .map(|at| (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(self.config.max_wait)
                .min(self.config.max_wait);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.wake.notified() => {}
                _ = shutdown.changed() => {
                    info!("scheduler shutting down");
                    break;
                }
            }
        }
    }

    // ── Internals ──────────────────────────────────────────────────

    /// Enqueue a control job under a fresh execution id and return the id.
    /// `trigger` is persisted in the same transaction.
    fn enqueue_control(
        &self,
        project_id: &str,
        workflow_id: &str,
        trigger: Option<&Trigger>,
    ) -> SchedulerResult<ExecutionId> {
        let job = ControlJob {
            project_id: project_id.to_string(),
            workflow_id: workflow_id.to_string(),
        };
        let execution_id = id::execution_id();
        let opts = EnqueueOptions::new(self.config.control_timeout)
            .with_id(ControlJob::job_id(&execution_id));
        self.broker.enqueue_with(CONTROL_QUEUE, &job, opts, |txn| {
            if let Some(trigger) = trigger {
                let mut pipe = Pipeline::new();
                pipe.set(trigger_key(&trigger.workflow_id), trigger, None)?;
                self.kv.stage(txn, &pipe)?;
            }
            Ok::<(), SchedulerError>(())
        })?;
        Ok(execution_id)
    }

    fn live_workflow(&self, project_id: &str, workflow_id: &str) -> SchedulerResult<WorkflowRecord> {
        match self.store.get_workflow(workflow_id)? {
            Some(record) if !record.is_deleted() && record.project_id == project_id => Ok(record),
            _ => Err(SchedulerError::WorkflowNotFound(workflow_id.to_string())),
        }
    }

    /// Persist and arm the trigger `record` calls for, given the trigger it
    /// had before. Must be called with the trigger lock held.
    fn install(
        &self,
        triggers: &mut TriggerSet,
        record: &WorkflowRecord,
        previous: Option<Trigger>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<Trigger>> {
        let (pipe, next) = plan(record, previous, now)?;
        self.kv.execute(&pipe)?;
        if let Some(trigger) = &next {
            triggers.arm(trigger.clone());
            debug!(workflow_id = %record.workflow_id, next_fire = %trigger.next_fire, "trigger armed");
        }
        Ok(next)
    }
}

/// The trigger `record` calls for given the one it had before, and the KV
/// writes that persist it.
fn plan(
    record: &WorkflowRecord,
    previous: Option<Trigger>,
    now: DateTime<Utc>,
) -> SchedulerResult<(Pipeline, Option<Trigger>)> {
    let key = trigger_key(&record.workflow_id);
    let mut pipe = Pipeline::new();
    match record.state() {
        WorkflowState::Enabled if record.def.schedule.is_scheduled() => {}
        // Disabling only suppresses firing; the record keeps the grid and
        // the fire count.
        WorkflowState::Disabled if record.def.schedule.is_scheduled() => return Ok((pipe, None)),
        _ => {
            pipe.delete(key);
            return Ok((pipe, None));
        }
    }

    let next = match previous {
        Some(mut prev) if prev.schedule == record.def.schedule => match prev.state {
            TriggerState::Armed => {
                prev.revision = record.revision;
                Some(prev)
            }
            // Exhausted: the record stays so the workflow does not fire again.
            TriggerState::Fired => return Ok((pipe, None)),
            TriggerState::Cancelled => Trigger::arm(record, now)?,
        },
        _ => Trigger::arm(record, now)?,
    };

    match next {
        Some(trigger) => {
            pipe.set(key, &trigger, None)?;
            Ok((pipe, Some(trigger)))
        }
        None => {
            pipe.delete(key);
            Ok((pipe, None))
        }
    }
}

fn validate(def: &WorkflowDef) -> SchedulerResult<()> {
    def.validate()?;
    if let ScheduleSpec::Cron { expr, .. } = &def.schedule {
        CronExpr::parse(expr)?;
    }
    Ok(())
}
