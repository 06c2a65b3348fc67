//! nbgrid-scheduler — workflow triggers, control-queue dispatch, and the
//! execution janitor.
//!
//! The scheduler:
//!
//! - Validates and persists workflow definitions
//! - Arms one trigger per enabled scheduled workflow (interval or cron)
//! - Enqueues a control job carrying `(project_id, workflow_id)` per fire
//! - Resumes armed triggers from the KV store on restart
//!
//! # Architecture
//!
//! ```text
//! WorkflowScheduler ──fire──► control queue ──► Dispatcher ──► <workflow queue>
//!   ├── TriggerSet (heap keyed by next fire)        │               │
//!   └── KvStore  (trigger:<workflow_id>)            │               ▼
//!                                                   │           agents
//!                                   ExecutionRecord (queued)
//!
//! ExecutionJanitor ── reap_expired ──► close timed-out executions
//! ```

pub mod context;
pub mod cron;
pub mod dispatcher;
pub mod error;
pub mod janitor;
pub mod scheduler;
pub mod trigger;
pub mod triggers;

pub use context::{ContextInput, ContextPaths, ExecutionContext};
pub use cron::CronExpr;
pub use dispatcher::{DispatchOutcome, Dispatcher, DropReason, TriggerControl};
pub use error::{SchedulerError, SchedulerResult};
pub use janitor::{ExecutionJanitor, SweepReport};
pub use scheduler::{Fired, SchedulerConfig, WorkflowScheduler, trigger_key};
pub use trigger::{Trigger, TriggerState};
pub use triggers::TriggerSet;
