//! nbgrid-queue — named FIFO job queues for nbgrid.
//!
//! One queue per machine class (`cpu.default`, `gpu.default`, ...) plus the
//! `control` queue the scheduler feeds and the dispatcher drains.
//!
//! # Job lifecycle
//!
//! ```text
//!   enqueue ──► pending ──reserve──► started ──complete──► finished
//!                  │                    │
//!                  │remove              ├──fail─────────► failed
//!                  ▼                    └──lease lapsed──► failed (Timeout)
//!               failed (Cancelled)
//! ```
//!
//! Job ids double as idempotency keys: an id is accepted once, and every
//! later enqueue with it returns the original handle. A started job is
//! leased to one worker for `timeout + grace`; only that worker may finish
//! it, and [`QueueBroker::reap_expired`] fails it once the lease lapses.

pub mod broker;
pub mod error;
pub mod job;
pub mod tables;

pub use broker::{BrokerConfig, QueueBroker};
pub use error::{QueueError, QueueResult};
pub use job::{
    EnqueueOptions, FailureKind, JobFailure, JobHandle, JobInfo, JobStatus, ReapedJob, Registry,
    ReservedJob,
};

/// Queue fed by the scheduler and consumed by the dispatcher.
pub const CONTROL_QUEUE: &str = "control";
