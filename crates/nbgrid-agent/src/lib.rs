//! nbgrid-agent — the process that runs on every worker machine.
//!
//! ```text
//!            ┌──────────────── Agent ────────────────┐
//! queues ──► │ Worker 0..N ──► NotebookExecutor       │
//!            │     │ running / ok / error / failed    │──► ExecutionRecord
//!            │     ▼                                  │
//!            │  Activity ──► HeartbeatReporter ───────│──► heartbeat:<machine>
//!            └────────────────────────────────────────┘
//! ```
//!
//! The controller reads the heartbeats to tell live agents from booting or
//! dead machines and to measure idle time.

pub mod agent;
pub mod error;
pub mod executor;
pub mod heartbeat;
pub mod worker;

pub use agent::{Agent, AgentConfig};
pub use error::{AgentError, AgentResult, ExecutorError, ExecutorResult};
pub use executor::{CommandExecutor, ExecutorReport, NotebookExecutor};
pub use heartbeat::{Activity, AgentIdentity, HeartbeatReporter};
pub use worker::{JobOutcome, Processed, Worker};
