//! nbgridd — one process running a whole nbgrid deployment.
//!
//! ```text
//!                    ┌──────────────── StateStore (redb) ────────────────┐
//!                    │  tables · KV (triggers, registry) · queue tables  │
//!                    └───────────────────────────────────────────────────┘
//!                          ▲              ▲               ▲
//! manifest ──► WorkflowScheduler ──► control ──► Dispatcher×N ──► <queues>
//!                                                                   │
//! ClusterController (per cluster) ──► Provider ──► AgentSupervisor  │
//!                                                    └─► Agent ◄────┘
//!
//! ExecutionJanitor ── closes executions whose leases lapsed
//! ```

pub mod daemon;
pub mod manifest;
pub mod supervisor;

pub use daemon::Daemon;
pub use manifest::{ApplyReport, Manifest};
pub use supervisor::{AgentSupervisor, AgentWiring};
