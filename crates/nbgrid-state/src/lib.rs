//! nbgrid-state — embedded state store and key-value registry for nbgrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for projects, workflows, executions, runtimes and inventory
//! machine types, plus a key-value registry with TTLs and sets used for
//! agent liveness and armed-trigger state.
//!
//! # Architecture
//!
//! ```text
//!   StateStore ──── Arc<Database> ────┬── KvStore (kv, kv_sets)
//!   (projects, workflows, ...)        └── QueueBroker (nbgrid-queue)
//! ```
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{project_id}/{alias}`, `{project}/{name}/{version}`)
//! enable prefix scans for related records.
//!
//! `StateStore` and `KvStore` are `Clone` + `Send` + `Sync` and can be
//! shared across async tasks.

pub mod error;
pub mod kv;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use kv::{KvOp, KvStore, Pipeline};
pub use store::StateStore;
