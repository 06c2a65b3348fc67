//! nbgrid-core — shared vocabulary for every nbgrid crate.
//!
//! Domain types (workflows, executions, projects, runtimes), queue job
//! payloads, id generation, the clock abstraction, settings, and the error
//! taxonomy used across the scheduler, queue, and cluster layers.

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod id;
pub mod jobs;
pub mod types;

pub use clock::{Clock, SharedClock, SystemClock};
#[cfg(any(test, feature = "test-support"))]
pub use clock::ManualClock;
pub use config::Settings;
pub use error::ErrorKind;
pub use events::{Event, EventKind, EventSink, TracingEventSink};
#[cfg(any(test, feature = "test-support"))]
pub use events::MemoryEventSink;
pub use jobs::{ControlJob, RunJob};
pub use types::*;
