//! Lifecycle events handed to an external event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A run job landed on its target queue.
    Enqueued,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub project_id: String,
    pub workflow_id: String,
    pub execution_id: String,
    pub at: DateTime<Utc>,
}

/// Receiver of lifecycle events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Writes events to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &Event) {
        info!(
            kind = ?event.kind,
            project_id = %event.project_id,
            workflow_id = %event.workflow_id,
            execution_id = %event.execution_id,
            "event"
        );
    }
}

/// Collects events in memory.
#[cfg(any(test, feature = "test-support"))]
#[derive(Debug, Default, Clone)]
pub struct MemoryEventSink {
    events: std::sync::Arc<parking_lot::Mutex<Vec<Event>>>,
}

#[cfg(any(test, feature = "test-support"))]
impl MemoryEventSink {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

#[cfg(any(test, feature = "test-support"))]
impl EventSink for MemoryEventSink {
    fn emit(&self, event: &Event) {
        self.events.lock().push(event.clone());
    }
}
