//! Heartbeat reporter and the activity counters it reports.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nbgrid_cluster::{AgentHeartbeat, AgentRegistry};
use nbgrid_core::SharedClock;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::AgentResult;

/// Busy workers and last completion time, shared by an agent's workers.
#[derive(Debug, Default)]
pub struct Activity {
    busy: AtomicUsize,
    last_job_at: Mutex<Option<DateTime<Utc>>>,
}

impl Activity {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn begin(&self) {
        self.busy.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end(&self, at: DateTime<Utc>) {
        self.busy.fetch_sub(1, Ordering::SeqCst);
        let mut last = self.last_job_at.lock();
        if last.is_none_or(|prev| prev < at) {
            *last = Some(at);
        }
    }

    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn last_job_at(&self) -> Option<DateTime<Utc>> {
        *self.last_job_at.lock()
    }
}

/// Who an agent is and what it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub cluster: String,
    pub machine: String,
    pub queues: Vec<String>,
    pub workers: usize,
}

pub struct HeartbeatReporter {
    registry: AgentRegistry,
    clock: SharedClock,
    identity: AgentIdentity,
    activity: Arc<Activity>,
    started_at: DateTime<Utc>,
}

impl HeartbeatReporter {
    pub fn new(
        registry: AgentRegistry,
        clock: SharedClock,
        identity: AgentIdentity,
        activity: Arc<Activity>,
    ) -> Self {
        let started_at = clock.now();
        Self {
            registry,
            clock,
            identity,
            activity,
            started_at,
        }
    }

    /// Current heartbeat, without writing it.
    pub fn snapshot(&self) -> AgentHeartbeat {
        AgentHeartbeat {
            agent_id: self.identity.agent_id.clone(),
            cluster: self.identity.cluster.clone(),
            machine: self.identity.machine.clone(),
            last_seen: self.clock.now(),
            queues: self.identity.queues.clone(),
            workers: self.identity.workers,
            busy_workers: self.activity.busy(),
            last_job_at: self.activity.last_job_at(),
            started_at: self.started_at,
        }
    }

    pub fn beat(&self) -> AgentResult<AgentHeartbeat> {
        let beat = self.snapshot();
        self.registry.heartbeat(&beat)?;
        Ok(beat)
    }

    /// Beat immediately, then every `interval` until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(agent_id = %self.identity.agent_id, interval_secs = interval.as_secs(), "heartbeat reporter started");

        loop {
            if let Err(e) = self.beat() {
                warn!(agent_id = %self.identity.agent_id, error = %e, "heartbeat failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!(agent_id = %self.identity.agent_id, "heartbeat reporter shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbgrid_core::{Clock, ManualClock};
    use nbgrid_state::{KvStore, StateStore};

    fn reporter() -> (HeartbeatReporter, AgentRegistry, ManualClock, Arc<Activity>) {
        let store = StateStore::open_in_memory().unwrap();
        let clock = ManualClock::at_epoch();
        let registry = AgentRegistry::new(
            KvStore::new(&store, clock.shared()),
            Duration::from_secs(240),
        );
        let activity = Activity::new();
        let reporter = HeartbeatReporter::new(
            registry.clone(),
            clock.shared(),
            AgentIdentity {
                agent_id: "cpu-abc123".to_string(),
                cluster: "dev".to_string(),
                machine: "cpu-abc123".to_string(),
                queues: vec!["cpu.default".to_string()],
                workers: 2,
            },
            activity.clone(),
        );
        (reporter, registry, clock, activity)
    }

    #[test]
    fn beat_reports_activity() {
        let (reporter, registry, clock, activity) = reporter();
        activity.begin();
        activity.begin();
        clock.advance_secs(30);
        activity.end(clock.now());

        let beat = reporter.beat().unwrap();
        assert_eq!(beat.busy_workers, 1);
        assert_eq!(beat.last_job_at, Some(clock.now()));
        assert_eq!(registry.list_heartbeats("dev").unwrap(), vec![beat]);
    }

    #[test]
    fn heartbeat_lapses_without_beats() {
        let (reporter, registry, clock, _) = reporter();
        reporter.beat().unwrap();
        clock.advance_secs(241);
        assert!(registry.list_heartbeats("dev").unwrap().is_empty());
        reporter.beat().unwrap();
        assert_eq!(registry.list_heartbeats("dev").unwrap().len(), 1);
    }

    #[test]
    fn last_job_only_moves_forward() {
        let clock = ManualClock::at_epoch();
        let activity = Activity::new();
        activity.begin();
        activity.begin();
        let later = clock.now() + chrono::Duration::seconds(10);
        activity.end(later);
        activity.end(clock.now());
        assert_eq!(activity.last_job_at(), Some(later));
        assert_eq!(activity.busy(), 0);
    }

    #[tokio::test]
    async fn run_beats_until_shutdown() {
        let (reporter, registry, _clock, _) = reporter();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { reporter.run(Duration::from_secs(3600), rx).await });
        for _ in 0..100 {
            if !registry.list_heartbeats("dev").unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(registry.list_heartbeats("dev").unwrap().len(), 1);
    }
}
