//! Agent registry — cluster membership and agent liveness in the KV store.
//!
//! Keyspace:
//!
//! ```text
//!   machine:<name>        → MachineInstance
//!   machines:<cluster>    → set of machine names
//!   clusters              → set of cluster names
//!   heartbeat:<agent_id>  → AgentHeartbeat (TTL)
//! ```
//!
//! Multi-key writes go through one pipeline so a crash leaves either all
//! of them or none.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nbgrid_state::{KvStore, Pipeline, StateResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::machine::MachineInstance;

pub const CLUSTERS_KEY: &str = "clusters";
pub const HEARTBEAT_PREFIX: &str = "heartbeat:";

pub fn machine_key(name: &str) -> String {
    format!("machine:{name}")
}

pub fn cluster_set_key(cluster: &str) -> String {
    format!("machines:{cluster}")
}

pub fn heartbeat_key(agent_id: &str) -> String {
    format!("{HEARTBEAT_PREFIX}{agent_id}")
}

/// Periodic liveness report of one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHeartbeat {
    pub agent_id: String,
    pub cluster: String,
    /// Machine the agent runs on.
    pub machine: String,
    pub last_seen: DateTime<Utc>,
    pub queues: Vec<String>,
    pub workers: usize,
    #[serde(default)]
    pub busy_workers: usize,
    #[serde(default)]
    pub last_job_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
}

impl AgentHeartbeat {
    pub fn is_busy(&self) -> bool {
        self.busy_workers > 0
    }

    /// How long the agent has gone without work; zero while busy.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        if self.is_busy() {
            return Duration::ZERO;
        }
        let since = self
            .last_job_at
            .map_or(self.started_at, |at| at.max(self.started_at));
        (now - since).to_std().unwrap_or(Duration::ZERO)
    }

    /// Time since the agent last did anything: finished a job, reported busy,
    /// or started.
    pub fn active_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.is_busy() || self.idle_for(now) < window
    }
}

/// Registry of machines and agents per cluster.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    kv: KvStore,
    heartbeat_ttl: Duration,
}

impl AgentRegistry {
    pub fn new(kv: KvStore, heartbeat_ttl: Duration) -> Self {
        Self { kv, heartbeat_ttl }
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        self.heartbeat_ttl
    }

    /// The writes `register` performs, as one pipeline.
    pub fn registration_pipeline(
        instance: &MachineInstance,
        cluster: &str,
    ) -> StateResult<Pipeline> {
        let mut pipe = Pipeline::new();
        pipe.set(machine_key(&instance.machine_name), instance, None)?
            .sadd(cluster_set_key(cluster), instance.machine_name.clone())
            .sadd(CLUSTERS_KEY, cluster);
        Ok(pipe)
    }

    pub fn register(&self, instance: &MachineInstance, cluster: &str) -> StateResult<()> {
        let pipe = Self::registration_pipeline(instance, cluster)?;
        self.kv.execute(&pipe)?;
        info!(machine = %instance.machine_name, %cluster, "machine registered");
        Ok(())
    }

    pub fn unregister(&self, name: &str, cluster: &str) -> StateResult<()> {
        let mut pipe = Pipeline::new();
        pipe.delete(machine_key(name))
            .srem(cluster_set_key(cluster), name)
            .delete(heartbeat_key(name));
        self.kv.execute(&pipe)?;
        info!(machine = %name, %cluster, "machine unregistered");
        Ok(())
    }

    /// Machine names registered in `cluster`.
    pub fn list(&self, cluster: &str) -> StateResult<Vec<String>> {
        Ok(self
            .kv
            .smembers(&cluster_set_key(cluster))?
            .into_iter()
            .collect())
    }

    pub fn get(&self, name: &str) -> StateResult<Option<MachineInstance>> {
        self.kv.get(&machine_key(name))
    }

    pub fn clusters(&self) -> StateResult<BTreeSet<String>> {
        self.kv.smembers(CLUSTERS_KEY)
    }

    /// Record a heartbeat; it expires after the heartbeat TTL.
    pub fn heartbeat(&self, beat: &AgentHeartbeat) -> StateResult<()> {
        self.kv
            .set(&heartbeat_key(&beat.agent_id), beat, Some(self.heartbeat_ttl))?;
        debug!(agent_id = %beat.agent_id, cluster = %beat.cluster, busy = beat.busy_workers, "heartbeat");
        Ok(())
    }

    /// Live heartbeats of agents in `cluster`.
    pub fn list_heartbeats(&self, cluster: &str) -> StateResult<Vec<AgentHeartbeat>> {
        Ok(self
            .kv
            .scan_prefix::<AgentHeartbeat>(HEARTBEAT_PREFIX)?
            .into_iter()
            .map(|(_, beat)| beat)
            .filter(|beat| beat.cluster == cluster)
            .collect())
    }
}
