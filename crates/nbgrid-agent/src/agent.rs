//! Agent — one machine's workers plus its heartbeat reporter.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use nbgrid_cluster::AgentRegistry;
use nbgrid_core::SharedClock;
use nbgrid_queue::QueueBroker;
use nbgrid_state::StateStore;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::{AgentError, AgentResult};
use crate::executor::NotebookExecutor;
use crate::heartbeat::{Activity, AgentIdentity, HeartbeatReporter};
use crate::worker::Worker;

/// Settings an agent boots with. Machines receive them as `NB_AGENT_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub machine: String,
    pub cluster: String,
    pub queues: Vec<String>,
    pub heartbeat: Duration,
    pub workers: usize,
    /// Longest a worker blocks on an empty queue before re-checking.
    pub max_wait: Duration,
}

impl AgentConfig {
    pub fn from_env() -> AgentResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_map(env: &BTreeMap<String, String>) -> AgentResult<Self> {
        Self::from_lookup(|key| env.get(key).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AgentResult<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| AgentError::Config(format!("{key} is not set")))
        };
        let number = |key: &str, default: u64| -> AgentResult<u64> {
            match lookup(key) {
                None => Ok(default),
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|_| AgentError::Config(format!("{key}: not a number: {raw:?}"))),
            }
        };

        let queues: Vec<String> = required("NB_AGENT_QUEUES")?
            .split(',')
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_string)
            .collect();
        let workers = number("NB_AGENT_WORKERS", 1)?;
        if workers == 0 {
            return Err(AgentError::Config("NB_AGENT_WORKERS must be at least 1".to_string()));
        }

        Ok(Self {
            machine: required("NB_AGENT_MACHINE")?,
            cluster: required("NB_AGENT_CLUSTER")?,
            queues,
            heartbeat: Duration::from_secs(number("NB_AGENT_HEARTBEAT", 30)?),
            workers: workers as usize,
            max_wait: Duration::from_secs(5),
        })
    }

    /// The agent id is the machine name.
    pub fn identity(&self) -> AgentIdentity {
        AgentIdentity {
            agent_id: self.machine.clone(),
            cluster: self.cluster.clone(),
            machine: self.machine.clone(),
            queues: self.queues.clone(),
            workers: self.workers,
        }
    }
}

pub struct Agent {
    config: AgentConfig,
    workers: Vec<Worker>,
    reporter: HeartbeatReporter,
    activity: Arc<Activity>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        store: StateStore,
        broker: QueueBroker,
        registry: AgentRegistry,
        clock: SharedClock,
        executor: Arc<dyn NotebookExecutor>,
    ) -> Self {
        let activity = Activity::new();
        let workers = (0..config.workers)
            .map(|n| {
                Worker::new(
                    format!("{}/{n}", config.machine),
                    config.machine.clone(),
                    config.queues.clone(),
                    store.clone(),
                    broker.clone(),
                    clock.clone(),
                    executor.clone(),
                    activity.clone(),
                )
            })
            .collect();
        let reporter =
            HeartbeatReporter::new(registry, clock, config.identity(), activity.clone());
        Self {
            config,
            workers,
            reporter,
            activity,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn activity(&self) -> &Arc<Activity> {
        &self.activity
    }

    /// Run every worker and the heartbeat reporter until `shutdown` flips.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        info!(
            machine = %self.config.machine,
            cluster = %self.config.cluster,
            workers = self.workers.len(),
            "agent started"
        );

        let mut tasks = JoinSet::new();
        for worker in self.workers {
            let rx = shutdown.clone();
            let max_wait = self.config.max_wait;
            tasks.spawn(async move { worker.run(max_wait, rx).await });
        }
        let reporter = self.reporter;
        let heartbeat = self.config.heartbeat;
        let rx = shutdown.clone();
        tasks.spawn(async move { reporter.run(heartbeat, rx).await });

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(machine = %self.config.machine, error = %e, "agent task panicked");
            }
        }
        info!(machine = %self.config.machine, "agent stopped");
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
