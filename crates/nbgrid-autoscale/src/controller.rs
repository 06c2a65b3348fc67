//! ClusterController — reconciles one cluster's size against its policy.
//!
//! Every tick:
//!
//! 1. Observe registered machines, agent heartbeats and queue depths.
//!    A machine with a heartbeat is live; without one it is booting while
//!    younger than the heartbeat TTL, else dead.
//! 2. Remove dead machines (unregister, then destroy).
//! 3. Fold the strategies into a delta and clamp `current + delta` to
//!    `[min_nodes, max_nodes]`.
//! 4. Create the shortfall, or destroy up to `scale_down_step` of the most
//!    idle agents. Busy agents, booting machines and agents active within
//!    the last tick are never destroyed.
//!
//! Provider calls are blocking and run on the blocking pool behind a
//! semaphore shared by every controller. Any provider error aborts the tick;
//! the next tick starts from a fresh observation.
//!
//! A machine is created and registered by one blocking task, which runs to
//! the end even when the tick deadline cancels the reconcile waiting on it.
//! Creations still in flight count toward the cluster size.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use nbgrid_cluster::{
    AgentHeartbeat, AgentRegistry, AgentSettings, ClusterSpec, MachineBuilder, Provider,
    ScaleStrategy, SharedProvider,
};
use nbgrid_core::{Settings, SharedClock};
use nbgrid_queue::QueueBroker;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, warn};

use crate::error::{ControllerError, ControllerResult};
use crate::strategy::{self, Observation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub tick: Duration,
    /// Subtracted from the tick to form each reconcile's deadline.
    pub slack: Duration,
    pub agent_heartbeat_secs: u64,
    pub agent_workers: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            slack: Duration::from_secs(1),
            agent_heartbeat_secs: 30,
            agent_workers: 1,
        }
    }
}

impl ControllerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            tick: settings.control_tick(),
            agent_heartbeat_secs: settings.agent_heartbeat_secs,
            agent_workers: settings.agent_workers,
            ..Self::default()
        }
    }

    pub fn deadline(&self) -> Duration {
        self.tick
            .checked_sub(self.slack)
            .filter(|d| !d.is_zero())
            .unwrap_or(self.tick)
    }
}

/// One tick's observation of a cluster.
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    pub live: Vec<AgentHeartbeat>,
    pub booting: Vec<String>,
    pub dead: Vec<String>,
    /// Creations started by an earlier tick and not yet registered.
    pub creating: u32,
    pub depths: BTreeMap<String, u64>,
}

impl ClusterView {
    /// Machines that count toward the cluster size.
    pub fn current(&self) -> u32 {
        (self.live.len() + self.booting.len()) as u32 + self.creating
    }
}

/// Counts one creation as in flight until dropped.
struct InFlight(Arc<AtomicU32>);

impl InFlight {
    fn start(counter: &Arc<AtomicU32>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub current: u32,
    pub delta: i64,
    pub desired: u32,
    pub created: Vec<String>,
    pub destroyed: Vec<String>,
    /// Dead machines cleaned up before sizing.
    pub removed_dead: Vec<String>,
}

pub struct ClusterController {
    cluster: ClusterSpec,
    provider: SharedProvider,
    registry: AgentRegistry,
    broker: QueueBroker,
    builder: MachineBuilder,
    clock: SharedClock,
    pool: Arc<Semaphore>,
    config: ControllerConfig,
    completed_ticks: u64,
    creating: Arc<AtomicU32>,
}

impl ClusterController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cluster: ClusterSpec,
        provider: SharedProvider,
        registry: AgentRegistry,
        broker: QueueBroker,
        builder: MachineBuilder,
        clock: SharedClock,
        pool: Arc<Semaphore>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            cluster,
            provider,
            registry,
            broker,
            builder,
            clock,
            pool,
            config,
            completed_ticks: 0,
            creating: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn cluster(&self) -> &ClusterSpec {
        &self.cluster
    }

    pub fn completed_ticks(&self) -> u64 {
        self.completed_ticks
    }

    pub fn observe(&self) -> ControllerResult<ClusterView> {
        let now = self.clock.now();
        let ttl = self.registry.heartbeat_ttl();
        let mut beats: BTreeMap<String, AgentHeartbeat> = self
            .registry
            .list_heartbeats(&self.cluster.name)?
            .into_iter()
            .map(|beat| (beat.machine.clone(), beat))
            .collect();

        let mut view = ClusterView {
            creating: self.creating.load(Ordering::SeqCst),
            ..ClusterView::default()
        };
        for name in self.registry.list(&self.cluster.name)? {
            if let Some(beat) = beats.remove(&name) {
                view.live.push(beat);
                continue;
            }
            let young = self.registry.get(&name)?.is_some_and(|instance| {
                (now - instance.created_at)
                    .to_std()
                    .is_ok_and(|age| age < ttl)
            });
            if young {
                view.booting.push(name);
            } else {
                view.dead.push(name);
            }
        }

        for queue in self.watched_queues() {
            let depth = self.broker.count(&queue)?;
            view.depths.insert(queue, depth);
        }
        Ok(view)
    }

    /// Run one reconcile pass.
    pub async fn reconcile(&mut self) -> ControllerResult<TickReport> {
        let view = self.observe()?;
        let cluster = self.cluster.name.clone();
        let mut report = TickReport::default();

        for name in &view.dead {
            warn!(%cluster, machine = %name, "machine missed its heartbeat, removing");
            self.remove(name).await?;
            report.removed_dead.push(name.clone());
        }

        let now = self.clock.now();
        let policy = &self.cluster.policy;
        report.current = view.current();
        report.delta = strategy::fold(
            &policy.strategies,
            &Observation {
                depths: &view.depths,
                agents: &view.live,
                now,
            },
        );
        report.desired = strategy::desired_size(
            policy,
            report.current,
            report.delta,
            self.completed_ticks == 0,
        );
        debug!(
            %cluster,
            live = view.live.len(),
            booting = view.booting.len(),
            creating = view.creating,
            delta = report.delta,
            desired = report.desired,
            "cluster observed"
        );

        if report.desired > report.current {
            let room = policy.max_nodes.saturating_sub(report.current);
            let count = (report.desired - report.current).min(room);
            for _ in 0..count {
                report.created.push(self.create().await?);
            }
        } else if report.desired < report.current {
            let excess = (report.current - report.desired).min(policy.scale_down_step);
            for name in self.destroy_candidates(&view, excess as usize) {
                self.remove(&name).await?;
                report.destroyed.push(name);
            }
        }

        self.completed_ticks += 1;
        if !report.created.is_empty() || !report.destroyed.is_empty() {
            info!(
                %cluster,
                from = report.current,
                to = report.desired,
                created = report.created.len(),
                destroyed = report.destroyed.len(),
                "cluster resized"
            );
        }
        Ok(report)
    }

    /// Reconcile under the tick deadline.
    pub async fn tick(&mut self) -> ControllerResult<TickReport> {
        let deadline = self.config.deadline();
        match tokio::time::timeout(deadline, self.reconcile()).await {
            Ok(result) => result,
            Err(_) => Err(ControllerError::Deadline(deadline)),
        }
    }

    /// Reconcile every tick until `shutdown` flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            cluster = %self.cluster.name,
            tick_secs = self.config.tick.as_secs(),
            "cluster controller started"
        );

        loop {
            if let Err(e) = self.tick().await {
                error!(cluster = %self.cluster.name, error = %e, "reconcile failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.tick) => {}
                _ = shutdown.changed() => {
                    info!(cluster = %self.cluster.name, "cluster controller shutting down");
                    break;
                }
            }
        }
    }

    // ── Actions ────────────────────────────────────────────────────

    async fn create(&self) -> ControllerResult<String> {
        let name = MachineBuilder::new_machine_name(&self.cluster);
        let agent = AgentSettings {
            cluster: self.cluster.name.clone(),
            queues: self.cluster.qnames.clone(),
            heartbeat_secs: self.config.agent_heartbeat_secs,
            workers: self.config.agent_workers,
        };
        let machine = self
            .builder
            .build(&name, &self.cluster, &self.cluster.qnames, &agent)?;
        let registry = self.registry.clone();
        let cluster = self.cluster.name.clone();
        let in_flight = InFlight::start(&self.creating);
        self.provider_call(move |provider| {
            let _in_flight = in_flight;
            let instance = provider.create_machine(&machine)?;
            registry.register(&instance, &cluster)?;
            Ok(())
        })
        .await?;
        Ok(name)
    }

    /// Unregister first so no one schedules onto a machine being torn down.
    async fn remove(&self, name: &str) -> ControllerResult<()> {
        self.registry.unregister(name, &self.cluster.name)?;
        let owned = name.to_string();
        self.provider_call(move |provider| Ok(provider.destroy_machine(&owned)?))
            .await
    }

    /// Live agents that may be destroyed, most idle first.
    fn destroy_candidates(&self, view: &ClusterView, limit: usize) -> Vec<String> {
        let now = self.clock.now();
        let mut candidates: Vec<&AgentHeartbeat> = view
            .live
            .iter()
            .filter(|agent| !agent.active_within(now, self.config.tick))
            .collect();
        candidates.sort_by(|a, b| b.idle_for(now).cmp(&a.idle_for(now)));
        candidates
            .into_iter()
            .take(limit)
            .map(|agent| agent.machine.clone())
            .collect()
    }

    /// Run `call` on the blocking pool. Once started it runs to completion
    /// even if the caller stops waiting.
    async fn provider_call<T, F>(&self, call: F) -> ControllerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Provider) -> ControllerResult<T> + Send + 'static,
    {
        let permit = self
            .pool
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ControllerError::Pool(e.to_string()))?;
        let provider = self.provider.clone();
        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            call(provider.as_ref())
        })
        .await
        .map_err(|e| ControllerError::Pool(e.to_string()))?;
        result
    }

    fn watched_queues(&self) -> Vec<String> {
        let mut queues = self.cluster.qnames.clone();
        for strategy in &self.cluster.policy.strategies {
            if let ScaleStrategy::Items { queue, .. } = strategy
                && !queues.contains(queue)
            {
                queues.push(queue.clone());
            }
        }
        queues
    }
}

impl std::fmt::Debug for ClusterController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterController")
            .field("cluster", &self.cluster.name)
            .field("provider", &self.provider)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
