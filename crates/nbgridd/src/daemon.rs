//! Daemon — every subsystem of one deployment wired over one store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use nbgrid_agent::NotebookExecutor;
use nbgrid_autoscale::{ClusterController, ControllerConfig};
use nbgrid_cluster::provider::local;
use nbgrid_cluster::{
    AgentRegistry, ClusterConfig, LocalProvider, MachineBuilder, ProviderContext,
    ProviderRegistry, SharedProvider,
};
use nbgrid_core::{Settings, SharedClock, TracingEventSink};
use nbgrid_queue::{BrokerConfig, QueueBroker};
use nbgrid_scheduler::{
    ContextPaths, Dispatcher, ExecutionJanitor, SchedulerConfig, WorkflowScheduler,
};
use nbgrid_state::{KvStore, StateStore};
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::supervisor::{AgentSupervisor, AgentWiring};

pub struct Daemon {
    settings: Settings,
    store: StateStore,
    kv: KvStore,
    broker: QueueBroker,
    registry: AgentRegistry,
    scheduler: Arc<WorkflowScheduler>,
    dispatchers: Vec<Dispatcher>,
    janitor: ExecutionJanitor,
    controllers: Vec<ClusterController>,
    supervisors: Vec<Arc<AgentSupervisor>>,
}

impl Daemon {
    /// Wire every subsystem. Must be called inside a tokio runtime; local
    /// agents are spawned on it.
    pub fn new(
        settings: Settings,
        store: StateStore,
        cluster: Option<ClusterConfig>,
        clock: SharedClock,
        executor: Arc<dyn NotebookExecutor>,
    ) -> anyhow::Result<Self> {
        let runtime = Handle::try_current().context("the daemon needs a tokio runtime")?;

        let kv = KvStore::new(&store, clock.clone());
        let broker = QueueBroker::new(
            &store,
            clock.clone(),
            BrokerConfig {
                grace: settings.job_grace(),
                max_depth: settings.queue_max_depth,
            },
        )?;
        let registry = AgentRegistry::new(kv.clone(), settings.heartbeat_ttl());

        let scheduler = Arc::new(WorkflowScheduler::new(
            store.clone(),
            kv.clone(),
            broker.clone(),
            clock.clone(),
            SchedulerConfig::from_settings(&settings),
        ));
        let paths = ContextPaths::from_settings(&settings);
        let dispatchers = (0..settings.dispatcher_workers.max(1))
            .map(|n| {
                Dispatcher::new(
                    store.clone(),
                    broker.clone(),
                    clock.clone(),
                    scheduler.clone(),
                    Arc::new(TracingEventSink),
                    paths.clone(),
                    format!("dispatcher-{n}"),
                )
            })
            .collect();
        let janitor =
            ExecutionJanitor::new(store.clone(), kv.clone(), broker.clone(), clock.clone());

        let mut controllers = Vec::new();
        let mut supervisors = Vec::new();
        if let Some(config) = cluster {
            config.inventory.sync_to(&store)?;

            let wiring = AgentWiring {
                store: store.clone(),
                broker: broker.clone(),
                registry: registry.clone(),
                clock: clock.clone(),
                executor,
            };
            let ctx = ProviderContext {
                local_root: settings.local_provider_root(),
                do_token: settings.do_token.clone(),
                clock: clock.clone(),
            };
            let builtin = ProviderRegistry::builtin();
            let mut providers: BTreeMap<String, SharedProvider> = BTreeMap::new();
            for (name, factory_id) in &config.inventory.providers {
                let provider: SharedProvider = if factory_id == local::FACTORY_ID {
                    let backend = Arc::new(LocalProvider::new(
                        &settings.local_provider_root().join(name),
                        clock.clone(),
                    )?);
                    let supervisor =
                        Arc::new(AgentSupervisor::new(backend, runtime.clone(), wiring.clone()));
                    supervisors.push(supervisor.clone());
                    supervisor
                } else {
                    builtin
                        .build(factory_id, &ctx)
                        .with_context(|| format!("building provider {name}"))?
                };
                info!(provider = %name, factory = %factory_id, "provider ready");
                providers.insert(name.clone(), provider);
            }

            let builder = MachineBuilder::new(
                Arc::new(config.inventory.clone()),
                settings.ssh_public_key.as_deref(),
            )?;
            let pool = Arc::new(Semaphore::new(settings.provider_pool.max(1)));
            let controller_config = ControllerConfig::from_settings(&settings);
            for spec in config.file.clusters.values() {
                let provider = providers
                    .get(&spec.provider)
                    .cloned()
                    .with_context(|| format!("cluster {}: no provider {}", spec.name, spec.provider))?;
                controllers.push(ClusterController::new(
                    spec.clone(),
                    provider,
                    registry.clone(),
                    broker.clone(),
                    builder.clone(),
                    clock.clone(),
                    pool.clone(),
                    controller_config.clone(),
                ));
            }
        }

        info!(
            dispatchers = settings.dispatcher_workers.max(1),
            clusters = controllers.len(),
            local_providers = supervisors.len(),
            "daemon assembled"
        );

        Ok(Self {
            settings,
            store,
            kv,
            broker,
            registry,
            scheduler,
            dispatchers,
            janitor,
            controllers,
            supervisors,
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn broker(&self) -> &QueueBroker {
        &self.broker
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<WorkflowScheduler> {
        &self.scheduler
    }

    pub fn dispatchers(&self) -> &[Dispatcher] {
        &self.dispatchers
    }

    pub fn janitor(&self) -> &ExecutionJanitor {
        &self.janitor
    }

    pub fn controllers_mut(&mut self) -> &mut [ClusterController] {
        &mut self.controllers
    }

    pub fn supervisors(&self) -> &[Arc<AgentSupervisor>] {
        &self.supervisors
    }

    /// Resume armed triggers, start agents of surviving local machines and
    /// drop expired KV entries.
    pub fn recover(&self) -> anyhow::Result<()> {
        let restored = self.scheduler.restore()?;
        let mut adopted = 0;
        for supervisor in &self.supervisors {
            adopted += supervisor.adopt()?;
        }
        let purged = self.kv.purge_expired()?;
        info!(restored, adopted, purged, "recovered state");
        Ok(())
    }

    /// Run every loop until `shutdown` flips, then stop local agents.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.recover()?;

        let mut tasks = JoinSet::new();

        let scheduler = self.scheduler.clone();
        let rx = shutdown.clone();
        tasks.spawn(async move { scheduler.run(rx).await });

        let max_wait = self.settings.scheduler_max_wait();
        for dispatcher in self.dispatchers {
            let rx = shutdown.clone();
            tasks.spawn(async move { dispatcher.run(max_wait, rx).await });
        }

        let janitor = self.janitor;
        let rx = shutdown.clone();
        let sweep_every = max_wait.max(Duration::from_secs(1));
        tasks.spawn(async move { janitor.run(sweep_every, rx).await });

        for controller in self.controllers {
            tasks.spawn(controller.run(shutdown.clone()));
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "daemon task panicked");
            }
        }

        for supervisor in &self.supervisors {
            supervisor.shutdown().await;
        }
        info!("daemon stopped");
        Ok(())
    }
}
