//! AgentSupervisor — the local backend paired with in-process agents.
//!
//! Local machines are only records on disk, so the daemon runs each
//! machine's agent as a task in its own runtime. The supervisor wraps the
//! local backend: creating a machine starts its agent from the machine's
//! `NB_AGENT_*` environment, destroying it stops the agent first.

use std::collections::BTreeMap;
use std::sync::Arc;

use nbgrid_agent::{Agent, AgentConfig, NotebookExecutor};
use nbgrid_cluster::provider::local::LocalProvider;
use nbgrid_cluster::{
    AgentRegistry, CLOUD_TAG, ExecutionMachine, MachineInstance, Provider, ProviderError,
    ProviderResult,
};
use nbgrid_core::{BlockStorage, SharedClock};
use nbgrid_queue::QueueBroker;
use nbgrid_state::StateStore;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// What every in-process agent is built from.
#[derive(Clone)]
pub struct AgentWiring {
    pub store: StateStore,
    pub broker: QueueBroker,
    pub registry: AgentRegistry,
    pub clock: SharedClock,
    pub executor: Arc<dyn NotebookExecutor>,
}

struct RunningAgent {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct AgentSupervisor {
    inner: Arc<LocalProvider>,
    runtime: Handle,
    wiring: AgentWiring,
    running: Mutex<BTreeMap<String, RunningAgent>>,
}

impl AgentSupervisor {
    pub fn new(inner: Arc<LocalProvider>, runtime: Handle, wiring: AgentWiring) -> Self {
        Self {
            inner,
            runtime,
            wiring,
            running: Mutex::new(BTreeMap::new()),
        }
    }

    /// Start agents for machines left over from a previous run.
    pub fn adopt(&self) -> ProviderResult<usize> {
        let mut adopted = 0;
        for instance in self.inner.list_machines(None, &[CLOUD_TAG.to_string()])? {
            if let Some(machine) = self.inner.machine(&instance.machine_name)?
                && self.start(&machine.spec)?
            {
                adopted += 1;
            }
        }
        if adopted > 0 {
            info!(adopted, "adopted local machines");
        }
        Ok(adopted)
    }

    /// Machines with a running agent.
    pub fn running(&self) -> Vec<String> {
        self.running.lock().keys().cloned().collect()
    }

    /// Stop every agent and wait for them to exit.
    pub async fn shutdown(&self) {
        let agents: Vec<(String, RunningAgent)> = std::mem::take(&mut *self.running.lock())
            .into_iter()
            .collect();
        for (_, agent) in &agents {
            let _ = agent.stop.send(true);
        }
        for (name, agent) in agents {
            if let Err(e) = agent.task.await {
                warn!(machine = %name, error = %e, "agent task failed");
            }
        }
    }

    /// Start the agent of `machine` unless one is running. Returns whether
    /// an agent was started.
    fn start(&self, machine: &ExecutionMachine) -> ProviderResult<bool> {
        let mut running = self.running.lock();
        if running.contains_key(&machine.machine_name) {
            return Ok(false);
        }
        let config = AgentConfig::from_map(&machine.agent_env)
            .map_err(|e| ProviderError::Config(format!("{}: {e}", machine.machine_name)))?;
        let agent = Agent::new(
            config,
            self.wiring.store.clone(),
            self.wiring.broker.clone(),
            self.wiring.registry.clone(),
            self.wiring.clock.clone(),
            self.wiring.executor.clone(),
        );
        let (stop, rx) = watch::channel(false);
        let task = self.runtime.spawn(agent.run(rx));
        running.insert(machine.machine_name.clone(), RunningAgent { stop, task });
        Ok(true)
    }

    fn stop(&self, name: &str) {
        if let Some(agent) = self.running.lock().remove(name) {
            let _ = agent.stop.send(true);
        }
    }
}

impl Provider for AgentSupervisor {
    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    fn create_machine(&self, machine: &ExecutionMachine) -> ProviderResult<MachineInstance> {
        let instance = self.inner.create_machine(machine)?;
        self.start(machine)?;
        Ok(instance)
    }

    fn destroy_machine(&self, name: &str) -> ProviderResult<()> {
        self.stop(name);
        self.inner.destroy_machine(name)
    }

    fn list_machines(
        &self,
        location: Option<&str>,
        tags: &[String],
    ) -> ProviderResult<Vec<MachineInstance>> {
        self.inner.list_machines(location, tags)
    }

    fn create_volume(&self, name: &str, spec: &BlockStorage) -> ProviderResult<()> {
        self.inner.create_volume(name, spec)
    }

    fn destroy_volume(&self, name: &str) -> ProviderResult<()> {
        self.inner.destroy_volume(name)
    }

    fn attach_volume(&self, node: &str, disk: &str) -> ProviderResult<()> {
        self.inner.attach_volume(node, disk)
    }

    fn detach_volume(&self, node: &str, disk: &str) -> ProviderResult<()> {
        self.inner.detach_volume(node, disk)
    }
}
