//! Machine descriptors: what a provider is asked to build, and what it
//! reports back.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nbgrid_core::{BlockStorage, GpuSpec, id};
use serde::{Deserialize, Serialize};

use crate::cluster_file::ClusterSpec;
use crate::error::{ClusterError, ClusterResult};
use crate::inventory::Inventory;

/// Marks every machine provisioned by nbgrid.
pub const CLOUD_TAG: &str = "nbgrid";

/// Label carrying the owning cluster's name.
pub const CLUSTER_LABEL: &str = "cluster";

const DEFAULT_BOOT_GB: u32 = 20;

/// A volume to create or attach alongside a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRequest {
    pub name: String,
    pub spec: BlockStorage,
}

/// Input to `Provider::create_machine`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMachine {
    pub machine_name: String,
    /// Inventory machine type this was built from.
    pub machine_type: String,
    pub provider: String,
    pub size: String,
    pub image: String,
    pub vcpus: u32,
    pub location: String,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub gpu: Option<GpuSpec>,
    /// Freshly created per machine and mounted at `/`.
    pub boot_volume: VolumeRequest,
    /// Pre-existing named volumes to attach.
    #[serde(default)]
    pub volumes: Vec<VolumeRequest>,
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub ssh_public_key: Option<String>,
    /// Environment handed to the machine's agent.
    #[serde(default)]
    pub agent_env: BTreeMap<String, String>,
}

impl ExecutionMachine {
    pub fn tags(&self) -> Vec<String> {
        tags_from_labels(&self.labels)
    }
}

/// A machine as reported by its provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInstance {
    /// Provider-scoped identifier.
    pub machine_id: String,
    pub machine_name: String,
    pub location: String,
    #[serde(default)]
    pub private_ips: Vec<String>,
    #[serde(default)]
    pub public_ips: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    pub provider: String,
    pub created_at: DateTime<Utc>,
}

impl MachineInstance {
    pub fn tags(&self) -> Vec<String> {
        tags_from_labels(&self.labels)
    }

    pub fn cluster(&self) -> Option<&str> {
        self.labels.get(CLUSTER_LABEL).map(String::as_str)
    }

    /// True if the machine carries every tag in `tags`.
    pub fn has_tags(&self, tags: &[String]) -> bool {
        let own = self.tags();
        tags.iter().all(|t| own.contains(t))
    }
}

/// Flatten labels into provider tags: `key` for empty values, else
/// `key:value`.
pub fn tags_from_labels(labels: &BTreeMap<String, String>) -> Vec<String> {
    labels
        .iter()
        .map(|(k, v)| {
            if v.is_empty() {
                k.clone()
            } else {
                format!("{k}:{v}")
            }
        })
        .collect()
}

/// Settings baked into a machine so its agent knows what to serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub cluster: String,
    pub queues: Vec<String>,
    pub heartbeat_secs: u64,
    pub workers: usize,
}

impl AgentSettings {
    pub fn to_env(&self, machine_name: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("NB_AGENT_MACHINE".to_string(), machine_name.to_string()),
            ("NB_AGENT_CLUSTER".to_string(), self.cluster.clone()),
            ("NB_AGENT_QUEUES".to_string(), self.queues.join(",")),
            (
                "NB_AGENT_HEARTBEAT".to_string(),
                self.heartbeat_secs.to_string(),
            ),
            ("NB_AGENT_WORKERS".to_string(), self.workers.to_string()),
        ])
    }
}

/// Builds `ExecutionMachine` descriptors from the inventory.
#[derive(Debug, Clone)]
pub struct MachineBuilder {
    inventory: Arc<Inventory>,
    ssh_public_key: Option<String>,
}

impl MachineBuilder {
    /// Reads the SSH public key, if any, once for every machine built later.
    pub fn new(inventory: Arc<Inventory>, ssh_public_key: Option<&Path>) -> ClusterResult<Self> {
        let ssh_public_key = match ssh_public_key {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .map_err(|e| ClusterError::Read {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    })?
                    .trim()
                    .to_string(),
            ),
            None => None,
        };
        Ok(Self {
            inventory,
            ssh_public_key,
        })
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// A fresh `<type>-<6char>` name for a machine of `cluster`.
    pub fn new_machine_name(cluster: &ClusterSpec) -> String {
        id::suffixed(&cluster.machine)
    }

    pub fn build(
        &self,
        machine_name: &str,
        cluster: &ClusterSpec,
        queues: &[String],
        agent: &AgentSettings,
    ) -> ClusterResult<ExecutionMachine> {
        let def = self.inventory.machine(&cluster.machine)?;
        let location = cluster
            .location
            .clone()
            .unwrap_or_else(|| def.location.clone());
        let network = cluster
            .network
            .clone()
            .or_else(|| def.machine_type.network.clone());

        let mut labels = cluster.labels.clone();
        labels.insert(CLOUD_TAG.to_string(), String::new());
        labels.insert(CLUSTER_LABEL.to_string(), cluster.name.clone());

        let mut boot_spec = None;
        let mut volumes = Vec::new();
        for name in &def.volumes {
            let spec = self.inventory.volume(name)?;
            if spec.is_boot() {
                boot_spec = Some(spec.clone());
            } else {
                volumes.push(VolumeRequest {
                    name: name.clone(),
                    spec: spec.clone(),
                });
            }
        }
        let boot_volume = VolumeRequest {
            name: id::suffixed("boot"),
            spec: boot_spec.unwrap_or_else(|| BlockStorage {
                size_gb: DEFAULT_BOOT_GB,
                kind: "ssd".to_string(),
                location: location.clone(),
                mount: Some("/".to_string()),
                description: None,
            }),
        };

        let mut agent = agent.clone();
        agent.queues = queues.to_vec();

        Ok(ExecutionMachine {
            machine_name: machine_name.to_string(),
            machine_type: cluster.machine.clone(),
            provider: cluster.provider.clone(),
            size: def.machine_type.size.clone(),
            image: def.machine_type.image.clone(),
            vcpus: def.machine_type.vcpus,
            location,
            network,
            gpu: def.gpu.clone(),
            boot_volume,
            volumes,
            labels,
            ssh_public_key: self.ssh_public_key.clone(),
            agent_env: agent.to_env(machine_name),
        })
    }
}
