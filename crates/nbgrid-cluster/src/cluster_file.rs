//! Cluster file — named clusters, their scaling policy, and the inventory
//! they draw machines from.
//!
//! ```yaml
//! inventory: inventory.yaml
//! default_cluster: dev
//! clusters:
//!   dev:
//!     provider: local
//!     machine: cpu
//!     qnames: [cpu.default]
//!     policy:
//!       min_nodes: 1
//!       max_nodes: 4
//!       strategies:
//!         - name: items
//!           queue: cpu.default
//!           gt: 2
//!           increase_by: 2
//!         - name: idle
//!           idle_time_gt: 5
//! ```
//!
//! Loaded once at boot; changes need a restart.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ClusterError, ClusterResult};
use crate::inventory::Inventory;

/// One scaling rule. Strategies are folded in order into a signed delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum ScaleStrategy {
    /// React to the pending depth of one queue.
    Items {
        queue: String,
        gt: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lt: Option<u64>,
        #[serde(default = "one")]
        increase_by: u32,
        #[serde(default = "one")]
        decrease_by: u32,
    },
    /// React to agent idle time, in minutes.
    Idle {
        idle_time_gt: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        idle_time_lt: Option<u64>,
    },
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterPolicy {
    pub min_nodes: u32,
    pub max_nodes: u32,
    /// Size an empty cluster starts at; `min_nodes` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_nodes: Option<u32>,
    /// Most machines destroyed in one tick.
    #[serde(default = "one")]
    pub scale_down_step: u32,
    #[serde(default)]
    pub strategies: Vec<ScaleStrategy>,
}

impl ClusterPolicy {
    pub fn bootstrap_nodes(&self) -> u32 {
        self.default_nodes.unwrap_or(self.min_nodes)
    }

    pub fn clamp(&self, n: i64) -> u32 {
        n.clamp(i64::from(self.min_nodes), i64::from(self.max_nodes)) as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Injected from the map key.
    #[serde(skip)]
    pub name: String,
    pub provider: String,
    /// Inventory machine type.
    pub machine: String,
    /// Overrides the machine type's location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub qnames: Vec<String>,
    /// Overrides the machine type's network.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub policy: ClusterPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterFile {
    pub clusters: BTreeMap<String, ClusterSpec>,
    /// Path of the inventory, relative to the cluster file.
    pub inventory: PathBuf,
    pub default_cluster: String,
}

impl ClusterFile {
    pub fn from_yaml(content: &str) -> ClusterResult<Self> {
        let mut file: ClusterFile =
            serde_yaml::from_str(content).map_err(|e| ClusterError::Parse {
                what: "cluster file".to_string(),
                reason: e.to_string(),
            })?;
        for (name, spec) in file.clusters.iter_mut() {
            spec.name = name.clone();
        }
        Ok(file)
    }

    pub fn to_yaml(&self) -> ClusterResult<String> {
        serde_yaml::to_string(self).map_err(|e| ClusterError::Parse {
            what: "cluster file".to_string(),
            reason: e.to_string(),
        })
    }

    pub fn cluster(&self, name: &str) -> ClusterResult<&ClusterSpec> {
        self.clusters
            .get(name)
            .ok_or_else(|| ClusterError::NotFound(format!("cluster {name}")))
    }

    pub fn default_cluster(&self) -> ClusterResult<&ClusterSpec> {
        self.cluster(&self.default_cluster)
    }

    /// Check the file against itself and the inventory it points at.
    pub fn validate(&self, inventory: &Inventory) -> ClusterResult<()> {
        if !self.clusters.contains_key(&self.default_cluster) {
            return Err(ClusterError::Validation(format!(
                "default_cluster {} is not defined",
                self.default_cluster
            )));
        }
        for (name, spec) in &self.clusters {
            validate_cluster(name, spec, inventory)?;
        }
        Ok(())
    }
}

fn validate_cluster(name: &str, spec: &ClusterSpec, inventory: &Inventory) -> ClusterResult<()> {
    let invalid = |reason: String| ClusterError::Validation(format!("cluster {name}: {reason}"));
    let policy = &spec.policy;

    inventory
        .machine(&spec.machine)
        .map_err(|_| invalid(format!("unknown machine {}", spec.machine)))?;
    inventory
        .provider_factory(&spec.provider)
        .map_err(|_| invalid(format!("unknown provider {}", spec.provider)))?;
    if spec.qnames.is_empty() {
        return Err(invalid("qnames must not be empty".to_string()));
    }
    if policy.min_nodes > policy.max_nodes {
        return Err(invalid(format!(
            "min_nodes {} exceeds max_nodes {}",
            policy.min_nodes, policy.max_nodes
        )));
    }
    if let Some(default) = policy.default_nodes
        && (default < policy.min_nodes || default > policy.max_nodes)
    {
        return Err(invalid(format!(
            "default_nodes {default} outside [{}, {}]",
            policy.min_nodes, policy.max_nodes
        )));
    }
    if policy.scale_down_step == 0 {
        return Err(invalid("scale_down_step must be positive".to_string()));
    }
    for strategy in &policy.strategies {
        match strategy {
            ScaleStrategy::Items {
                queue,
                gt,
                lt,
                increase_by,
                decrease_by,
            } => {
                if queue.is_empty() {
                    return Err(invalid("items strategy without queue".to_string()));
                }
                if *increase_by == 0 || *decrease_by == 0 {
                    return Err(invalid("items step sizes must be positive".to_string()));
                }
                if let Some(lt) = lt
                    && lt > gt
                {
                    return Err(invalid(format!("items lt {lt} above gt {gt}")));
                }
            }
            ScaleStrategy::Idle {
                idle_time_gt,
                idle_time_lt,
            } => {
                if let Some(lt) = idle_time_lt
                    && lt > idle_time_gt
                {
                    return Err(invalid(format!(
                        "idle_time_lt {lt} above idle_time_gt {idle_time_gt}"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// A cluster file together with the inventory it references.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    pub file: ClusterFile,
    pub inventory: Inventory,
}

impl ClusterConfig {
    /// Load and validate a cluster file and its inventory.
    pub fn load(path: &Path) -> ClusterResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ClusterError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let file = ClusterFile::from_yaml(&content)?;
        let inventory_path = match path.parent() {
            Some(dir) if file.inventory.is_relative() => dir.join(&file.inventory),
            _ => file.inventory.clone(),
        };
        let inventory = Inventory::load(&inventory_path)?;
        file.validate(&inventory)?;
        debug!(?path, clusters = file.clusters.len(), "cluster file loaded");
        Ok(Self { file, inventory })
    }
}
