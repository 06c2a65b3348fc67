//! Inventory — the catalogue of machine types, volumes and providers.
//!
//! ```yaml
//! machines:
//!   cpu:
//!     provider: local
//!     location: local
//!     machine_type: { size: small, image: debian-12, vcpus: 2 }
//!     volumes: [scratch]
//! volumes:
//!   scratch: { size_gb: 50, kind: ssd, location: local, mount: /scratch }
//! providers:
//!   local: local
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use nbgrid_core::{BlockStorage, MachineDef};
use nbgrid_state::StateStore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ClusterError, ClusterResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub machines: BTreeMap<String, MachineDef>,
    #[serde(default)]
    pub volumes: BTreeMap<String, BlockStorage>,
    /// Provider name to the factory identifier it is built with.
    #[serde(default)]
    pub providers: BTreeMap<String, String>,
}

impl Inventory {
    pub fn from_yaml(content: &str) -> ClusterResult<Self> {
        serde_yaml::from_str(content).map_err(|e| ClusterError::Parse {
            what: "inventory".to_string(),
            reason: e.to_string(),
        })
    }

    pub fn to_yaml(&self) -> ClusterResult<String> {
        serde_yaml::to_string(self).map_err(|e| ClusterError::Parse {
            what: "inventory".to_string(),
            reason: e.to_string(),
        })
    }

    /// Read, parse and validate an inventory file.
    pub fn load(path: &Path) -> ClusterResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ClusterError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let inventory = Self::from_yaml(&content)?;
        inventory.validate()?;
        debug!(?path, machines = inventory.machines.len(), "inventory loaded");
        Ok(inventory)
    }

    pub fn validate(&self) -> ClusterResult<()> {
        for (name, def) in &self.machines {
            if !self.providers.contains_key(&def.provider) {
                return Err(ClusterError::Validation(format!(
                    "machine {name}: unknown provider {}",
                    def.provider
                )));
            }
            if def.machine_type.vcpus == 0 {
                return Err(ClusterError::Validation(format!(
                    "machine {name}: vcpus must be positive"
                )));
            }
            for volume in &def.volumes {
                if !self.volumes.contains_key(volume) {
                    return Err(ClusterError::Validation(format!(
                        "machine {name}: unknown volume {volume}"
                    )));
                }
            }
            let boot_disks = def
                .volumes
                .iter()
                .filter_map(|v| self.volumes.get(v))
                .filter(|v| v.is_boot())
                .count();
            if boot_disks > 1 {
                return Err(ClusterError::Validation(format!(
                    "machine {name}: more than one volume mounted at /"
                )));
            }
        }
        for (name, volume) in &self.volumes {
            if volume.size_gb == 0 {
                return Err(ClusterError::Validation(format!(
                    "volume {name}: size_gb must be positive"
                )));
            }
        }
        Ok(())
    }

    pub fn machine(&self, name: &str) -> ClusterResult<&MachineDef> {
        self.machines
            .get(name)
            .ok_or_else(|| ClusterError::NotFound(format!("machine type {name}")))
    }

    pub fn volume(&self, name: &str) -> ClusterResult<&BlockStorage> {
        self.volumes
            .get(name)
            .ok_or_else(|| ClusterError::NotFound(format!("volume {name}")))
    }

    /// The factory identifier a provider name is built with.
    pub fn provider_factory(&self, name: &str) -> ClusterResult<&str> {
        self.providers
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| ClusterError::NotFound(format!("provider {name}")))
    }

    /// Mirror the machine catalogue into the state store.
    pub fn sync_to(&self, store: &StateStore) -> ClusterResult<()> {
        for (name, def) in &self.machines {
            store.put_machine(name, def)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVENTORY: &str = r#"
machines:
  cpu:
    provider: local
    location: local
    machine_type:
      size: small
      image: debian-12
      vcpus: 2
      network: default
    volumes: [root, scratch]
  gpu:
    provider: do
    location: nyc3
    machine_type:
      size: g-2vcpu-8gb
      image: ubuntu-22-04-x64
      vcpus: 2
    gpu:
      name: tesla-t4
volumes:
  root:
    size_gb: 20
    location: local
    mount: /
  scratch:
    size_gb: 50
    kind: hdd
    location: local
    mount: /scratch
providers:
  local: local
  do: digitalocean
"#;

    #[test]
    fn parses_inventory() {
        let inventory = Inventory::from_yaml(INVENTORY).unwrap();
        inventory.validate().unwrap();

        let cpu = inventory.machine("cpu").unwrap();
        assert_eq!(cpu.machine_type.vcpus, 2);
        assert_eq!(cpu.volumes, vec!["root", "scratch"]);
        assert!(inventory.volume("root").unwrap().is_boot());
        assert_eq!(inventory.volume("root").unwrap().kind, "ssd");
        assert_eq!(inventory.provider_factory("do").unwrap(), "digitalocean");
        assert_eq!(inventory.machine("gpu").unwrap().gpu.as_ref().unwrap().count, 1);
    }

    #[test]
    fn unknown_volume_is_rejected() {
        let mut inventory = Inventory::from_yaml(INVENTORY).unwrap();
        inventory.volumes.remove("scratch");
        let err = inventory.validate().unwrap_err();
        assert!(err.to_string().contains("unknown volume scratch"));
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let mut inventory = Inventory::from_yaml(INVENTORY).unwrap();
        inventory.providers.remove("do");
        assert!(inventory.validate().is_err());
    }

    #[test]
    fn missing_machine_is_not_found() {
        let inventory = Inventory::from_yaml(INVENTORY).unwrap();
        let err = inventory.machine("tpu").unwrap_err();
        assert_eq!(err.kind(), nbgrid_core::ErrorKind::NotFound);
    }

    #[test]
    fn yaml_round_trip() {
        let inventory = Inventory::from_yaml(INVENTORY).unwrap();
        let again = Inventory::from_yaml(&inventory.to_yaml().unwrap()).unwrap();
        assert_eq!(again, inventory);
    }

    #[test]
    fn sync_to_store() {
        let store = StateStore::open_in_memory().unwrap();
        let inventory = Inventory::from_yaml(INVENTORY).unwrap();
        inventory.sync_to(&store).unwrap();
        assert_eq!(store.list_machines().unwrap().len(), 2);
    }
}
