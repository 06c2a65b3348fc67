//! Local backend: machines and volumes are directories on disk.
//!
//! ```text
//! <root>/
//!   machines/<name>/machine.json   LocalMachine
//!   volumes/<name>/volume.json     LocalVolume
//! ```
//!
//! Nothing is booted; the files only record what would exist. The daemon
//! pairs this backend with in-process agents.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nbgrid_core::{BlockStorage, SharedClock, id};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Provider, ProviderContext, SharedProvider};
use crate::error::{ProviderError, ProviderResult};
use crate::machine::{ExecutionMachine, MachineInstance};

pub const FACTORY_ID: &str = "local";

pub(super) fn factory(ctx: &ProviderContext) -> ProviderResult<SharedProvider> {
    Ok(Arc::new(LocalProvider::new(&ctx.local_root, ctx.clock.clone())?))
}

/// On-disk record of a machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalMachine {
    pub instance: MachineInstance,
    pub boot_volume: String,
    /// The descriptor the machine was created from.
    pub spec: ExecutionMachine,
}

/// On-disk record of a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalVolume {
    pub name: String,
    pub spec: BlockStorage,
    #[serde(default)]
    pub attached_to: Option<String>,
}

pub struct LocalProvider {
    root: PathBuf,
    clock: SharedClock,
    lock: Mutex<()>,
}

impl LocalProvider {
    pub fn new(root: &Path, clock: SharedClock) -> ProviderResult<Self> {
        fs::create_dir_all(root.join("machines"))?;
        fs::create_dir_all(root.join("volumes"))?;
        Ok(Self {
            root: root.to_path_buf(),
            clock,
            lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn machine_path(&self, name: &str) -> PathBuf {
        self.root.join("machines").join(name).join("machine.json")
    }

    fn volume_path(&self, name: &str) -> PathBuf {
        self.root.join("volumes").join(name).join("volume.json")
    }

    /// Full record of a machine, if it exists.
    pub fn machine(&self, name: &str) -> ProviderResult<Option<LocalMachine>> {
        read_json(&self.machine_path(name))
    }

    pub fn volume(&self, name: &str) -> ProviderResult<Option<LocalVolume>> {
        read_json(&self.volume_path(name))
    }

    fn ensure_volume(&self, name: &str, spec: &BlockStorage) -> ProviderResult<()> {
        let path = self.volume_path(name);
        if path.exists() {
            return Ok(());
        }
        write_json(
            &path,
            &LocalVolume {
                name: name.to_string(),
                spec: spec.clone(),
                attached_to: None,
            },
        )?;
        debug!(volume = %name, size_gb = spec.size_gb, "volume created");
        Ok(())
    }

    fn set_attachment(&self, disk: &str, node: Option<&str>) -> ProviderResult<()> {
        let path = self.volume_path(disk);
        let mut volume: LocalVolume = read_json(&path)?
            .ok_or_else(|| ProviderError::Api(format!("volume {disk} not found")))?;
        if let (Some(current), Some(node)) = (&volume.attached_to, node)
            && current != node
        {
            return Err(ProviderError::Api(format!(
                "volume {disk} is attached to {current}"
            )));
        }
        volume.attached_to = node.map(str::to_string);
        write_json(&path, &volume)
    }

    fn attach(&self, node: &str, disk: &str) -> ProviderResult<()> {
        let path = self.machine_path(node);
        let mut machine: LocalMachine = read_json(&path)?
            .ok_or_else(|| ProviderError::Api(format!("machine {node} not found")))?;
        self.set_attachment(disk, Some(node))?;
        if !machine.instance.volumes.iter().any(|v| v == disk) {
            machine.instance.volumes.push(disk.to_string());
            write_json(&path, &machine)?;
        }
        Ok(())
    }

    fn detach(&self, node: &str, disk: &str) -> ProviderResult<()> {
        let path = self.machine_path(node);
        if let Some(mut machine) = read_json::<LocalMachine>(&path)? {
            let before = machine.instance.volumes.len();
            machine.instance.volumes.retain(|v| v != disk);
            if machine.instance.volumes.len() != before {
                write_json(&path, &machine)?;
            }
        }
        if let Some(volume) = read_json::<LocalVolume>(&self.volume_path(disk))?
            && volume.attached_to.as_deref() == Some(node)
        {
            self.set_attachment(disk, None)?;
        }
        Ok(())
    }

    fn remove_volume(&self, name: &str) -> ProviderResult<()> {
        let dir = self.root.join("volumes").join(name);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Provider for LocalProvider {
    fn kind(&self) -> &'static str {
        FACTORY_ID
    }

    fn create_machine(&self, spec: &ExecutionMachine) -> ProviderResult<MachineInstance> {
        let _guard = self.lock.lock();
        if let Some(existing) = self.machine(&spec.machine_name)? {
            if existing.instance.labels == spec.labels {
                debug!(machine = %spec.machine_name, "machine already exists");
                return Ok(existing.instance);
            }
            return Err(ProviderError::NameInUse(spec.machine_name.clone()));
        }

        self.ensure_volume(&spec.boot_volume.name, &spec.boot_volume.spec)?;
        self.set_attachment(&spec.boot_volume.name, Some(&spec.machine_name))?;

        let instance = MachineInstance {
            machine_id: id::generate(12),
            machine_name: spec.machine_name.clone(),
            location: spec.location.clone(),
            private_ips: vec!["127.0.0.1".to_string()],
            public_ips: Vec::new(),
            labels: spec.labels.clone(),
            volumes: vec![spec.boot_volume.name.clone()],
            provider: spec.provider.clone(),
            created_at: self.clock.now(),
        };
        write_json(
            &self.machine_path(&spec.machine_name),
            &LocalMachine {
                instance,
                boot_volume: spec.boot_volume.name.clone(),
                spec: spec.clone(),
            },
        )?;

        for volume in &spec.volumes {
            self.ensure_volume(&volume.name, &volume.spec)?;
            self.attach(&spec.machine_name, &volume.name)?;
        }

        let created = self
            .machine(&spec.machine_name)?
            .ok_or_else(|| ProviderError::Io(format!("{} vanished", spec.machine_name)))?;
        info!(machine = %spec.machine_name, location = %spec.location, "local machine created");
        Ok(created.instance)
    }

    fn destroy_machine(&self, name: &str) -> ProviderResult<()> {
        let _guard = self.lock.lock();
        let Some(machine) = self.machine(name)? else {
            return Ok(());
        };
        for volume in &machine.instance.volumes {
            if *volume == machine.boot_volume {
                self.remove_volume(volume)?;
            } else {
                self.detach(name, volume)?;
            }
        }
        match fs::remove_dir_all(self.root.join("machines").join(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(machine = %name, "local machine destroyed");
        Ok(())
    }

    fn list_machines(
        &self,
        location: Option<&str>,
        tags: &[String],
    ) -> ProviderResult<Vec<MachineInstance>> {
        let mut machines = Vec::new();
        for entry in fs::read_dir(self.root.join("machines"))? {
            let entry = entry?;
            let Some(machine) = read_json::<LocalMachine>(&entry.path().join("machine.json"))?
            else {
                continue;
            };
            let instance = machine.instance;
            if location.is_some_and(|l| l != instance.location) || !instance.has_tags(tags) {
                continue;
            }
            machines.push(instance);
        }
        machines.sort_by(|a, b| a.machine_name.cmp(&b.machine_name));
        Ok(machines)
    }

    fn create_volume(&self, name: &str, spec: &BlockStorage) -> ProviderResult<()> {
        let _guard = self.lock.lock();
        self.ensure_volume(name, spec)
    }

    fn destroy_volume(&self, name: &str) -> ProviderResult<()> {
        let _guard = self.lock.lock();
        if let Some(LocalVolume {
            attached_to: Some(node),
            ..
        }) = self.volume(name)?
        {
            self.detach(&node, name)?;
        }
        self.remove_volume(name)
    }

    fn attach_volume(&self, node: &str, disk: &str) -> ProviderResult<()> {
        let _guard = self.lock.lock();
        self.attach(node, disk)
    }

    fn detach_volume(&self, node: &str, disk: &str) -> ProviderResult<()> {
        let _guard = self.lock.lock();
        self.detach(node, disk)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> ProviderResult<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ProviderError::Io(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write through a temp file so readers never see a partial record.
fn write_json<T: Serialize>(path: &Path, value: &T) -> ProviderResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| ProviderError::Io(format!("{}: {e}", path.display())))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use nbgrid_core::ManualClock;

    use crate::machine::{CLOUD_TAG, CLUSTER_LABEL, VolumeRequest};

    fn storage(size_gb: u32, mount: Option<&str>) -> BlockStorage {
        BlockStorage {
            size_gb,
            kind: "ssd".to_string(),
            location: "local".to_string(),
            mount: mount.map(str::to_string),
            description: None,
        }
    }

    fn spec(name: &str, cluster: &str) -> ExecutionMachine {
        ExecutionMachine {
            machine_name: name.to_string(),
            machine_type: "cpu".to_string(),
            provider: "local".to_string(),
            size: "small".to_string(),
            image: "debian-12".to_string(),
            vcpus: 2,
            location: "local".to_string(),
            network: None,
            gpu: None,
            boot_volume: VolumeRequest {
                name: format!("boot-{name}"),
                spec: storage(20, Some("/")),
            },
            volumes: vec![VolumeRequest {
                name: "data".to_string(),
                spec: storage(50, Some("/data")),
            }],
            labels: BTreeMap::from([
                (CLOUD_TAG.to_string(), String::new()),
                (CLUSTER_LABEL.to_string(), cluster.to_string()),
            ]),
            ssh_public_key: None,
            agent_env: BTreeMap::new(),
        }
    }

    fn provider() -> (LocalProvider, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(dir.path(), ManualClock::at_epoch().shared()).unwrap();
        (provider, dir)
    }

    #[test]
    fn create_machine_with_boot_and_data_volumes() {
        let (provider, _dir) = provider();
        let instance = provider.create_machine(&spec("cpu-aaaaaa", "dev")).unwrap();

        assert_eq!(instance.machine_name, "cpu-aaaaaa");
        assert_eq!(instance.volumes, vec!["boot-cpu-aaaaaa", "data"]);
        assert_eq!(instance.cluster(), Some("dev"));
        let data = provider.volume("data").unwrap().unwrap();
        assert_eq!(data.attached_to.as_deref(), Some("cpu-aaaaaa"));
    }

    #[test]
    fn create_is_idempotent_on_name() {
        let (provider, _dir) = provider();
        let first = provider.create_machine(&spec("cpu-aaaaaa", "dev")).unwrap();
        let again = provider.create_machine(&spec("cpu-aaaaaa", "dev")).unwrap();
        assert_eq!(first, again);
        assert_eq!(provider.list_machines(None, &[]).unwrap().len(), 1);
    }

    #[test]
    fn name_collision_with_other_labels_fails() {
        let (provider, _dir) = provider();
        provider.create_machine(&spec("cpu-aaaaaa", "dev")).unwrap();
        let err = provider
            .create_machine(&spec("cpu-aaaaaa", "prod"))
            .unwrap_err();
        assert!(matches!(err, ProviderError::NameInUse(_)));
    }

    #[test]
    fn destroy_is_idempotent() {
        let (provider, _dir) = provider();
        provider.create_machine(&spec("cpu-aaaaaa", "dev")).unwrap();

        provider.destroy_machine("cpu-aaaaaa").unwrap();
        provider.destroy_machine("cpu-aaaaaa").unwrap();
        provider.destroy_machine("never-existed").unwrap();

        assert!(provider.list_machines(None, &[]).unwrap().is_empty());
        // Boot volume goes with the machine; named volumes survive detached.
        assert!(provider.volume("boot-cpu-aaaaaa").unwrap().is_none());
        assert_eq!(provider.volume("data").unwrap().unwrap().attached_to, None);
    }

    #[test]
    fn list_filters_by_tags_and_location() {
        let (provider, _dir) = provider();
        provider.create_machine(&spec("cpu-aaaaaa", "dev")).unwrap();
        let mut other = spec("cpu-bbbbbb", "prod");
        other.volumes.clear();
        provider.create_machine(&other).unwrap();

        let dev = provider
            .list_machines(None, &[CLOUD_TAG.to_string(), "cluster:dev".to_string()])
            .unwrap();
        assert_eq!(dev.len(), 1);
        assert_eq!(dev[0].machine_name, "cpu-aaaaaa");

        assert_eq!(
            provider
                .list_machines(Some("local"), &[CLOUD_TAG.to_string()])
                .unwrap()
                .len(),
            2
        );
        assert!(provider.list_machines(Some("nyc3"), &[]).unwrap().is_empty());
    }

    #[test]
    fn volume_operations_are_idempotent() {
        let (provider, _dir) = provider();
        let mut bare = spec("cpu-aaaaaa", "dev");
        bare.volumes.clear();
        provider.create_machine(&bare).unwrap();

        provider.create_volume("scratch", &storage(10, None)).unwrap();
        provider.create_volume("scratch", &storage(10, None)).unwrap();
        provider.attach_volume("cpu-aaaaaa", "scratch").unwrap();
        provider.attach_volume("cpu-aaaaaa", "scratch").unwrap();

        let machine = provider.machine("cpu-aaaaaa").unwrap().unwrap();
        assert_eq!(machine.instance.volumes, vec!["boot-cpu-aaaaaa", "scratch"]);

        provider.detach_volume("cpu-aaaaaa", "scratch").unwrap();
        provider.detach_volume("cpu-aaaaaa", "scratch").unwrap();
        provider.destroy_volume("scratch").unwrap();
        provider.destroy_volume("scratch").unwrap();
        assert!(provider.volume("scratch").unwrap().is_none());
    }

    #[test]
    fn attaching_a_missing_volume_fails() {
        let (provider, _dir) = provider();
        let mut bare = spec("cpu-aaaaaa", "dev");
        bare.volumes.clear();
        provider.create_machine(&bare).unwrap();
        assert!(provider.attach_volume("cpu-aaaaaa", "nope").is_err());
    }
}
