//! Machine providers: the blocking backend contract and the static
//! registry the daemon builds backends from.
//!
//! Calls are blocking; async callers run them on a bounded blocking pool.

pub mod digitalocean;
pub mod local;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use nbgrid_core::{BlockStorage, SharedClock};
use tracing::info;

use crate::error::{ClusterError, ClusterResult, ProviderError, ProviderResult};
use crate::inventory::Inventory;
use crate::machine::{ExecutionMachine, MachineInstance};

pub use digitalocean::DigitalOceanProvider;
pub use local::LocalProvider;

/// A machine backend.
pub trait Provider: Send + Sync {
    /// Factory identifier the backend was built from.
    fn kind(&self) -> &'static str;

    /// Create a machine with a fresh boot volume and the listed volumes
    /// attached. If a machine with the same name already exists it is
    /// returned when its labels match, otherwise `NameInUse`.
    fn create_machine(&self, machine: &ExecutionMachine) -> ProviderResult<MachineInstance>;

    /// Destroy a machine and its boot volume. Absence is success.
    fn destroy_machine(&self, name: &str) -> ProviderResult<()>;

    /// Running machines carrying every tag in `tags`.
    fn list_machines(
        &self,
        location: Option<&str>,
        tags: &[String],
    ) -> ProviderResult<Vec<MachineInstance>>;

    fn create_volume(&self, name: &str, spec: &BlockStorage) -> ProviderResult<()>;

    fn destroy_volume(&self, name: &str) -> ProviderResult<()>;

    fn attach_volume(&self, node: &str, disk: &str) -> ProviderResult<()>;

    fn detach_volume(&self, node: &str, disk: &str) -> ProviderResult<()>;
}

impl fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Provider({})", self.kind())
    }
}

/// Shared handle to a backend.
pub type SharedProvider = Arc<dyn Provider>;

/// What a factory may draw on when building a backend.
#[derive(Clone)]
pub struct ProviderContext {
    /// Root directory of the `local` backend.
    pub local_root: PathBuf,
    pub do_token: Option<String>,
    pub clock: SharedClock,
}

pub type ProviderFactory = fn(&ProviderContext) -> ProviderResult<SharedProvider>;

/// Static table of backend constructors keyed by factory identifier.
#[derive(Clone)]
pub struct ProviderRegistry {
    factories: BTreeMap<&'static str, ProviderFactory>,
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// The built-in backends: `local` and `digitalocean`.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(local::FACTORY_ID, local::factory);
        registry.register(digitalocean::FACTORY_ID, digitalocean::factory);
        registry
    }

    pub fn register(&mut self, id: &'static str, factory: ProviderFactory) {
        self.factories.insert(id, factory);
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    pub fn build(&self, id: &str, ctx: &ProviderContext) -> ProviderResult<SharedProvider> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| ProviderError::Unknown(id.to_string()))?;
        factory(ctx)
    }

    /// Build one backend per entry of the inventory's `providers:` map,
    /// keyed by provider name.
    pub fn build_all(
        &self,
        inventory: &Inventory,
        ctx: &ProviderContext,
    ) -> ClusterResult<BTreeMap<String, SharedProvider>> {
        let mut built = BTreeMap::new();
        for (name, factory_id) in &inventory.providers {
            let provider = self.build(factory_id, ctx).map_err(|e| match e {
                ProviderError::Unknown(id) => {
                    ClusterError::Validation(format!("provider {name}: unknown factory {id}"))
                }
                other => ClusterError::Provider(other),
            })?;
            info!(provider = %name, factory = %factory_id, "provider ready");
            built.insert(name.clone(), provider);
        }
        Ok(built)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("factories", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbgrid_core::SystemClock;

    fn ctx(root: &std::path::Path) -> ProviderContext {
        ProviderContext {
            local_root: root.to_path_buf(),
            do_token: None,
            clock: SystemClock::shared(),
        }
    }

    #[test]
    fn builtin_registry_knows_both_backends() {
        let registry = ProviderRegistry::builtin();
        assert_eq!(registry.ids(), vec!["digitalocean", "local"]);
    }

    #[test]
    fn unknown_factory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProviderRegistry::builtin()
            .build("gcp", &ctx(dir.path()))
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unknown(_)));
    }

    #[test]
    fn digitalocean_needs_a_token() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProviderRegistry::builtin()
            .build("digitalocean", &ctx(dir.path()))
            .unwrap_err();
        assert!(matches!(err, ProviderError::Config(_)));
    }

    #[test]
    fn builds_inventory_providers_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = Inventory::from_yaml("providers:\n  dev: local\n").unwrap();
        let built = ProviderRegistry::builtin()
            .build_all(&inventory, &ctx(dir.path()))
            .unwrap();
        assert_eq!(built["dev"].kind(), "local");
    }

    #[test]
    fn registering_a_custom_backend() {
        fn custom(ctx: &ProviderContext) -> ProviderResult<SharedProvider> {
            local::factory(ctx)
        }
        let mut registry = ProviderRegistry::empty();
        registry.register("custom", custom);
        let dir = tempfile::tempdir().unwrap();
        assert!(registry.build("custom", &ctx(dir.path())).is_ok());
    }
}
