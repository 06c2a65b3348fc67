//! nbgrid-cluster — the cluster model shared by the controller, the daemon
//! and the agents.
//!
//! # Architecture
//!
//! ```text
//! cluster.yaml ──► ClusterFile ──┐
//!                                ├─► ClusterConfig
//! inventory.yaml ─► Inventory ───┘        │
//!                                         ▼
//!                                  MachineBuilder ──► ExecutionMachine
//!                                                          │
//! ProviderRegistry ─► Provider (local | digitalocean) ◄────┘
//!                          │ create / destroy / list
//!                          ▼
//!                    MachineInstance ──► AgentRegistry (KV)
//!                                          ├── machine:<name>
//!                                          ├── machines:<cluster>
//!                                          ├── clusters
//!                                          └── heartbeat:<agent> (TTL)
//! ```

pub mod cluster_file;
pub mod error;
pub mod inventory;
pub mod machine;
pub mod provider;
pub mod registry;

pub use cluster_file::{ClusterConfig, ClusterFile, ClusterPolicy, ClusterSpec, ScaleStrategy};
pub use error::{ClusterError, ClusterResult, ProviderError, ProviderResult};
pub use inventory::Inventory;
pub use machine::{
    AgentSettings, CLOUD_TAG, CLUSTER_LABEL, ExecutionMachine, MachineBuilder, MachineInstance,
    VolumeRequest,
};
pub use provider::{
    DigitalOceanProvider, LocalProvider, Provider, ProviderContext, ProviderRegistry,
    SharedProvider,
};
pub use registry::{AgentHeartbeat, AgentRegistry};
