//! nbgrid-autoscale — per-cluster controllers that size machine pools from
//! queue depth and agent idleness.
//!
//! # Architecture
//!
//! ```text
//!   QueueBroker ──depth──┐
//!                        ├─► strategy::fold ──► desired_size ──┐
//!   AgentRegistry ─beats─┘                                     │
//!        ▲                                                     ▼
//!        │ register / unregister              create / destroy (blocking pool)
//!        └──────────── ClusterController ◄──────────────► Provider
//! ```
//!
//! One controller runs per cluster; all of them share one provider
//! semaphore so a slow backend cannot starve the runtime.

pub mod controller;
pub mod error;
pub mod strategy;

pub use controller::{ClusterController, ClusterView, ControllerConfig, TickReport};
pub use error::{ControllerError, ControllerResult};
pub use strategy::{Observation, desired_size, fold, vote};
