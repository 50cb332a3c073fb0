//! Conduit daemon: lifecycle management and permission policy for connector
//! instances.
//!
//! The [`LifecycleManager`] owns every state transition. Its dependencies
//! (store, provisioner, policy engine, metrics) are injected values, so tests
//! build as many independent managers as they like.

pub mod features;
pub mod server;
pub mod shared;

pub use features::health::controller::HealthMonitor;
pub use features::instance_lifecycle::repo::{InMemoryStore, JsonFileStore, Store};
pub use features::instance_lifecycle::service::{LifecycleManager, ManagerOptions};
pub use features::observability::controller::ObservabilityController;
pub use features::policy::repo::PolicyRules;
pub use features::policy::service::PolicyEngine;
pub use features::provisioning::repo::{ContainerProvisioner, InMemoryProvisioner, Provisioner};
pub use shared::config::DaemonConfig;
pub use shared::error::{DaemonError, DaemonResult};
