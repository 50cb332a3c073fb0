pub mod container;
pub mod memory;

pub use container::ContainerProvisioner;
pub use memory::InMemoryProvisioner;

use crate::shared::error::DaemonResult;
use crate::shared::types::{HealthStatus, Instance, PermissionSet};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Everything a provisioner needs to materialize one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionSpec {
    pub instance_id: String,
    pub image_ref: String,
    pub config: BTreeMap<String, String>,
    /// Granted (not declared) permissions.
    pub permissions: PermissionSet,
}

impl ProvisionSpec {
    pub fn from_instance(instance: &Instance) -> Self {
        Self {
            instance_id: instance.instance_id.clone(),
            image_ref: instance.image_ref.clone(),
            config: instance.config.clone(),
            permissions: instance.granted_permissions.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisionStep {
    Prepare,
    Start,
    Stop,
    Teardown,
    Probe,
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProvisionStep::Prepare => "prepare",
            ProvisionStep::Start => "start",
            ProvisionStep::Stop => "stop",
            ProvisionStep::Teardown => "teardown",
            ProvisionStep::Probe => "probe",
        };
        f.write_str(name)
    }
}

/// Mechanics of turning an instance into a running process or container.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Fetch or build whatever `start` needs.
    async fn prepare(&self, spec: &ProvisionSpec) -> DaemonResult<()>;

    async fn start(&self, spec: &ProvisionSpec) -> DaemonResult<()>;

    async fn stop(&self, instance_id: &str) -> DaemonResult<()>;

    /// Release every resource held for the instance. Must succeed when
    /// nothing is provisioned.
    async fn teardown(&self, instance_id: &str) -> DaemonResult<()>;

    /// Liveness of a started instance.
    async fn probe(&self, instance_id: &str) -> DaemonResult<HealthStatus>;
}
