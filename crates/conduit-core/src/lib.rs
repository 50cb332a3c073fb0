pub mod events;
pub mod lifecycle;
pub mod permission;
pub mod policy;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub use events::{LifecycleEvent, LifecycleEventRecorder};
pub use lifecycle::validate_transition;
pub use permission::{FilesystemPermissions, NetworkEgress, PermissionSet};
pub use policy::{Decision, PolicyDecision, PolicyRequest, PolicyScope};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("invalid state transition for {action}: {from} -> {to}")]
    InvalidTransition {
        action: String,
        from: InstanceStatus,
        to: InstanceStatus,
    },
    #[error("Invalid permission: {0}")]
    InvalidPermission(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Lifecycle state of a connector instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Created,
    Installing,
    Installed,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Removed,
}

impl InstanceStatus {
    /// Statuses held only while a worker is mid-transition.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            InstanceStatus::Installing | InstanceStatus::Starting | InstanceStatus::Stopping
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceStatus::Created => "created",
            InstanceStatus::Installing => "installing",
            InstanceStatus::Installed => "installed",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// A configured connector deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    pub package_id: String,
    pub version: String,
    pub display_name: String,
    pub image_ref: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub declared_permissions: PermissionSet,
    pub status: InstanceStatus,
    #[serde(default)]
    pub granted_permissions: PermissionSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(
        package_id: impl Into<String>,
        version: impl Into<String>,
        display_name: impl Into<String>,
        image_ref: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: Uuid::new_v4().to_string(),
            package_id: package_id.into(),
            version: version.into(),
            display_name: display_name.into(),
            image_ref: image_ref.into(),
            config: BTreeMap::new(),
            declared_permissions: PermissionSet::default(),
            status: InstanceStatus::Created,
            granted_permissions: PermissionSet::default(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_config(mut self, config: BTreeMap<String, String>) -> Self {
        self.config = config;
        self
    }

    pub fn with_declared_permissions(mut self, permissions: PermissionSet) -> Self {
        self.declared_permissions = permissions;
        self
    }

    /// Move to `to` if the lifecycle graph allows it.
    pub fn transition(&mut self, action: &str, to: InstanceStatus) -> Result<()> {
        validate_transition(action, self.status, to)?;
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Install,
    Start,
    Stop,
    Remove,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationType::Install => "install",
            OperationType::Start => "start",
            OperationType::Stop => "stop",
            OperationType::Remove => "remove",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationStatus::Succeeded | OperationStatus::Failed)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks one lifecycle action from issue to outcome.
///
/// Only the worker that owns an operation advances it, and a terminal
/// operation is never written again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub operation_id: String,
    pub instance_id: String,
    pub operation_type: OperationType,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Operation {
    pub fn new(instance_id: impl Into<String>, operation_type: OperationType) -> Self {
        Self {
            operation_id: Uuid::new_v4().to_string(),
            instance_id: instance_id.into(),
            operation_type,
            status: OperationStatus::Pending,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn mark_running(&mut self) {
        if self.status == OperationStatus::Pending {
            self.status = OperationStatus::Running;
            self.started_at = Some(Utc::now());
        }
    }

    pub fn mark_succeeded(&mut self) {
        if !self.is_terminal() {
            self.status = OperationStatus::Succeeded;
            self.completed_at = Some(Utc::now());
        }
    }

    /// Blank messages are replaced so a failed operation always explains itself.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        let error = error.into();
        let error = if error.trim().is_empty() {
            format!("{} operation failed", self.operation_type)
        } else {
            error
        };
        self.status = OperationStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub instance_id: String,
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl Health {
    pub fn new(instance_id: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            instance_id: instance_id.into(),
            status,
            detail: None,
            checked_at: Utc::now(),
        }
    }

    pub fn unknown(instance_id: impl Into<String>) -> Self {
        Self::new(instance_id, HealthStatus::Unknown)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error_code: String,
    pub message: String,
    pub details: Option<HashMap<String, String>>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorResponse {
    pub fn new(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            message: message.into(),
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: HashMap<String, String>) -> Self {
        self.details = Some(details);
        self
    }
}
