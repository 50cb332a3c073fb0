use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub use conduit_core::{
    Decision, Health, HealthStatus, Instance, InstanceStatus, LifecycleEvent,
    LifecycleEventRecorder, NetworkEgress, Operation, OperationStatus, OperationType,
    PermissionSet, PolicyDecision, PolicyRequest, PolicyScope,
};

/// Request to create a new connector instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    pub package_id: String,
    pub version: String,
    #[serde(default)]
    pub display_name: String,
    pub image_ref: String,
    #[serde(default)]
    pub config: Option<BTreeMap<String, String>>,
    /// Capabilities the package declares it needs.
    #[serde(default)]
    pub permissions: PermissionSet,
}

impl CreateInstanceRequest {
    pub fn new(
        package_id: impl Into<String>,
        version: impl Into<String>,
        image_ref: impl Into<String>,
    ) -> Self {
        Self {
            package_id: package_id.into(),
            version: version.into(),
            image_ref: image_ref.into(),
            ..Self::default()
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn with_config(mut self, config: BTreeMap<String, String>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_permissions(mut self, permissions: PermissionSet) -> Self {
        self.permissions = permissions;
        self
    }
}

/// Request to change an instance's display name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameInstanceRequest {
    pub display_name: String,
}

/// Filter for listing operations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListOperationsQuery {
    #[serde(default)]
    pub instance_id: Option<String>,
}

/// Request to change the background health check cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthIntervalRequest {
    pub interval_secs: u64,
}

/// Shared handle to the in-memory lifecycle event history.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    recorder: Arc<Mutex<LifecycleEventRecorder>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            recorder: Arc::new(Mutex::new(LifecycleEventRecorder::with_capacity(capacity))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleEventRecorder> {
        self.recorder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, f: impl FnOnce(&mut LifecycleEventRecorder)) {
        f(&mut self.lock());
    }

    pub fn events_for_instance(&self, instance_id: &str) -> Vec<LifecycleEvent> {
        self.lock()
            .get_events_for_instance(instance_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_deserializes_with_defaults() {
        let request: CreateInstanceRequest = serde_json::from_str(
            r#"{"package_id": "acme/files", "version": "1.0.0", "image_ref": "ghcr.io/acme/files:1"}"#,
        )
        .unwrap();
        assert_eq!(request.display_name, "");
        assert!(request.config.is_none());
        assert!(request.permissions.is_empty());
    }

    #[test]
    fn test_event_log_is_shared_between_clones() {
        let log = EventLog::with_capacity(8);
        let other = log.clone();

        other.record(|r| r.record_created("abc"));
        log.record(|r| r.record_removed("abc"));
        log.record(|r| r.record_created("def"));

        let events = log.events_for_instance("abc");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "instance_created");
        assert_eq!(events[1].event_type, "instance_removed");
        assert_eq!(other.len(), 3);
    }
}
