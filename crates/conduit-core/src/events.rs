use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::{HealthStatus, Operation};

const DEFAULT_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub event_type: String,
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, String>>,
}

impl LifecycleEvent {
    pub fn new(event_type: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            instance_id: instance_id.into(),
            operation_id: None,
            timestamp: Utc::now(),
            details: None,
        }
    }

    pub fn for_operation(event_type: impl Into<String>, operation: &Operation) -> Self {
        let mut details = HashMap::new();
        details.insert("type".to_string(), operation.operation_type.to_string());
        Self {
            operation_id: Some(operation.operation_id.clone()),
            ..Self::new(event_type, operation.instance_id.clone())
        }
        .with_details(details)
    }

    pub fn with_details(mut self, details: HashMap<String, String>) -> Self {
        self.details = Some(details);
        self
    }
}

/// Bounded, chronological record of lifecycle facts. The oldest events are
/// dropped once `capacity` is reached.
#[derive(Debug)]
pub struct LifecycleEventRecorder {
    events: VecDeque<LifecycleEvent>,
    capacity: usize,
}

impl Default for LifecycleEventRecorder {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl LifecycleEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn record_event(&mut self, event: LifecycleEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn record_created(&mut self, instance_id: &str) {
        self.record_event(LifecycleEvent::new("instance_created", instance_id));
    }

    pub fn record_removed(&mut self, instance_id: &str) {
        self.record_event(LifecycleEvent::new("instance_removed", instance_id));
    }

    pub fn record_operation_started(&mut self, operation: &Operation) {
        self.record_event(LifecycleEvent::for_operation("operation_started", operation));
    }

    pub fn record_operation_finished(&mut self, operation: &Operation) {
        let event_type = match &operation.error {
            Some(_) => "operation_failed",
            None => "operation_succeeded",
        };
        let mut event = LifecycleEvent::for_operation(event_type, operation);
        if let (Some(error), Some(details)) = (&operation.error, event.details.as_mut()) {
            details.insert("error".to_string(), error.clone());
        }
        self.record_event(event);
    }

    pub fn record_health_change(&mut self, instance_id: &str, status: HealthStatus) {
        let mut details = HashMap::new();
        details.insert("status".to_string(), status.to_string());
        self.record_event(LifecycleEvent::new("health_changed", instance_id).with_details(details));
    }

    pub fn get_events(&self) -> Vec<&LifecycleEvent> {
        self.events.iter().collect()
    }

    pub fn get_events_for_instance(&self, instance_id: &str) -> Vec<&LifecycleEvent> {
        self.events
            .iter()
            .filter(|e| e.instance_id == instance_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}
