use crate::shared::types::Health;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Last probe result per instance
#[derive(Clone, Default)]
pub struct HealthRepository {
    latest: Arc<RwLock<HashMap<String, Health>>>,
}

impl HealthRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `health` and returns the result it replaced.
    pub fn record(&self, health: Health) -> Option<Health> {
        let mut latest = self
            .latest
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        latest.insert(health.instance_id.clone(), health)
    }

    pub fn latest(&self, instance_id: &str) -> Option<Health> {
        self.latest
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(instance_id)
            .cloned()
    }

    pub fn forget(&self, instance_id: &str) {
        self.latest
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(instance_id);
    }
}
