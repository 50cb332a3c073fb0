use crate::features::health::repo::HealthRepository;
use crate::features::observability::controller::ObservabilityController;
use crate::features::provisioning::service::ProvisioningService;
use crate::shared::types::{EventLog, Health, HealthStatus, Instance, InstanceStatus};
use std::sync::Arc;
use tracing::{debug, warn};

/// Probes instances and remembers the outcome. Never changes lifecycle status.
pub struct HealthService {
    provisioning: Arc<ProvisioningService>,
    repo: HealthRepository,
    events: EventLog,
    metrics: Arc<ObservabilityController>,
}

impl HealthService {
    pub fn new(
        provisioning: Arc<ProvisioningService>,
        repo: HealthRepository,
        events: EventLog,
        metrics: Arc<ObservabilityController>,
    ) -> Self {
        Self {
            provisioning,
            repo,
            events,
            metrics,
        }
    }

    /// `Unknown` unless the instance is running, otherwise the probe result.
    /// A probe error counts as unhealthy and is carried in `detail`.
    pub async fn check(&self, instance: &Instance) -> Health {
        let instance_id = instance.instance_id.as_str();

        let health = if instance.status != InstanceStatus::Running {
            Health::unknown(instance_id)
                .with_detail(format!("instance is {}", instance.status))
        } else {
            match self.provisioning.probe(instance_id).await {
                Ok(HealthStatus::Healthy) => Health::new(instance_id, HealthStatus::Healthy),
                Ok(status) => {
                    self.metrics.record_probe_failure();
                    Health::new(instance_id, status).with_detail("workload is not running")
                }
                Err(e) => {
                    self.metrics.record_probe_failure();
                    warn!(instance_id = %instance_id, error = %e, "Health probe failed");
                    Health::new(instance_id, HealthStatus::Unhealthy).with_detail(e.to_string())
                }
            }
        };

        let previous = self.repo.record(health.clone());
        let changed = previous.map_or(true, |p| p.status != health.status);
        if changed {
            debug!(instance_id = %instance_id, status = %health.status, "Health changed");
            self.events
                .record(|r| r.record_health_change(instance_id, health.status));
        }

        health
    }

    pub fn latest(&self, instance_id: &str) -> Option<Health> {
        self.repo.latest(instance_id)
    }

    pub fn forget(&self, instance_id: &str) {
        self.repo.forget(instance_id);
    }
}
