use crate::features::observability::repo::ObservabilityRepository;
use crate::features::observability::service::ObservabilityService;
use crate::shared::types::{Decision, OperationStatus, OperationType};
use std::sync::Arc;

/// Metrics facade handed to the lifecycle manager and the HTTP layer.
///
/// Each controller owns its own registry, so several managers can coexist in
/// one process (tests do this constantly).
pub struct ObservabilityController {
    service: ObservabilityService,
}

impl ObservabilityController {
    pub fn new(service: ObservabilityService) -> Self {
        Self { service }
    }

    /// Builds a controller with a fresh registry.
    pub fn build() -> Result<Arc<Self>, String> {
        let repo = Arc::new(ObservabilityRepository::new()?);
        Ok(Arc::new(Self::new(ObservabilityService::new(repo))))
    }

    pub fn record_api_request(&self, endpoint: &str, status: &str, seconds: f64) {
        self.service.record_api_request(endpoint, status, seconds);
    }

    pub fn record_operation(&self, operation_type: OperationType, status: OperationStatus) {
        self.service.record_operation(operation_type, status);
    }

    pub fn record_policy_decision(&self, decision: Decision) {
        self.service.record_policy_decision(decision);
    }

    pub fn set_running_instances(&self, count: usize) {
        self.service.set_running_instances(count);
    }

    pub fn record_probe_failure(&self) {
        self.service.record_probe_failure();
    }

    pub fn render_metrics(&self) -> Result<String, String> {
        self.service.render_metrics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_contains_known_metric_names() {
        let controller = ObservabilityController::build().unwrap();
        controller.record_api_request("list_instances", "200", 0.01);
        controller.record_operation(OperationType::Install, OperationStatus::Failed);
        controller.record_policy_decision(Decision::Deny);
        controller.set_running_instances(2);
        controller.record_probe_failure();

        let rendered = controller.render_metrics().unwrap();
        assert!(rendered.contains("conduit_api_request_total"));
        assert!(rendered.contains("conduit_operations_total"));
        assert!(rendered.contains("conduit_policy_decisions_total{decision=\"deny\"} 1"));
        assert!(rendered.contains("conduit_running_instances 2"));
        assert!(rendered.contains("conduit_health_probe_failures_total 1"));
    }
}
