use crate::features::observability::repo::ObservabilityRepository;
use crate::shared::types::{Decision, OperationStatus, OperationType};
use std::sync::Arc;

pub struct ObservabilityService {
    repo: Arc<ObservabilityRepository>,
}

impl ObservabilityService {
    pub fn new(repo: Arc<ObservabilityRepository>) -> Self {
        Self { repo }
    }

    pub fn record_api_request(&self, endpoint: &str, status: &str, seconds: f64) {
        self.repo.observe_api_request(endpoint, status, seconds);
    }

    pub fn record_operation(&self, operation_type: OperationType, status: OperationStatus) {
        self.repo
            .inc_operation(&operation_type.to_string(), &status.to_string());
    }

    pub fn record_policy_decision(&self, decision: Decision) {
        self.repo.inc_policy_decision(&decision.to_string());
    }

    pub fn set_running_instances(&self, count: usize) {
        self.repo.set_running_instances(count as f64);
    }

    pub fn record_probe_failure(&self) {
        self.repo.inc_health_probe_failures();
    }

    pub fn render_metrics(&self) -> Result<String, String> {
        self.repo.render_metrics()
    }
}
