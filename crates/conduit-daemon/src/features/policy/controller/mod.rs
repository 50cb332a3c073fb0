use crate::features::policy::service::PolicyEngine;
use crate::shared::types::{PolicyDecision, PolicyRequest};
use std::sync::Arc;
use tracing::info;

/// Controller for dry-run policy evaluation
pub struct PolicyController {
    engine: Arc<PolicyEngine>,
}

impl PolicyController {
    pub fn new(engine: Arc<PolicyEngine>) -> Self {
        Self { engine }
    }

    /// Evaluate a request without touching any instance
    pub fn evaluate(
        &self,
        request: PolicyRequest,
    ) -> Result<PolicyDecision, conduit_core::ErrorResponse> {
        info!(
            scope = %request.scope,
            package_id = %request.package_id,
            "Received policy evaluation request"
        );

        self.engine.evaluate(&request).map_err(|e| e.into())
    }
}
