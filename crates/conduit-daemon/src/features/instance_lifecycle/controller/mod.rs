use crate::features::instance_lifecycle::service::LifecycleManager;
use crate::shared::types::{
    CreateInstanceRequest, Health, HealthIntervalRequest, Instance, LifecycleEvent,
    ListOperationsQuery, Operation, RenameInstanceRequest,
};
use conduit_core::ErrorResponse;
use std::time::Duration;
use tracing::info;

/// Controller for instance and operation API endpoints
#[derive(Clone)]
pub struct InstanceController {
    manager: LifecycleManager,
}

impl InstanceController {
    pub fn new(manager: LifecycleManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &LifecycleManager {
        &self.manager
    }

    /// Handle create instance request
    pub async fn create_instance(
        &self,
        request: CreateInstanceRequest,
    ) -> Result<Instance, ErrorResponse> {
        info!(package_id = %request.package_id, "Received create instance request");

        self.manager
            .create_instance(request)
            .await
            .map_err(|e| e.into())
    }

    pub async fn get_instance(&self, instance_id: &str) -> Result<Instance, ErrorResponse> {
        self.manager
            .get_instance(instance_id)
            .await
            .map_err(|e| e.into())
    }

    pub async fn list_instances(&self) -> Result<Vec<Instance>, ErrorResponse> {
        self.manager.list_instances().await.map_err(|e| e.into())
    }

    pub async fn rename_instance(
        &self,
        instance_id: &str,
        request: RenameInstanceRequest,
    ) -> Result<Instance, ErrorResponse> {
        info!(instance_id = %instance_id, "Received rename instance request");

        self.manager
            .rename_instance(instance_id, &request.display_name)
            .await
            .map_err(|e| e.into())
    }

    /// Handle install request. The returned operation is still pending.
    pub async fn install_instance(&self, instance_id: &str) -> Result<Operation, ErrorResponse> {
        info!(instance_id = %instance_id, "Received install instance request");

        self.manager
            .install_instance(instance_id)
            .await
            .map_err(|e| e.into())
    }

    pub async fn start_instance(&self, instance_id: &str) -> Result<Operation, ErrorResponse> {
        info!(instance_id = %instance_id, "Received start instance request");

        self.manager
            .start_instance(instance_id)
            .await
            .map_err(|e| e.into())
    }

    pub async fn stop_instance(&self, instance_id: &str) -> Result<Operation, ErrorResponse> {
        info!(instance_id = %instance_id, "Received stop instance request");

        self.manager
            .stop_instance(instance_id)
            .await
            .map_err(|e| e.into())
    }

    pub async fn remove_instance(&self, instance_id: &str) -> Result<(), ErrorResponse> {
        info!(instance_id = %instance_id, "Received remove instance request");

        self.manager
            .remove_instance(instance_id)
            .await
            .map_err(|e| e.into())
    }

    pub async fn check_health(&self, instance_id: &str) -> Result<Health, ErrorResponse> {
        self.manager
            .check_health(instance_id)
            .await
            .map_err(|e| e.into())
    }

    pub async fn instance_events(
        &self,
        instance_id: &str,
    ) -> Result<Vec<LifecycleEvent>, ErrorResponse> {
        self.manager
            .instance_events(instance_id)
            .await
            .map_err(|e| e.into())
    }

    pub fn set_health_interval(&self, request: HealthIntervalRequest) -> Result<(), ErrorResponse> {
        info!(interval_secs = request.interval_secs, "Received health interval update");

        self.manager
            .set_health_interval(Duration::from_secs(request.interval_secs))
            .map_err(|e| e.into())
    }

    pub async fn get_operation(&self, operation_id: &str) -> Result<Operation, ErrorResponse> {
        self.manager
            .get_operation(operation_id)
            .await
            .map_err(|e| e.into())
    }

    pub async fn list_operations(
        &self,
        query: ListOperationsQuery,
    ) -> Result<Vec<Operation>, ErrorResponse> {
        self.manager
            .list_operations(query.instance_id.as_deref())
            .await
            .map_err(|e| e.into())
    }

    pub async fn cancel_operation(&self, operation_id: &str) -> Result<Operation, ErrorResponse> {
        info!(operation_id = %operation_id, "Received cancel operation request");

        self.manager
            .cancel_operation(operation_id)
            .await
            .map_err(|e| e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::instance_lifecycle::repo::InMemoryStore;
    use crate::features::instance_lifecycle::service::ManagerOptions;
    use crate::features::observability::controller::ObservabilityController;
    use crate::features::policy::repo::PolicyRules;
    use crate::features::policy::service::PolicyEngine;
    use crate::features::provisioning::repo::InMemoryProvisioner;
    use crate::shared::types::{HealthStatus, InstanceStatus, OperationStatus, PermissionSet};
    use std::sync::Arc;

    fn create_test_controller() -> InstanceController {
        let manager = LifecycleManager::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(PolicyEngine::with_home(PolicyRules::default(), None).unwrap()),
            Arc::new(InMemoryProvisioner::new()),
            ObservabilityController::build().unwrap(),
            ManagerOptions::default(),
        );
        InstanceController::new(manager)
    }

    fn create_request() -> CreateInstanceRequest {
        CreateInstanceRequest::new("acme/files", "1.0.0", "ghcr.io/acme/files:1.0.0")
    }

    #[tokio::test]
    async fn test_controller_create_and_get_instance() {
        let controller = create_test_controller();

        let instance = controller.create_instance(create_request()).await.unwrap();
        let fetched = controller.get_instance(&instance.instance_id).await.unwrap();
        assert_eq!(fetched.instance_id, instance.instance_id);
        assert_eq!(controller.list_instances().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_controller_full_workflow() {
        let controller = create_test_controller();
        let instance = controller.create_instance(create_request()).await.unwrap();
        let id = instance.instance_id.as_str();

        let install = controller.install_instance(id).await.unwrap();
        controller.manager().wait_for_operations().await;
        let start = controller.start_instance(id).await.unwrap();
        controller.manager().wait_for_operations().await;

        assert_eq!(
            controller.get_instance(id).await.unwrap().status,
            InstanceStatus::Running
        );
        assert_eq!(
            controller.check_health(id).await.unwrap().status,
            HealthStatus::Healthy
        );

        let operations = controller
            .list_operations(ListOperationsQuery {
                instance_id: Some(id.to_string()),
            })
            .await
            .unwrap();
        let ids: Vec<_> = operations.iter().map(|op| op.operation_id.clone()).collect();
        assert_eq!(ids, vec![install.operation_id, start.operation_id]);
        assert!(operations
            .iter()
            .all(|op| op.status == OperationStatus::Succeeded));

        controller.remove_instance(id).await.unwrap();
        assert!(controller.get_instance(id).await.is_err());
    }

    #[tokio::test]
    async fn test_controller_error_conversion() {
        let controller = create_test_controller();

        let error = controller.stop_instance("nonexistent").await.unwrap_err();
        assert_eq!(error.error_code, "INSTANCE_NOT_FOUND");

        let error = controller.get_operation("nonexistent").await.unwrap_err();
        assert_eq!(error.error_code, "OPERATION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_controller_invalid_state_carries_details() {
        let controller = create_test_controller();
        let instance = controller.create_instance(create_request()).await.unwrap();

        let error = controller
            .stop_instance(&instance.instance_id)
            .await
            .unwrap_err();
        assert_eq!(error.error_code, "INVALID_STATE");
        let details = error.details.unwrap();
        assert_eq!(details.get("status").map(String::as_str), Some("created"));
    }

    #[tokio::test]
    async fn test_controller_validation_error() {
        let controller = create_test_controller();

        let request =
            create_request().with_permissions(PermissionSet::new().with_readonly_path("etc"));
        let error = controller.create_instance(request).await.unwrap_err();
        assert_eq!(error.error_code, "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_controller_rename() {
        let controller = create_test_controller();
        let instance = controller.create_instance(create_request()).await.unwrap();

        let renamed = controller
            .rename_instance(
                &instance.instance_id,
                RenameInstanceRequest {
                    display_name: "Team files".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.display_name, "Team files");
    }
}
