use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::features::instance_lifecycle::service::LifecycleManager;
use crate::shared::error::DaemonResult;
use crate::shared::types::InstanceStatus;

/// Periodically probes every running instance.
#[derive(Clone)]
pub struct HealthMonitor {
    manager: LifecycleManager,
}

impl HealthMonitor {
    pub fn new(manager: LifecycleManager) -> Self {
        Self { manager }
    }

    /// Runs until the returned handle is aborted. The monitor's manager keeps
    /// the interval sender alive, so the loop never ends on its own. An
    /// interval change restarts the current wait with the new period.
    pub fn spawn_periodic_checks(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval_rx = self.manager.subscribe_health_interval();
            loop {
                let period = *interval_rx.borrow_and_update();
                tokio::select! {
                    _ = time::sleep(period) => {
                        if let Err(error) = self.run_once().await {
                            warn!(error = %error, "Health sweep failed");
                        }
                    }
                    changed = interval_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        info!(interval_secs = interval_rx.borrow().as_secs_f64(), "Health monitor rescheduled");
                    }
                }
            }
        })
    }

    /// Checks every running instance once and returns how many were probed.
    pub async fn run_once(&self) -> DaemonResult<usize> {
        let mut checked = 0;
        for instance in self.manager.list_instances().await? {
            if instance.status != InstanceStatus::Running {
                continue;
            }
            match self.manager.check_health(&instance.instance_id).await {
                Ok(health) => {
                    debug!(instance_id = %instance.instance_id, status = %health.status, "Health checked");
                    checked += 1;
                }
                // Removed between listing and probing.
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(instance_id = %instance.instance_id, error = %e, "Health check failed"),
            }
        }
        Ok(checked)
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
    use crate::features::provisioning::repo::{InMemoryProvisioner, ProvisionStep};
    use crate::shared::types::{CreateInstanceRequest, OperationStatus};
    use std::time::Duration;

    fn manager(provisioner: Arc<InMemoryProvisioner>) -> LifecycleManager {
        LifecycleManager::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(PolicyEngine::with_home(PolicyRules::default(), None).unwrap()),
            provisioner,
            ObservabilityController::build().unwrap(),
            ManagerOptions {
                health_interval: Duration::from_secs(10),
                ..ManagerOptions::default()
            },
        )
    }

    async fn start_one(manager: &LifecycleManager) -> String {
        let instance = manager
            .create_instance(CreateInstanceRequest::new("acme/files", "1.0.0", "img"))
            .await
            .unwrap();
        let install = manager.install_instance(&instance.instance_id).await.unwrap();
        manager.wait_for_operations().await;
        let start = manager.start_instance(&instance.instance_id).await.unwrap();
        manager.wait_for_operations().await;

        for op in [install, start] {
            assert_eq!(
                manager.get_operation(&op.operation_id).await.unwrap().status,
                OperationStatus::Succeeded
            );
        }
        instance.instance_id
    }

    #[tokio::test]
    async fn test_run_once_probes_only_running_instances() {
        let provisioner = Arc::new(InMemoryProvisioner::new());
        let manager = manager(provisioner.clone());
        manager
            .create_instance(CreateInstanceRequest::new("acme/idle", "1.0.0", "img"))
            .await
            .unwrap();
        start_one(&manager).await;

        let monitor = HealthMonitor::new(manager);
        assert_eq!(monitor.run_once().await.unwrap(), 1);
        assert_eq!(provisioner.call_count(ProvisionStep::Probe), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_checks_follow_interval_changes() {
        let provisioner = Arc::new(InMemoryProvisioner::new());
        let manager = manager(provisioner.clone());
        start_one(&manager).await;

        let monitor = Arc::new(HealthMonitor::new(manager.clone()));
        let handle = monitor.spawn_periodic_checks();

        time::sleep(Duration::from_secs(11)).await;
        assert_eq!(provisioner.call_count(ProvisionStep::Probe), 1);

        manager.set_health_interval(Duration::from_secs(2)).unwrap();
        time::sleep(Duration::from_secs(5)).await;
        assert!(provisioner.call_count(ProvisionStep::Probe) >= 3);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_checks_run_until_aborted() {
        let manager = manager(Arc::new(InMemoryProvisioner::new()));
        let monitor = Arc::new(HealthMonitor::new(manager.clone()));
        let handle = monitor.spawn_periodic_checks();

        // Dropping the caller's manager does not end the loop.
        drop(manager);
        time::sleep(Duration::from_secs(60)).await;
        assert!(!handle.is_finished());

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
    }
}
