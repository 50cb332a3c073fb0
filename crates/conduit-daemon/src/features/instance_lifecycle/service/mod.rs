pub mod operations;

pub use operations::{InstanceLocks, OperationTracker, TrackedOperation};

use crate::features::health::repo::HealthRepository;
use crate::features::health::service::HealthService;
use crate::features::instance_lifecycle::repo::Store;
use crate::features::observability::controller::ObservabilityController;
use crate::features::policy::service::PolicyEngine;
use crate::features::provisioning::repo::{ProvisionSpec, Provisioner};
use crate::features::provisioning::service::{wait_for_cancel, CancelSignal, ProvisioningService};
use crate::shared::config::{
    DaemonConfig, DEFAULT_HEALTH_INTERVAL_SECS, DEFAULT_OPERATION_TIMEOUT_SECS,
};
use crate::shared::error::{DaemonError, DaemonResult};
use crate::shared::types::{
    CreateInstanceRequest, EventLog, Health, Instance, InstanceStatus, LifecycleEvent,
    Operation, OperationStatus, OperationType, PolicyDecision, PolicyRequest, PolicyScope,
};
use conduit_core::lifecycle::allowed_sources;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const MAX_ID_LEN: usize = 128;
const MAX_DISPLAY_NAME_LEN: usize = 256;
const DEFAULT_EVENT_CAPACITY: usize = 4096;

/// Tunables for a [`LifecycleManager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub operation_timeout: Duration,
    pub health_interval: Duration,
    pub event_capacity: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(DEFAULT_OPERATION_TIMEOUT_SECS),
            health_interval: Duration::from_secs(DEFAULT_HEALTH_INTERVAL_SECS),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl From<&DaemonConfig> for ManagerOptions {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            operation_timeout: config.operation_timeout,
            health_interval: config.health_interval,
            ..Self::default()
        }
    }
}

struct ManagerInner {
    store: Arc<dyn Store>,
    policy: Arc<PolicyEngine>,
    provisioning: Arc<ProvisioningService>,
    health: HealthService,
    tracker: Arc<OperationTracker>,
    locks: InstanceLocks,
    events: EventLog,
    metrics: Arc<ObservabilityController>,
    health_interval: watch::Sender<Duration>,
}

/// Orchestrates instance state transitions.
///
/// Cheap to clone; every clone drives the same store, workers and locks.
/// Mutating operations return a Pending [`Operation`] at once and finish on a
/// spawned worker that holds the instance lock while it runs.
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<ManagerInner>,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn Store>,
        policy: Arc<PolicyEngine>,
        provisioner: Arc<dyn Provisioner>,
        metrics: Arc<ObservabilityController>,
        options: ManagerOptions,
    ) -> Self {
        let provisioning = Arc::new(ProvisioningService::new(
            provisioner,
            options.operation_timeout,
        ));
        let events = EventLog::with_capacity(options.event_capacity);
        let health = HealthService::new(
            provisioning.clone(),
            HealthRepository::new(),
            events.clone(),
            metrics.clone(),
        );
        let (health_interval, _) = watch::channel(options.health_interval);

        Self {
            inner: Arc::new(ManagerInner {
                store,
                policy,
                provisioning,
                health,
                tracker: OperationTracker::new(),
                locks: InstanceLocks::new(),
                events,
                metrics,
                health_interval,
            }),
        }
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.inner.store.clone()
    }

    pub fn policy(&self) -> Arc<PolicyEngine> {
        self.inner.policy.clone()
    }

    pub fn metrics(&self) -> Arc<ObservabilityController> {
        self.inner.metrics.clone()
    }

    // ---- instances ----

    /// Validate and persist a new instance in `Created`.
    pub async fn create_instance(&self, request: CreateInstanceRequest) -> DaemonResult<Instance> {
        let package_id = request.package_id.trim();
        let version = request.version.trim();
        let image_ref = request.image_ref.trim();

        validate_identifier("package_id", package_id, is_package_char)?;
        validate_identifier("version", version, is_version_char)?;
        if image_ref.is_empty() {
            return Err(DaemonError::ValidationError(
                "image_ref cannot be empty".to_string(),
            ));
        }

        let display_name = match request.display_name.trim() {
            "" => package_id.to_string(),
            name => name.to_string(),
        };
        if display_name.chars().count() > MAX_DISPLAY_NAME_LEN {
            return Err(DaemonError::ValidationError(format!(
                "display_name exceeds {MAX_DISPLAY_NAME_LEN} characters"
            )));
        }

        let config = request.config.unwrap_or_default();
        if config.keys().any(|k| k.trim().is_empty()) {
            return Err(DaemonError::ValidationError(
                "config keys cannot be empty".to_string(),
            ));
        }

        let declared = request.permissions.normalized()?;

        let instance = Instance::new(package_id, version, display_name, image_ref)
            .with_config(config)
            .with_declared_permissions(declared);

        self.inner.store.save_instance(&instance).await?;
        self.inner
            .events
            .record(|r| r.record_created(&instance.instance_id));

        info!(
            instance_id = %instance.instance_id,
            package_id = %instance.package_id,
            version = %instance.version,
            "Instance created"
        );

        Ok(instance)
    }

    pub async fn get_instance(&self, instance_id: &str) -> DaemonResult<Instance> {
        self.inner
            .store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| DaemonError::InstanceNotFound(instance_id.to_string()))
    }

    pub async fn list_instances(&self) -> DaemonResult<Vec<Instance>> {
        self.inner.store.list_instances().await
    }

    /// Change the display name, the only mutable identity field.
    pub async fn rename_instance(
        &self,
        instance_id: &str,
        display_name: &str,
    ) -> DaemonResult<Instance> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(DaemonError::ValidationError(
                "display_name cannot be empty".to_string(),
            ));
        }
        if display_name.chars().count() > MAX_DISPLAY_NAME_LEN {
            return Err(DaemonError::ValidationError(format!(
                "display_name exceeds {MAX_DISPLAY_NAME_LEN} characters"
            )));
        }

        let _guard = self.inner.locks.acquire(instance_id).await;
        let mut instance = self.get_instance(instance_id).await?;
        instance.display_name = display_name.to_string();
        instance.updated_at = chrono::Utc::now();
        self.inner.store.save_instance(&instance).await?;

        info!(instance_id = %instance_id, display_name = %display_name, "Instance renamed");
        Ok(instance)
    }

    pub async fn install_instance(&self, instance_id: &str) -> DaemonResult<Operation> {
        self.issue(instance_id, OperationType::Install).await
    }

    pub async fn start_instance(&self, instance_id: &str) -> DaemonResult<Operation> {
        self.issue(instance_id, OperationType::Start).await
    }

    pub async fn stop_instance(&self, instance_id: &str) -> DaemonResult<Operation> {
        self.issue(instance_id, OperationType::Stop).await
    }

    /// Remove an instance synchronously.
    ///
    /// Waits for in-flight work on the instance, force-stops it if running,
    /// tears down provisioned resources (failures are logged, not returned),
    /// records a terminal Remove operation and deletes the record.
    pub async fn remove_instance(&self, instance_id: &str) -> DaemonResult<()> {
        let _guard = self.inner.locks.acquire(instance_id).await;
        let mut instance = self.get_instance(instance_id).await?;

        let mut operation = Operation::new(instance_id, OperationType::Remove);
        operation.mark_running();
        // Removal is not interruptible; the registration only keeps other
        // callers from finishing the record.
        let _tracked = self.inner.tracker.register(&operation.operation_id);
        self.inner.store.save_operation(&operation).await?;
        self.inner
            .events
            .record(|r| r.record_operation_started(&operation));

        let result = self.remove_locked(&mut instance).await;

        match &result {
            Ok(()) => operation.mark_succeeded(),
            Err(e) => operation.mark_failed(e.to_string()),
        }
        self.finish_operation(&operation).await;

        if result.is_ok() {
            self.inner.locks.forget(instance_id);
            self.inner.health.forget(instance_id);
            self.inner
                .events
                .record(|r| r.record_removed(instance_id));
            info!(instance_id = %instance_id, "Instance removed");
        }
        result
    }

    async fn remove_locked(&self, instance: &mut Instance) -> DaemonResult<()> {
        let instance_id = instance.instance_id.clone();

        // Interrupted work (for example after a restart) leaves a transitional status behind.
        if instance.status.is_transitional() {
            instance.transition("remove", InstanceStatus::Failed)?;
        }

        if instance.status == InstanceStatus::Running {
            instance.transition("remove", InstanceStatus::Stopping)?;
            match self.inner.provisioning.force_stop(&instance_id).await {
                Ok(()) => instance.transition("remove", InstanceStatus::Stopped)?,
                Err(e) => {
                    warn!(instance_id = %instance_id, error = %e, "Force stop failed during removal");
                    instance.transition("remove", InstanceStatus::Failed)?;
                }
            }
        }

        if let Err(e) = self.inner.provisioning.teardown(&instance_id).await {
            warn!(instance_id = %instance_id, error = %e, "Teardown failed during removal");
        }

        instance.transition("remove", InstanceStatus::Removed)?;
        self.inner.store.delete_instance(&instance_id).await?;
        self.refresh_running_gauge().await;
        Ok(())
    }

    // ---- operations ----

    pub async fn get_operation(&self, operation_id: &str) -> DaemonResult<Operation> {
        self.inner
            .store
            .get_operation(operation_id)
            .await?
            .ok_or_else(|| DaemonError::OperationNotFound(operation_id.to_string()))
    }

    /// All operations, oldest first, optionally for one instance only.
    pub async fn list_operations(&self, instance_id: Option<&str>) -> DaemonResult<Vec<Operation>> {
        let operations = self.inner.store.list_operations().await?;
        Ok(match instance_id {
            Some(id) => operations
                .into_iter()
                .filter(|op| op.instance_id == id)
                .collect(),
            None => operations,
        })
    }

    /// Ask the worker of a pending or running operation to give up. The
    /// operation turns Failed once the worker notices. Terminal operations
    /// are returned unchanged.
    pub async fn cancel_operation(&self, operation_id: &str) -> DaemonResult<Operation> {
        let operation = self.get_operation(operation_id).await?;
        if operation.is_terminal() {
            return Ok(operation);
        }

        if self.inner.tracker.cancel(operation_id) {
            info!(operation_id = %operation_id, "Cancellation requested");
            return Ok(operation);
        }

        // No worker owns it. Either it finished since the read above or it
        // was left over from an earlier daemon run.
        let Some(_claim) = self.inner.tracker.adopt(operation_id) else {
            return self.get_operation(operation_id).await;
        };
        let mut operation = self.get_operation(operation_id).await?;
        if operation.is_terminal() {
            return Ok(operation);
        }
        operation.mark_failed("operation cancelled");
        self.finish_operation(&operation).await;
        Ok(operation)
    }

    /// Waits until every operation issued before this call is terminal.
    pub async fn wait_for_operations(&self) {
        self.inner.tracker.wait_for_in_flight().await;
    }

    /// Signals every in-flight operation to cancel.
    pub fn cancel_all_operations(&self) -> usize {
        self.inner.tracker.cancel_all()
    }

    pub fn in_flight_operations(&self) -> usize {
        self.inner.tracker.in_flight_count()
    }

    /// Fails operations and transitional instances left behind by a previous
    /// run. Call once at startup before serving requests.
    pub async fn recover_interrupted(&self) -> DaemonResult<usize> {
        let mut recovered = 0;

        for listed in self.inner.store.list_operations().await? {
            if listed.is_terminal() {
                continue;
            }
            let Some(_claim) = self.inner.tracker.adopt(&listed.operation_id) else {
                continue;
            };
            let Some(mut operation) = self.inner.store.get_operation(&listed.operation_id).await?
            else {
                continue;
            };
            if operation.is_terminal() {
                continue;
            }
            operation.mark_failed("operation interrupted by daemon restart");
            self.inner.store.save_operation(&operation).await?;
            recovered += 1;
        }

        for mut instance in self.inner.store.list_instances().await? {
            if !instance.status.is_transitional() {
                continue;
            }
            let _guard = self.inner.locks.acquire(&instance.instance_id).await;
            instance.transition("recover", InstanceStatus::Failed)?;
            instance.last_error = Some("interrupted by daemon restart".to_string());
            self.inner.store.save_instance(&instance).await?;
            recovered += 1;
        }

        if recovered > 0 {
            warn!(count = recovered, "Recovered interrupted lifecycle work");
        }
        self.refresh_running_gauge().await;
        Ok(recovered)
    }

    // ---- health & events ----

    pub async fn check_health(&self, instance_id: &str) -> DaemonResult<Health> {
        let instance = self.get_instance(instance_id).await?;
        Ok(self.inner.health.check(&instance).await)
    }

    pub fn set_health_interval(&self, interval: Duration) -> DaemonResult<()> {
        if interval.is_zero() {
            return Err(DaemonError::ValidationError(
                "health interval must be greater than zero".to_string(),
            ));
        }
        self.inner.health_interval.send_replace(interval);
        info!(interval_secs = interval.as_secs_f64(), "Health interval updated");
        Ok(())
    }

    pub fn health_interval(&self) -> Duration {
        *self.inner.health_interval.borrow()
    }

    /// Receiver that observes every interval change.
    pub fn subscribe_health_interval(&self) -> watch::Receiver<Duration> {
        self.inner.health_interval.subscribe()
    }

    /// Chronological history for an instance, including removed ones that
    /// still have events in the buffer.
    pub async fn instance_events(&self, instance_id: &str) -> DaemonResult<Vec<LifecycleEvent>> {
        let events = self.inner.events.events_for_instance(instance_id);
        if events.is_empty() {
            self.get_instance(instance_id).await?;
        }
        Ok(events)
    }

    // ---- workers ----

    async fn issue(&self, instance_id: &str, operation_type: OperationType) -> DaemonResult<Operation> {
        let instance = self.get_instance(instance_id).await?;
        ensure_allowed(&instance, operation_type)?;

        let operation = Operation::new(instance_id, operation_type);
        // Registered first so a visible pending record always has an owner.
        let tracked = self.inner.tracker.register(&operation.operation_id);
        self.inner.store.save_operation(&operation).await?;

        info!(
            instance_id = %instance_id,
            operation_id = %operation.operation_id,
            operation_type = %operation_type,
            "Operation issued"
        );

        let manager = self.clone();
        let pending = operation.clone();
        tokio::spawn(async move {
            manager.run_operation(pending, tracked).await;
        });

        Ok(operation)
    }

    async fn run_operation(&self, mut operation: Operation, mut tracked: TrackedOperation) {
        let instance_id = operation.instance_id.clone();

        let guard = tokio::select! {
            biased;
            _ = wait_for_cancel(tracked.cancel_signal()) => None,
            guard = self.inner.locks.acquire(&instance_id) => Some(guard),
        };

        let Some(_guard) = guard else {
            operation.mark_failed("operation cancelled before it started");
            self.finish_operation(&operation).await;
            return;
        };

        operation.mark_running();
        if let Err(e) = self.inner.store.save_operation(&operation).await {
            error!(operation_id = %operation.operation_id, error = %e, "Failed to persist running operation");
        }
        self.inner
            .events
            .record(|r| r.record_operation_started(&operation));

        let cancel = tracked.cancel_signal();
        let result = match operation.operation_type {
            OperationType::Install => self.install_locked(&instance_id, cancel).await,
            OperationType::Start => self.start_locked(&instance_id, cancel).await,
            OperationType::Stop => self.stop_locked(&instance_id, cancel).await,
            OperationType::Remove => Err(DaemonError::ValidationError(
                "remove runs synchronously".to_string(),
            )),
        };

        match result {
            Ok(()) => operation.mark_succeeded(),
            Err(e) => operation.mark_failed(e.to_string()),
        }
        self.finish_operation(&operation).await;
        self.refresh_running_gauge().await;
        // `tracked` drops here, after the terminal record is persisted.
    }

    async fn install_locked(&self, instance_id: &str, cancel: &mut CancelSignal) -> DaemonResult<()> {
        let mut instance = self.get_instance(instance_id).await?;
        ensure_allowed(&instance, OperationType::Install)?;

        instance.last_error = None;
        instance.transition("install", InstanceStatus::Installing)?;
        self.inner.store.save_instance(&instance).await?;

        let request = PolicyRequest::new(
            PolicyScope::Install,
            instance_id,
            instance.package_id.clone(),
            instance.declared_permissions.clone(),
        );
        let decision = match self.decide(&request) {
            Ok(decision) => decision,
            Err(e) => return self.fail_instance(&mut instance, e).await,
        };
        if decision.is_denied() {
            let err = DaemonError::PolicyDenied {
                reasons: decision.block_reasons,
            };
            return self.fail_instance(&mut instance, err).await;
        }

        instance.granted_permissions = decision.granted.unwrap_or_default();
        instance.updated_at = chrono::Utc::now();
        self.inner.store.save_instance(&instance).await?;

        let spec = ProvisionSpec::from_instance(&instance);
        if let Err(e) = self.inner.provisioning.prepare(&spec, cancel).await {
            return self.fail_instance(&mut instance, e).await;
        }

        instance.transition("install", InstanceStatus::Installed)?;
        self.inner.store.save_instance(&instance).await?;
        Ok(())
    }

    async fn start_locked(&self, instance_id: &str, cancel: &mut CancelSignal) -> DaemonResult<()> {
        let mut instance = self.get_instance(instance_id).await?;
        ensure_allowed(&instance, OperationType::Start)?;

        instance.last_error = None;
        instance.transition("start", InstanceStatus::Starting)?;
        self.inner.store.save_instance(&instance).await?;

        let request = PolicyRequest::new(
            PolicyScope::Runtime,
            instance_id,
            instance.package_id.clone(),
            instance.granted_permissions.clone(),
        );
        let decision = match self.decide(&request) {
            Ok(decision) => decision,
            Err(e) => return self.fail_instance(&mut instance, e).await,
        };
        if decision.is_denied() {
            let err = DaemonError::PolicyDenied {
                reasons: decision.block_reasons,
            };
            return self.fail_instance(&mut instance, err).await;
        }

        let spec = ProvisionSpec::from_instance(&instance);
        if let Err(e) = self.inner.provisioning.start(&spec, cancel).await {
            return self.fail_instance(&mut instance, e).await;
        }

        instance.transition("start", InstanceStatus::Running)?;
        self.inner.store.save_instance(&instance).await?;
        Ok(())
    }

    async fn stop_locked(&self, instance_id: &str, cancel: &mut CancelSignal) -> DaemonResult<()> {
        let mut instance = self.get_instance(instance_id).await?;
        ensure_allowed(&instance, OperationType::Stop)?;

        instance.transition("stop", InstanceStatus::Stopping)?;
        self.inner.store.save_instance(&instance).await?;

        if let Err(e) = self.inner.provisioning.stop(instance_id, cancel).await {
            return self.fail_instance(&mut instance, e).await;
        }

        instance.transition("stop", InstanceStatus::Stopped)?;
        self.inner.store.save_instance(&instance).await?;
        Ok(())
    }

    fn decide(&self, request: &PolicyRequest) -> DaemonResult<PolicyDecision> {
        let decision = self.inner.policy.evaluate(request)?;
        self.inner.metrics.record_policy_decision(decision.decision);
        for warning in &decision.warnings {
            warn!(
                instance_id = %request.instance_id,
                scope = %request.scope,
                warning = %warning,
                "Policy warning"
            );
        }
        Ok(decision)
    }

    /// Moves a mid-transition instance to `Failed` and returns `err`.
    async fn fail_instance(&self, instance: &mut Instance, err: DaemonError) -> DaemonResult<()> {
        warn!(instance_id = %instance.instance_id, error = %err, "Lifecycle step failed");

        instance.transition("fail", InstanceStatus::Failed)?;
        instance.last_error = Some(err.to_string());
        self.inner.store.save_instance(instance).await?;
        Err(err)
    }

    async fn finish_operation(&self, operation: &Operation) {
        if let Err(e) = self.inner.store.save_operation(operation).await {
            error!(
                operation_id = %operation.operation_id,
                error = %e,
                "Failed to persist terminal operation"
            );
        }
        self.inner
            .events
            .record(|r| r.record_operation_finished(operation));
        self.inner
            .metrics
            .record_operation(operation.operation_type, operation.status);

        match operation.status {
            OperationStatus::Failed => warn!(
                instance_id = %operation.instance_id,
                operation_id = %operation.operation_id,
                operation_type = %operation.operation_type,
                error = operation.error.as_deref().unwrap_or_default(),
                "Operation failed"
            ),
            _ => info!(
                instance_id = %operation.instance_id,
                operation_id = %operation.operation_id,
                operation_type = %operation.operation_type,
                "Operation succeeded"
            ),
        }
    }

    async fn refresh_running_gauge(&self) {
        match self.inner.store.list_instances().await {
            Ok(instances) => {
                let running = instances
                    .iter()
                    .filter(|i| i.status == InstanceStatus::Running)
                    .count();
                self.inner.metrics.set_running_instances(running);
            }
            Err(e) => warn!(error = %e, "Failed to refresh running instance gauge"),
        }
    }
}

fn ensure_allowed(instance: &Instance, operation_type: OperationType) -> DaemonResult<()> {
    if allowed_sources(operation_type).contains(&instance.status) {
        Ok(())
    } else {
        Err(DaemonError::InvalidState {
            instance_id: instance.instance_id.clone(),
            action: operation_type.to_string(),
            status: instance.status,
        })
    }
}

fn is_package_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '@' | '-')
}

fn is_version_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '_' | '-')
}

/// Non-empty, bounded, starts alphanumeric, then only `allowed` characters.
fn validate_identifier(field: &str, value: &str, allowed: fn(char) -> bool) -> DaemonResult<()> {
    if value.is_empty() {
        return Err(DaemonError::ValidationError(format!(
            "{field} cannot be empty"
        )));
    }
    if value.len() > MAX_ID_LEN {
        return Err(DaemonError::ValidationError(format!(
            "{field} exceeds {MAX_ID_LEN} characters"
        )));
    }
    let mut chars = value.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    if !first_ok || !chars.all(allowed) {
        return Err(DaemonError::ValidationError(format!(
            "{field} contains invalid characters: {value:?}"
        )));
    }
    Ok(())
}
