use crate::features::provisioning::repo::{ProvisionSpec, ProvisionStep, Provisioner};
use crate::shared::error::{DaemonError, DaemonResult};
use crate::shared::types::HealthStatus;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default)]
struct Provisioned {
    running: bool,
}

/// Provisioner that only tracks state in memory.
///
/// Steps can be scripted to fail or to take time, which is how lifecycle
/// failure, timeout and cancellation paths are exercised without a
/// container runtime.
#[derive(Default)]
pub struct InMemoryProvisioner {
    state: Mutex<HashMap<String, Provisioned>>,
    failures: Mutex<HashMap<ProvisionStep, String>>,
    delays: Mutex<HashMap<ProvisionStep, Duration>>,
    calls: Mutex<Vec<(ProvisionStep, String)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every later call of `step` fails with `message`.
    pub fn fail_step(&self, step: ProvisionStep, message: impl Into<String>) {
        lock(&self.failures).insert(step, message.into());
    }

    pub fn clear_failure(&self, step: ProvisionStep) {
        lock(&self.failures).remove(&step);
    }

    /// Every later call of `step` sleeps for `delay` first.
    pub fn delay_step(&self, step: ProvisionStep, delay: Duration) {
        lock(&self.delays).insert(step, delay);
    }

    pub fn clear_delay(&self, step: ProvisionStep) {
        lock(&self.delays).remove(&step);
    }

    /// Simulates the workload dying (or coming back) behind the manager's back.
    pub fn set_running(&self, instance_id: &str, running: bool) {
        if let Some(entry) = lock(&self.state).get_mut(instance_id) {
            entry.running = running;
        }
    }

    pub fn is_prepared(&self, instance_id: &str) -> bool {
        lock(&self.state).contains_key(instance_id)
    }

    pub fn is_running(&self, instance_id: &str) -> bool {
        lock(&self.state)
            .get(instance_id)
            .is_some_and(|p| p.running)
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<(ProvisionStep, String)> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self, step: ProvisionStep) -> usize {
        lock(&self.calls).iter().filter(|(s, _)| *s == step).count()
    }

    async fn enter(&self, step: ProvisionStep, instance_id: &str) -> DaemonResult<()> {
        lock(&self.calls).push((step, instance_id.to_string()));

        let delay = lock(&self.delays).get(&step).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match lock(&self.failures).get(&step) {
            Some(message) => Err(DaemonError::Provisioning(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Provisioner for InMemoryProvisioner {
    async fn prepare(&self, spec: &ProvisionSpec) -> DaemonResult<()> {
        self.enter(ProvisionStep::Prepare, &spec.instance_id).await?;
        lock(&self.state)
            .entry(spec.instance_id.clone())
            .or_default();
        Ok(())
    }

    async fn start(&self, spec: &ProvisionSpec) -> DaemonResult<()> {
        self.enter(ProvisionStep::Start, &spec.instance_id).await?;
        let mut state = lock(&self.state);
        match state.get_mut(&spec.instance_id) {
            Some(entry) => {
                entry.running = true;
                Ok(())
            }
            None => Err(DaemonError::Provisioning(format!(
                "instance {} has not been prepared",
                spec.instance_id
            ))),
        }
    }

    async fn stop(&self, instance_id: &str) -> DaemonResult<()> {
        self.enter(ProvisionStep::Stop, instance_id).await?;
        if let Some(entry) = lock(&self.state).get_mut(instance_id) {
            entry.running = false;
        }
        Ok(())
    }

    async fn teardown(&self, instance_id: &str) -> DaemonResult<()> {
        self.enter(ProvisionStep::Teardown, instance_id).await?;
        lock(&self.state).remove(instance_id);
        Ok(())
    }

    async fn probe(&self, instance_id: &str) -> DaemonResult<HealthStatus> {
        self.enter(ProvisionStep::Probe, instance_id).await?;
        if self.is_running(instance_id) {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Unhealthy)
        }
    }
}
