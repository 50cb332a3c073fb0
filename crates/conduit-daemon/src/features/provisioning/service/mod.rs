use crate::features::provisioning::repo::{ProvisionSpec, ProvisionStep, Provisioner};
use crate::shared::error::{DaemonError, DaemonResult};
use crate::shared::types::HealthStatus;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Receiving half of an operation's cancel flag.
pub type CancelSignal = watch::Receiver<bool>;

/// Runs provisioner calls under the operation timeout and a cancel signal.
pub struct ProvisioningService {
    provisioner: Arc<dyn Provisioner>,
    timeout: Duration,
}

impl ProvisioningService {
    pub fn new(provisioner: Arc<dyn Provisioner>, timeout: Duration) -> Self {
        Self {
            provisioner,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn prepare(
        &self,
        spec: &ProvisionSpec,
        cancel: &mut CancelSignal,
    ) -> DaemonResult<()> {
        self.guarded(ProvisionStep::Prepare, cancel, self.provisioner.prepare(spec))
            .await
    }

    pub async fn start(&self, spec: &ProvisionSpec, cancel: &mut CancelSignal) -> DaemonResult<()> {
        self.guarded(ProvisionStep::Start, cancel, self.provisioner.start(spec))
            .await
    }

    pub async fn stop(&self, instance_id: &str, cancel: &mut CancelSignal) -> DaemonResult<()> {
        self.guarded(ProvisionStep::Stop, cancel, self.provisioner.stop(instance_id))
            .await
    }

    /// Not cancellable: removal always tries to release resources.
    pub async fn teardown(&self, instance_id: &str) -> DaemonResult<()> {
        self.timed(ProvisionStep::Teardown, self.provisioner.teardown(instance_id))
            .await
    }

    /// Stop without a cancel signal, used when removal force-stops an instance.
    pub async fn force_stop(&self, instance_id: &str) -> DaemonResult<()> {
        self.timed(ProvisionStep::Stop, self.provisioner.stop(instance_id))
            .await
    }

    pub async fn probe(&self, instance_id: &str) -> DaemonResult<HealthStatus> {
        self.timed(ProvisionStep::Probe, self.provisioner.probe(instance_id))
            .await
    }

    async fn timed<T>(
        &self,
        step: ProvisionStep,
        fut: impl Future<Output = DaemonResult<T>>,
    ) -> DaemonResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DaemonError::Timeout(format!(
                "{step} timed out after {}s",
                self.timeout.as_secs_f64()
            ))),
        }
    }

    async fn guarded<T>(
        &self,
        step: ProvisionStep,
        cancel: &mut CancelSignal,
        fut: impl Future<Output = DaemonResult<T>>,
    ) -> DaemonResult<T> {
        if *cancel.borrow() {
            return Err(cancelled(step));
        }

        tokio::select! {
            biased;
            _ = wait_for_cancel(cancel) => Err(cancelled(step)),
            result = self.timed(step, fut) => result,
        }
    }
}

fn cancelled(step: ProvisionStep) -> DaemonError {
    DaemonError::Cancelled(format!("operation cancelled during {step}"))
}

/// Resolves once the flag is raised. Never resolves if the sender is gone.
pub async fn wait_for_cancel(cancel: &mut CancelSignal) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::provisioning::repo::{InMemoryProvisioner, MockProvisioner};
    use crate::shared::types::PermissionSet;

    fn spec() -> ProvisionSpec {
        ProvisionSpec {
            instance_id: "abc".to_string(),
            image_ref: "img".to_string(),
            config: Default::default(),
            permissions: PermissionSet::new(),
        }
    }

    #[tokio::test]
    async fn test_passes_through_provisioner_result() {
        let mut mock = MockProvisioner::new();
        mock.expect_prepare().times(1).returning(|_| Ok(()));
        mock.expect_start()
            .times(1)
            .returning(|_| Err(DaemonError::Provisioning("port in use".to_string())));

        let service = ProvisioningService::new(Arc::new(mock), Duration::from_secs(5));
        let (_tx, mut cancel) = watch::channel(false);

        service.prepare(&spec(), &mut cancel).await.unwrap();
        let err = service.start(&spec(), &mut cancel).await.unwrap_err();
        assert!(matches!(err, DaemonError::Provisioning(msg) if msg == "port in use"));
    }

    #[tokio::test]
    async fn test_probe_delegates() {
        let mut mock = MockProvisioner::new();
        mock.expect_probe()
            .withf(|id| id == "abc")
            .returning(|_| Ok(HealthStatus::Healthy));

        let service = ProvisioningService::new(Arc::new(mock), Duration::from_secs(5));
        assert_eq!(service.probe("abc").await.unwrap(), HealthStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_step_times_out() {
        let provisioner = Arc::new(InMemoryProvisioner::new());
        provisioner.delay_step(ProvisionStep::Prepare, Duration::from_secs(60));
        let service = ProvisioningService::new(provisioner, Duration::from_secs(1));
        let (_tx, mut cancel) = watch::channel(false);

        let err = service.prepare(&spec(), &mut cancel).await.unwrap_err();
        assert!(matches!(err, DaemonError::Timeout(msg) if msg.contains("prepare")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_step() {
        let provisioner = Arc::new(InMemoryProvisioner::new());
        provisioner.delay_step(ProvisionStep::Start, Duration::from_secs(60));
        let service = ProvisioningService::new(provisioner.clone(), Duration::from_secs(300));
        let (tx, mut cancel) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let _ = tx.send(true);
        });

        let err = service.start(&spec(), &mut cancel).await.unwrap_err();
        assert!(matches!(err, DaemonError::Cancelled(_)));
        assert!(!provisioner.is_running("abc"));
    }

    #[tokio::test]
    async fn test_already_cancelled_skips_provisioner() {
        let provisioner = Arc::new(InMemoryProvisioner::new());
        let service = ProvisioningService::new(provisioner.clone(), Duration::from_secs(5));
        let (_tx, mut cancel) = watch::channel(true);

        let err = service.stop("abc", &mut cancel).await.unwrap_err();
        assert!(matches!(err, DaemonError::Cancelled(_)));
        assert_eq!(provisioner.call_count(ProvisionStep::Stop), 0);
    }

    #[tokio::test]
    async fn test_dropped_sender_does_not_cancel() {
        let provisioner = Arc::new(InMemoryProvisioner::new());
        let service = ProvisioningService::new(provisioner, Duration::from_secs(5));
        let (tx, mut cancel) = watch::channel(false);
        drop(tx);

        service.prepare(&spec(), &mut cancel).await.unwrap();
    }
}
