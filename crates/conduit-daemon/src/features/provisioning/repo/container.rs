use crate::features::provisioning::repo::{ProvisionSpec, Provisioner};
use crate::shared::error::{DaemonError, DaemonResult};
use crate::shared::types::{HealthStatus, NetworkEgress};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

const CONTAINER_PREFIX: &str = "conduit-";
const INSTANCE_LABEL: &str = "io.conduit.instance";

/// Provisioner driving a docker/podman compatible CLI.
pub struct ContainerProvisioner {
    runtime: String,
}

impl ContainerProvisioner {
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
        }
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    pub fn container_name(instance_id: &str) -> String {
        format!("{CONTAINER_PREFIX}{instance_id}")
    }

    /// Arguments for `run`. Granted paths become bind mounts at the same
    /// location. Egress is all or nothing: anything but `None` keeps the
    /// default network.
    pub fn run_args(spec: &ProvisionSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            Self::container_name(&spec.instance_id),
            "--label".to_string(),
            format!("{INSTANCE_LABEL}={}", spec.instance_id),
        ];

        for path in &spec.permissions.filesystem.readonly_paths {
            args.push("--mount".to_string());
            args.push(format!("type=bind,source={path},target={path},readonly"));
        }
        for path in &spec.permissions.filesystem.read_write_paths {
            args.push("--mount".to_string());
            args.push(format!("type=bind,source={path},target={path}"));
        }

        if let NetworkEgress::None = spec.permissions.network {
            args.push("--network".to_string());
            args.push("none".to_string());
        }

        for (key, value) in &spec.config {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }

        args.push(spec.image_ref.clone());
        args
    }

    async fn exec(&self, args: &[String]) -> DaemonResult<String> {
        debug!(runtime = %self.runtime, args = ?args, "Running container command");

        let output = Command::new(&self.runtime)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                DaemonError::Provisioning(format!("failed to run {}: {e}", self.runtime))
            })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let verb = args.first().map(String::as_str).unwrap_or_default();
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(DaemonError::Provisioning(format!(
            "{} {verb} failed ({}): {}",
            self.runtime,
            output.status,
            stderr.trim()
        )))
    }
}

fn is_missing_container(err: &DaemonError) -> bool {
    matches!(err, DaemonError::Provisioning(msg) if msg.contains("No such container") || msg.contains("no such container"))
}

#[async_trait]
impl Provisioner for ContainerProvisioner {
    async fn prepare(&self, spec: &ProvisionSpec) -> DaemonResult<()> {
        if spec.image_ref.trim().is_empty() {
            return Err(DaemonError::Provisioning(
                "image reference is empty".to_string(),
            ));
        }
        self.exec(&["pull".to_string(), spec.image_ref.clone()])
            .await?;
        info!(instance_id = %spec.instance_id, image = %spec.image_ref, "Image pulled");
        Ok(())
    }

    async fn start(&self, spec: &ProvisionSpec) -> DaemonResult<()> {
        // A stopped container from an earlier start keeps the name taken.
        self.teardown(&spec.instance_id).await?;

        let container_id = self.exec(&Self::run_args(spec)).await?;
        info!(
            instance_id = %spec.instance_id,
            container_id = %container_id,
            "Container started"
        );
        Ok(())
    }

    async fn stop(&self, instance_id: &str) -> DaemonResult<()> {
        match self
            .exec(&["stop".to_string(), Self::container_name(instance_id)])
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_missing_container(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn teardown(&self, instance_id: &str) -> DaemonResult<()> {
        match self
            .exec(&[
                "rm".to_string(),
                "-f".to_string(),
                Self::container_name(instance_id),
            ])
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_missing_container(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn probe(&self, instance_id: &str) -> DaemonResult<HealthStatus> {
        let result = self
            .exec(&[
                "inspect".to_string(),
                "-f".to_string(),
                "{{.State.Running}}".to_string(),
                Self::container_name(instance_id),
            ])
            .await;

        match result {
            Ok(state) if state == "true" => Ok(HealthStatus::Healthy),
            Ok(_) => Ok(HealthStatus::Unhealthy),
            Err(e) if is_missing_container(&e) => Ok(HealthStatus::Unhealthy),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::types::PermissionSet;
    use std::collections::BTreeMap;

    fn spec(permissions: PermissionSet) -> ProvisionSpec {
        ProvisionSpec {
            instance_id: "abc".to_string(),
            image_ref: "ghcr.io/acme/files:1.0".to_string(),
            config: BTreeMap::from([("LOG_LEVEL".to_string(), "debug".to_string())]),
            permissions,
        }
    }

    #[test]
    fn test_run_args_without_network() {
        let args = ContainerProvisioner::run_args(&spec(
            PermissionSet::new()
                .with_readonly_path("/srv/docs")
                .with_read_write_path("/tmp/out"),
        ));

        assert_eq!(&args[..4], &["run", "-d", "--name", "conduit-abc"]);
        assert!(args.windows(2).any(|w| w
            == ["--mount", "type=bind,source=/srv/docs,target=/srv/docs,readonly"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["--mount", "type=bind,source=/tmp/out,target=/tmp/out"]));
        assert!(args.windows(2).any(|w| w == ["--network", "none"]));
        assert!(args.windows(2).any(|w| w == ["-e", "LOG_LEVEL=debug"]));
        assert_eq!(args.last().map(String::as_str), Some("ghcr.io/acme/files:1.0"));
    }

    #[test]
    fn test_run_args_with_egress_keeps_default_network() {
        let args = ContainerProvisioner::run_args(&spec(
            PermissionSet::new().with_network(NetworkEgress::Any),
        ));
        assert!(!args.iter().any(|a| a == "--network"));
    }


    #[tokio::test]
    async fn test_missing_runtime_binary_is_a_provisioning_error() {
        let provisioner = ContainerProvisioner::new("conduit-no-such-runtime-binary");
        let err = provisioner
            .prepare(&spec(PermissionSet::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::Provisioning(_)));
    }

    #[test]
    fn test_missing_container_detection() {
        assert!(is_missing_container(&DaemonError::Provisioning(
            "docker rm failed (exit status: 1): Error: No such container: conduit-x".to_string()
        )));
        assert!(!is_missing_container(&DaemonError::Timeout("x".to_string())));
    }
}
