use crate::shared::error::{DaemonError, DaemonResult};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_ADDR: &str = "127.0.0.1:7420";
pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_CONTAINER_RUNTIME: &str = "docker";

/// Daemon settings, read from `CONDUIT_*` environment variables.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub health_interval: Duration,
    pub operation_timeout: Duration,
    pub policy_file: Option<PathBuf>,
    pub container_runtime: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 7420)),
            db_path: default_db_path(),
            health_interval: Duration::from_secs(DEFAULT_HEALTH_INTERVAL_SECS),
            operation_timeout: Duration::from_secs(DEFAULT_OPERATION_TIMEOUT_SECS),
            policy_file: None,
            container_runtime: DEFAULT_CONTAINER_RUNTIME.to_string(),
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> DaemonResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> DaemonResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let addr = get("CONDUIT_ADDR")
            .unwrap_or_else(|| DEFAULT_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| DaemonError::ValidationError(format!("invalid CONDUIT_ADDR: {e}")))?;

        let db_path = get("CONDUIT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(default_db_path);

        let health_interval = Duration::from_secs(parse_secs(
            "CONDUIT_HEALTH_INTERVAL_SECS",
            get("CONDUIT_HEALTH_INTERVAL_SECS"),
            DEFAULT_HEALTH_INTERVAL_SECS,
        )?);
        let operation_timeout = Duration::from_secs(parse_secs(
            "CONDUIT_OPERATION_TIMEOUT_SECS",
            get("CONDUIT_OPERATION_TIMEOUT_SECS"),
            DEFAULT_OPERATION_TIMEOUT_SECS,
        )?);

        Ok(Self {
            addr,
            db_path,
            health_interval,
            operation_timeout,
            policy_file: get("CONDUIT_POLICY_FILE").map(PathBuf::from),
            container_runtime: get("CONDUIT_CONTAINER_RUNTIME")
                .unwrap_or_else(|| DEFAULT_CONTAINER_RUNTIME.to_string()),
        })
    }
}

fn parse_secs(key: &str, value: Option<String>, default: u64) -> DaemonResult<u64> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.parse::<u64>() {
        Ok(0) => Err(DaemonError::ValidationError(format!(
            "{key} must be greater than zero"
        ))),
        Ok(secs) => Ok(secs),
        Err(e) => Err(DaemonError::ValidationError(format!(
            "invalid {key} {value:?}: {e}"
        ))),
    }
}

fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".conduit")
        .join("state.json")
}
