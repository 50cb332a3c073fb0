use crate::shared::error::{DaemonError, DaemonResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::info;

/// Key in `approved_paths` / `approved_hosts` / `unrestricted_egress` that
/// applies to every package.
pub const ANY_PACKAGE: &str = "*";

pub const DEFAULT_SENSITIVE_PATHS: &[&str] = &[
    "/etc",
    "/boot",
    "/dev",
    "/proc",
    "/sys",
    "/root",
    "/var/run",
    "/private/etc",
    "/System",
    "/Library/Keychains",
    "/usr/bin",
    "/usr/sbin",
    "/bin",
    "/sbin",
    "~/.ssh",
    "~/.gnupg",
    "~/.aws",
];

pub const DEFAULT_SENSITIVE_HOSTS: &[&str] = &["169.254.169.254", "metadata.google.internal"];

/// Static rule set the policy engine decides against.
///
/// Missing fields in a rules file fall back to the built-in defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyRules {
    /// Path prefixes that are never granted. A leading `~` expands to the home directory.
    pub sensitive_paths: Vec<String>,
    /// Paths already approved, keyed by package id or `*`.
    pub approved_paths: BTreeMap<String, Vec<String>>,
    pub sensitive_hosts: Vec<String>,
    /// Egress hosts already approved, keyed by package id or `*`.
    pub approved_hosts: BTreeMap<String, Vec<String>>,
    /// Packages allowed to request `Any` egress without a warning.
    pub unrestricted_egress: BTreeSet<String>,
}

impl Default for PolicyRules {
    fn default() -> Self {
        Self {
            sensitive_paths: DEFAULT_SENSITIVE_PATHS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            approved_paths: BTreeMap::new(),
            sensitive_hosts: DEFAULT_SENSITIVE_HOSTS
                .iter()
                .map(|h| h.to_string())
                .collect(),
            approved_hosts: BTreeMap::new(),
            unrestricted_egress: BTreeSet::new(),
        }
    }
}

impl PolicyRules {
    pub fn from_json(json: &str) -> DaemonResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| DaemonError::ValidationError(format!("invalid policy rules: {e}")))
    }

    pub fn from_file(path: impl AsRef<Path>) -> DaemonResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            DaemonError::ValidationError(format!(
                "cannot read policy file {}: {e}",
                path.display()
            ))
        })?;
        let rules = Self::from_json(&contents)?;
        info!(
            path = %path.display(),
            sensitive_paths = rules.sensitive_paths.len(),
            approved_packages = rules.approved_paths.len(),
            "Loaded policy rules"
        );
        Ok(rules)
    }

    /// Loads `path` when given, otherwise the defaults.
    pub fn load(path: Option<&Path>) -> DaemonResult<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn approve_path(mut self, package_id: impl Into<String>, path: impl Into<String>) -> Self {
        self.approved_paths
            .entry(package_id.into())
            .or_default()
            .push(path.into());
        self
    }

    pub fn approve_host(mut self, package_id: impl Into<String>, host: impl Into<String>) -> Self {
        self.approved_hosts
            .entry(package_id.into())
            .or_default()
            .push(host.into());
        self
    }

    pub fn allow_unrestricted_egress(mut self, package_id: impl Into<String>) -> Self {
        self.unrestricted_egress.insert(package_id.into());
        self
    }
}
