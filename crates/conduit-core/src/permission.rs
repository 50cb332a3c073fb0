use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Filesystem portion of a permission set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilesystemPermissions {
    #[serde(default)]
    pub readonly_paths: BTreeSet<String>,
    #[serde(default)]
    pub read_write_paths: BTreeSet<String>,
}

/// Outbound network access.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "hosts")]
pub enum NetworkEgress {
    #[default]
    None,
    Any,
    AllowList(BTreeSet<String>),
}

impl NetworkEgress {
    pub fn is_none(&self) -> bool {
        matches!(self, NetworkEgress::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathAccess {
    ReadOnly,
    ReadWrite,
}

impl fmt::Display for PathAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathAccess::ReadOnly => f.write_str("read-only"),
            PathAccess::ReadWrite => f.write_str("read-write"),
        }
    }
}

/// Capabilities a connector declares or is granted. Compared by content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionSet {
    #[serde(default)]
    pub filesystem: FilesystemPermissions,
    #[serde(default)]
    pub network: NetworkEgress,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_readonly_path(mut self, path: impl Into<String>) -> Self {
        self.filesystem.readonly_paths.insert(path.into());
        self
    }

    pub fn with_read_write_path(mut self, path: impl Into<String>) -> Self {
        self.filesystem.read_write_paths.insert(path.into());
        self
    }

    pub fn with_network(mut self, network: NetworkEgress) -> Self {
        self.network = network;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.filesystem.readonly_paths.is_empty()
            && self.filesystem.read_write_paths.is_empty()
            && self.network.is_none()
    }

    /// Every requested path with its access mode, read-only first.
    pub fn paths(&self) -> impl Iterator<Item = (PathAccess, &str)> {
        self.filesystem
            .readonly_paths
            .iter()
            .map(|p| (PathAccess::ReadOnly, p.as_str()))
            .chain(
                self.filesystem
                    .read_write_paths
                    .iter()
                    .map(|p| (PathAccess::ReadWrite, p.as_str())),
            )
    }

    /// Copy with every path lexically normalized and host names lowercased.
    pub fn normalized(&self) -> Result<PermissionSet> {
        let readonly_paths = self
            .filesystem
            .readonly_paths
            .iter()
            .map(|p| normalize_path(p))
            .collect::<Result<BTreeSet<_>>>()?;
        let read_write_paths = self
            .filesystem
            .read_write_paths
            .iter()
            .map(|p| normalize_path(p))
            .collect::<Result<BTreeSet<_>>>()?;

        let network = match &self.network {
            NetworkEgress::None => NetworkEgress::None,
            NetworkEgress::Any => NetworkEgress::Any,
            NetworkEgress::AllowList(hosts) => NetworkEgress::AllowList(
                hosts
                    .iter()
                    .map(|h| normalize_host(h))
                    .collect::<Result<BTreeSet<_>>>()?,
            ),
        };

        Ok(PermissionSet {
            filesystem: FilesystemPermissions {
                readonly_paths,
                read_write_paths,
            },
            network,
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.normalized().map(|_| ())
    }
}

/// Lexically normalizes an absolute path: collapses separators, drops `.`
/// and resolves `..` without touching the filesystem.
pub fn normalize_path(path: &str) -> Result<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(CoreError::InvalidPermission(
            "path cannot be empty".to_string(),
        ));
    }
    if !trimmed.starts_with('/') {
        return Err(CoreError::InvalidPermission(format!(
            "path must be absolute: {trimmed}"
        )));
    }
    if trimmed.contains('\0') {
        return Err(CoreError::InvalidPermission(format!(
            "path contains a NUL byte: {trimmed:?}"
        )));
    }
    // Paths end up inside container mount specs.
    if trimmed.contains(|c: char| c == ':' || c == ',') {
        return Err(CoreError::InvalidPermission(format!(
            "path contains a mount separator: {trimmed}"
        )));
    }

    let mut parts: Vec<&str> = Vec::new();
    for component in trimmed.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    Ok(format!("/{}", parts.join("/")))
}

/// Lowercases a host name and drops a trailing root dot.
pub fn normalize_host(host: &str) -> Result<String> {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() || host.contains(char::is_whitespace) || host.contains('/') {
        return Err(CoreError::InvalidPermission(format!(
            "invalid egress host: {host:?}"
        )));
    }
    Ok(host)
}

/// True when `path` is `prefix` itself or lies beneath it. Both must be normalized.
pub fn path_is_within(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}
