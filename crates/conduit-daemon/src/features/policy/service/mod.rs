use crate::features::policy::repo::{PolicyRules, ANY_PACKAGE};
use crate::shared::error::{DaemonError, DaemonResult};
use crate::shared::types::{Decision, NetworkEgress, PermissionSet, PolicyDecision, PolicyRequest};
use conduit_core::permission::{normalize_host, normalize_path, path_is_within, PathAccess};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Pure decision function over permission requests.
///
/// Rules are resolved once at construction (home expansion and
/// normalization) and never change afterwards, so identical requests always
/// produce identical decisions.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    sensitive_paths: Vec<String>,
    approved_paths: BTreeMap<String, Vec<String>>,
    sensitive_hosts: BTreeSet<String>,
    approved_hosts: BTreeMap<String, BTreeSet<String>>,
    unrestricted_egress: BTreeSet<String>,
}

impl PolicyEngine {
    pub fn new(rules: PolicyRules) -> DaemonResult<Self> {
        Self::with_home(rules, dirs::home_dir())
    }

    /// Builds the engine with an explicit home directory for `~` expansion.
    /// Rules that need a home directory are skipped when `home` is `None`.
    pub fn with_home(rules: PolicyRules, home: Option<PathBuf>) -> DaemonResult<Self> {
        let home = home.as_deref();

        let mut sensitive_paths = Vec::new();
        for raw in &rules.sensitive_paths {
            if let Some(path) = resolve_rule_path(raw, home)? {
                if !sensitive_paths.contains(&path) {
                    sensitive_paths.push(path);
                }
            }
        }

        let mut approved_paths = BTreeMap::new();
        for (package, paths) in &rules.approved_paths {
            let mut resolved = Vec::new();
            for raw in paths {
                if let Some(path) = resolve_rule_path(raw, home)? {
                    resolved.push(path);
                }
            }
            approved_paths.insert(package.clone(), resolved);
        }

        let sensitive_hosts = rules
            .sensitive_hosts
            .iter()
            .map(|h| normalize_host(h))
            .collect::<Result<BTreeSet<_>, _>>()?;

        let mut approved_hosts = BTreeMap::new();
        for (package, hosts) in &rules.approved_hosts {
            let hosts = hosts
                .iter()
                .map(|h| normalize_host(h))
                .collect::<Result<BTreeSet<_>, _>>()?;
            approved_hosts.insert(package.clone(), hosts);
        }

        Ok(Self {
            sensitive_paths,
            approved_paths,
            sensitive_hosts,
            approved_hosts,
            unrestricted_egress: rules.unrestricted_egress,
        })
    }

    pub fn sensitive_paths(&self) -> &[String] {
        &self.sensitive_paths
    }

    /// Decide whether the requested permissions may be granted.
    ///
    /// The overall verdict is the most restrictive per-capability verdict.
    /// `granted` holds the normalized request unless the verdict is `Deny`.
    /// A non-empty egress allow-list is granted as `Any`, matching what the
    /// container actually receives.
    pub fn evaluate(&self, request: &PolicyRequest) -> DaemonResult<PolicyDecision> {
        if request.package_id.trim().is_empty() {
            return Err(DaemonError::ValidationError(
                "policy request requires a package_id".to_string(),
            ));
        }

        let mut decision = PolicyDecision::default();
        let mut granted = PermissionSet::new();

        for (access, raw) in request.requested.paths() {
            let path = match normalize_path(raw) {
                Ok(path) => path,
                Err(e) => {
                    decision.deny(format!("{access} path {raw:?} is not allowed: {e}"));
                    continue;
                }
            };

            if path == "/" {
                decision.deny(format!("{access} path / exposes the entire filesystem"));
                continue;
            }

            if let Some(prefix) = self
                .sensitive_paths
                .iter()
                .find(|prefix| path_is_within(&path, prefix))
            {
                decision.deny(format!(
                    "{access} path {path} is under sensitive location {prefix}"
                ));
                continue;
            }

            if let Some(inner) = self
                .sensitive_paths
                .iter()
                .find(|prefix| path_is_within(prefix, &path))
            {
                decision.warn(format!(
                    "{access} path {path} contains sensitive location {inner}"
                ));
            } else if self.path_approved(&request.package_id, &path) {
                decision.escalate(Decision::Allow);
            } else {
                decision.warn(format!(
                    "{access} path {path} has not been approved for {}",
                    request.package_id
                ));
            }

            granted = match access {
                PathAccess::ReadOnly => granted.with_readonly_path(path),
                PathAccess::ReadWrite => granted.with_read_write_path(path),
            };
        }

        granted.network = self.evaluate_network(request, &mut decision);

        if !decision.is_denied() {
            decision.granted = Some(granted);
        }

        debug!(
            scope = %request.scope,
            instance_id = %request.instance_id,
            package_id = %request.package_id,
            decision = %decision.decision,
            reasons = decision.block_reasons.len(),
            "Policy evaluated"
        );

        Ok(decision)
    }

    fn evaluate_network(
        &self,
        request: &PolicyRequest,
        decision: &mut PolicyDecision,
    ) -> NetworkEgress {
        match &request.requested.network {
            NetworkEgress::None => NetworkEgress::None,
            NetworkEgress::Any => {
                if !self.package_listed(&self.unrestricted_egress, &request.package_id) {
                    decision.warn(format!(
                        "unrestricted network egress requested by {}",
                        request.package_id
                    ));
                }
                NetworkEgress::Any
            }
            NetworkEgress::AllowList(hosts) => {
                let mut granted = BTreeSet::new();
                for raw in hosts {
                    let host = match normalize_host(raw) {
                        Ok(host) => host,
                        Err(e) => {
                            decision.deny(format!("egress host {raw:?} is not allowed: {e}"));
                            continue;
                        }
                    };

                    if self.sensitive_hosts.contains(&host) {
                        decision.deny(format!("egress host {host} is a sensitive endpoint"));
                        continue;
                    }

                    if self.host_approved(&request.package_id, &host) {
                        decision.escalate(Decision::Allow);
                    } else {
                        decision.warn(format!(
                            "egress host {host} has not been approved for {}",
                            request.package_id
                        ));
                    }
                    granted.insert(host);
                }

                if granted.is_empty() {
                    return NetworkEgress::None;
                }
                // Container runtimes grant egress all or nothing.
                if !self.package_listed(&self.unrestricted_egress, &request.package_id) {
                    let hosts: Vec<&str> = granted.iter().map(String::as_str).collect();
                    decision.warn(format!(
                        "egress allow-list [{}] for {} is not enforceable per host; unrestricted egress granted",
                        hosts.join(", "),
                        request.package_id
                    ));
                }
                NetworkEgress::Any
            }
        }
    }

    fn path_approved(&self, package_id: &str, path: &str) -> bool {
        [package_id, ANY_PACKAGE]
            .iter()
            .filter_map(|key| self.approved_paths.get(*key))
            .flatten()
            .any(|approved| path_is_within(path, approved))
    }

    fn host_approved(&self, package_id: &str, host: &str) -> bool {
        [package_id, ANY_PACKAGE]
            .iter()
            .filter_map(|key| self.approved_hosts.get(*key))
            .any(|hosts| hosts.contains(host))
    }

    fn package_listed(&self, set: &BTreeSet<String>, package_id: &str) -> bool {
        set.contains(package_id) || set.contains(ANY_PACKAGE)
    }
}

/// Expands a leading `~` and normalizes a rule path. Returns `None` for
/// home-relative rules when no home directory is known.
fn resolve_rule_path(raw: &str, home: Option<&Path>) -> DaemonResult<Option<String>> {
    let raw = raw.trim();
    let expanded = if raw == "~" || raw.starts_with("~/") {
        let Some(home) = home else {
            return Ok(None);
        };
        format!("{}{}", home.display(), &raw[1..])
    } else {
        raw.to_string()
    };

    normalize_path(&expanded)
        .map(Some)
        .map_err(|e| DaemonError::ValidationError(format!("invalid policy rule {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::types::PolicyScope;
    use proptest::prelude::*;

    fn engine() -> PolicyEngine {
        PolicyEngine::with_home(PolicyRules::default(), Some(PathBuf::from("/home/alice")))
            .unwrap()
    }

    fn request(requested: PermissionSet) -> PolicyRequest {
        PolicyRequest::new(PolicyScope::Install, "instance-1", "acme/files", requested)
    }

    #[test]
    fn test_empty_request_is_allowed() {
        let decision = engine().evaluate(&request(PermissionSet::new())).unwrap();
        assert_eq!(decision.decision, Decision::Allow);
        assert!(decision.block_reasons.is_empty());
        assert_eq!(decision.granted, Some(PermissionSet::new()));
    }

    #[test]
    fn test_etc_is_denied_with_reason() {
        let decision = engine()
            .evaluate(&request(PermissionSet::new().with_readonly_path("/etc")))
            .unwrap();
        assert_eq!(decision.decision, Decision::Deny);
        assert!(decision.block_reasons.iter().any(|r| r.contains("/etc")));
        assert!(decision.granted.is_none());
    }

    #[test]
    fn test_traversal_into_sensitive_location_is_denied() {
        let decision = engine()
            .evaluate(&request(
                PermissionSet::new().with_read_write_path("/home/alice/work/../../../etc/ssh"),
            ))
            .unwrap();
        assert!(decision.is_denied());
        assert_eq!(
            decision.block_reasons,
            vec!["read-write path /etc/ssh is under sensitive location /etc".to_string()]
        );
    }

    #[test]
    fn test_home_relative_rules_are_expanded() {
        let decision = engine()
            .evaluate(&request(
                PermissionSet::new().with_readonly_path("/home/alice/.ssh/id_ed25519"),
            ))
            .unwrap();
        assert!(decision.is_denied());
        assert!(decision.block_reasons[0].contains("/home/alice/.ssh"));
    }

    #[test]
    fn test_root_and_relative_paths_are_denied() {
        let decision = engine()
            .evaluate(&request(
                PermissionSet::new()
                    .with_readonly_path("/")
                    .with_read_write_path("data/out"),
            ))
            .unwrap();
        assert!(decision.is_denied());
        assert_eq!(decision.block_reasons.len(), 2);
    }

    #[test]
    fn test_unapproved_path_warns_and_is_granted() {
        let decision = engine()
            .evaluate(&request(
                PermissionSet::new().with_read_write_path("/tmp/conduit/./work/"),
            ))
            .unwrap();
        assert_eq!(decision.decision, Decision::Warn);
        assert_eq!(decision.warnings.len(), 1);
        assert_eq!(
            decision.granted,
            Some(PermissionSet::new().with_read_write_path("/tmp/conduit/work"))
        );
    }

    #[test]
    fn test_approved_path_is_allowed() {
        let rules = PolicyRules::default()
            .approve_path("acme/files", "/srv/data")
            .approve_path(ANY_PACKAGE, "/opt/shared");
        let engine =
            PolicyEngine::with_home(rules, Some(PathBuf::from("/home/alice"))).unwrap();

        let decision = engine
            .evaluate(&request(
                PermissionSet::new()
                    .with_readonly_path("/srv/data/reports")
                    .with_readonly_path("/opt/shared"),
            ))
            .unwrap();
        assert_eq!(decision.decision, Decision::Allow);

        let other = PolicyRequest::new(
            PolicyScope::Install,
            "instance-2",
            "acme/other",
            PermissionSet::new().with_readonly_path("/srv/data"),
        );
        assert_eq!(engine.evaluate(&other).unwrap().decision, Decision::Warn);
    }

    #[test]
    fn test_parent_of_sensitive_location_warns() {
        let decision = engine()
            .evaluate(&request(PermissionSet::new().with_readonly_path("/home/alice")))
            .unwrap();
        assert_eq!(decision.decision, Decision::Warn);
        assert!(decision.warnings[0].contains("contains sensitive location"));
    }

    #[test]
    fn test_metadata_host_is_denied() {
        let hosts = ["169.254.169.254".to_string(), "api.example.com".to_string()];
        let decision = engine()
            .evaluate(&request(PermissionSet::new().with_network(
                NetworkEgress::AllowList(hosts.into_iter().collect()),
            )))
            .unwrap();
        assert!(decision.is_denied());
        assert_eq!(
            decision.block_reasons,
            vec!["egress host 169.254.169.254 is a sensitive endpoint".to_string()]
        );
    }

    #[test]
    fn test_host_approval_widens_to_unrestricted_egress() {
        let hosts = || NetworkEgress::AllowList(["api.example.com.".to_string()].into_iter().collect());

        let rules = PolicyRules::default().approve_host("acme/files", "API.example.com");
        let engine = PolicyEngine::with_home(rules.clone(), None).unwrap();
        let decision = engine
            .evaluate(&request(PermissionSet::new().with_network(hosts())))
            .unwrap();
        assert_eq!(decision.decision, Decision::Warn);
        assert_eq!(decision.warnings.len(), 1);
        assert!(decision.warnings[0].contains("[api.example.com]"));
        assert!(decision.warnings[0].contains("not enforceable"));
        assert_eq!(decision.granted.unwrap().network, NetworkEgress::Any);

        let engine =
            PolicyEngine::with_home(rules.allow_unrestricted_egress("acme/files"), None).unwrap();
        let decision = engine
            .evaluate(&request(PermissionSet::new().with_network(hosts())))
            .unwrap();
        assert_eq!(decision.decision, Decision::Allow);
        assert_eq!(decision.granted.unwrap().network, NetworkEgress::Any);
    }

    #[test]
    fn test_empty_allow_list_grants_no_egress() {
        let decision = engine()
            .evaluate(&request(
                PermissionSet::new().with_network(NetworkEgress::AllowList(BTreeSet::new())),
            ))
            .unwrap();
        assert_eq!(decision.decision, Decision::Allow);
        assert_eq!(decision.granted.unwrap().network, NetworkEgress::None);
    }

    #[test]
    fn test_unrestricted_egress() {
        let requested = PermissionSet::new().with_network(NetworkEgress::Any);
        let decision = engine().evaluate(&request(requested.clone())).unwrap();
        assert_eq!(decision.decision, Decision::Warn);

        let rules = PolicyRules::default().allow_unrestricted_egress("acme/files");
        let engine = PolicyEngine::with_home(rules, None).unwrap();
        let decision = engine.evaluate(&request(requested)).unwrap();
        assert_eq!(decision.decision, Decision::Allow);
    }

    #[test]
    fn test_overall_verdict_is_most_restrictive() {
        let decision = engine()
            .evaluate(&request(
                PermissionSet::new()
                    .with_readonly_path("/tmp/ok")
                    .with_read_write_path("/proc/self")
                    .with_network(NetworkEgress::Any),
            ))
            .unwrap();
        assert_eq!(decision.decision, Decision::Deny);
        assert_eq!(decision.block_reasons.len(), 1);
        assert_eq!(decision.warnings.len(), 2);
    }

    #[test]
    fn test_missing_home_skips_home_rules() {
        let engine = PolicyEngine::with_home(PolicyRules::default(), None).unwrap();
        assert!(engine.sensitive_paths().iter().all(|p| !p.contains('~')));
        assert!(engine.sensitive_paths().iter().any(|p| p == "/etc"));
    }

    #[test]
    fn test_invalid_rule_is_rejected() {
        let rules = PolicyRules {
            sensitive_paths: vec!["relative/rule".to_string()],
            ..PolicyRules::default()
        };
        assert!(matches!(
            PolicyEngine::with_home(rules, None),
            Err(DaemonError::ValidationError(_))
        ));
    }

    #[test]
    fn test_blank_package_is_rejected() {
        let req = PolicyRequest::new(PolicyScope::Runtime, "i", " ", PermissionSet::new());
        assert!(engine().evaluate(&req).is_err());
    }

    fn path_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("/etc".to_string()),
            Just("/tmp/data".to_string()),
            Just("/home/alice/.aws/credentials".to_string()),
            "[a-z]{1,6}(/[a-z.]{1,6}){0,3}".prop_map(|s| format!("/{s}")),
            "[a-z]{1,6}",
        ]
    }

    proptest! {
        #[test]
        fn prop_evaluation_is_deterministic(
            readonly in proptest::collection::btree_set(path_strategy(), 0..4),
            read_write in proptest::collection::btree_set(path_strategy(), 0..4),
        ) {
            let mut requested = PermissionSet::new();
            requested.filesystem.readonly_paths = readonly;
            requested.filesystem.read_write_paths = read_write;
            let req = request(requested);

            let engine = engine();
            let first = engine.evaluate(&req).unwrap();
            let second = engine.evaluate(&req).unwrap();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_tmp_paths_are_never_denied(segments in proptest::collection::vec("[a-zA-Z0-9_-]{1,8}", 1..4)) {
            let path = format!("/tmp/{}", segments.join("/"));
            let decision = engine()
                .evaluate(&request(PermissionSet::new().with_read_write_path(path)))
                .unwrap();
            prop_assert_ne!(decision.decision, Decision::Deny);
        }
    }
}
