use crate::PermissionSet;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Point in the lifecycle at which a policy question is asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyScope {
    Install,
    Runtime,
}

impl fmt::Display for PolicyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyScope::Install => f.write_str("install"),
            PolicyScope::Runtime => f.write_str("runtime"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyRequest {
    pub scope: PolicyScope,
    pub instance_id: String,
    pub package_id: String,
    #[serde(default)]
    pub actor: String,
    #[serde(default)]
    pub requested: PermissionSet,
}

impl PolicyRequest {
    pub fn new(
        scope: PolicyScope,
        instance_id: impl Into<String>,
        package_id: impl Into<String>,
        requested: PermissionSet,
    ) -> Self {
        Self {
            scope,
            instance_id: instance_id.into(),
            package_id: package_id.into(),
            actor: String::new(),
            requested,
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }
}

/// Verdict for a permission request. Ordered from least to most restrictive,
/// so the overall verdict is the maximum over every capability.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    #[default]
    Allow,
    Warn,
    Deny,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allow => f.write_str("allow"),
            Decision::Warn => f.write_str("warn"),
            Decision::Deny => f.write_str("deny"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub decision: Decision,
    #[serde(default)]
    pub block_reasons: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granted: Option<PermissionSet>,
}

impl PolicyDecision {
    pub fn is_denied(&self) -> bool {
        self.decision == Decision::Deny
    }

    /// Raises the verdict to `decision` if it is more restrictive.
    pub fn escalate(&mut self, decision: Decision) {
        self.decision = self.decision.max(decision);
    }

    pub fn deny(&mut self, reason: impl Into<String>) {
        self.escalate(Decision::Deny);
        self.block_reasons.push(reason.into());
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.escalate(Decision::Warn);
        self.warnings.push(warning.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_ordering() {
        assert!(Decision::Deny > Decision::Warn);
        assert!(Decision::Warn > Decision::Allow);
        assert_eq!(Decision::Allow.max(Decision::Deny), Decision::Deny);
    }

    #[test]
    fn test_escalate_never_relaxes() {
        let mut decision = PolicyDecision::default();
        decision.deny("no");
        decision.warn("careful");
        decision.escalate(Decision::Allow);
        assert_eq!(decision.decision, Decision::Deny);
        assert_eq!(decision.block_reasons, vec!["no".to_string()]);
        assert_eq!(decision.warnings, vec!["careful".to_string()]);
    }

    #[test]
    fn test_request_builder() {
        let request = PolicyRequest::new(
            PolicyScope::Install,
            "instance-1",
            "acme/files",
            PermissionSet::new(),
        )
        .with_actor("cli");
        assert_eq!(request.actor, "cli");
        assert_eq!(request.scope.to_string(), "install");
    }
}
