//! Permission checking against the user's glob policy.
//!
//! One shared decision routine backs both the per-tool check and the
//! capability-level derivation, so precedence cannot drift between the
//! two paths.

use parking_lot::RwLock;

use caprun_domain::config::PolicyConfig;
use caprun_domain::identifier::ToolId;

/// Per-identifier decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Allowed,
    Denied,
    Ask,
}

/// Decision for a capability exposing multiple tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityDecision {
    /// At least one exposed tool is denied — the capability never runs.
    Blocked,
    /// No denials, at least one tool needs consent — run under HIL.
    Hil,
    /// Every exposed tool is allowed.
    Auto,
}

/// User policy: three glob lists with deny > allow > ask precedence.
///
/// The allow list can grow at runtime: an always-approved consent
/// grants the namespace, so later checks skip the prompt.
#[derive(Debug, Default)]
pub struct PermissionPolicy {
    config: RwLock<PolicyConfig>,
}

impl PermissionPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    /// Persist an always-approve decision: the bare namespace joins the
    /// allow list. Deny entries still win — a grant never overrides a
    /// denial.
    pub fn grant_namespace(&self, namespace: &str) {
        let mut config = self.config.write();
        if !config.allow.iter().any(|pattern| pattern == namespace) {
            config.allow.push(namespace.to_string());
            tracing::info!(namespace, "namespace granted in allow policy");
        }
    }

    /// Check one identifier. An empty policy yields `Ask` for everything.
    pub fn check(&self, id: &ToolId) -> PermissionDecision {
        self.decide(id)
    }

    /// Derive the capability-level decision from its exposed tools.
    ///
    /// A capability with no tools runs auto: there is nothing to gate.
    pub fn check_capability(&self, tools: &[ToolId]) -> CapabilityDecision {
        let mut needs_consent = false;
        for tool in tools {
            match self.decide(tool) {
                PermissionDecision::Denied => return CapabilityDecision::Blocked,
                PermissionDecision::Ask => needs_consent = true,
                PermissionDecision::Allowed => {}
            }
        }
        if needs_consent {
            CapabilityDecision::Hil
        } else {
            CapabilityDecision::Auto
        }
    }

    /// The single precedence routine: deny > allow > ask > implicit ask.
    fn decide(&self, id: &ToolId) -> PermissionDecision {
        let config = self.config.read();
        if matches_any(&config.deny, id) {
            PermissionDecision::Denied
        } else if matches_any(&config.allow, id) {
            PermissionDecision::Allowed
        } else {
            // Explicit `ask` membership and the implicit fallback agree,
            // so no third branch is needed.
            PermissionDecision::Ask
        }
    }
}

fn matches_any(patterns: &[String], id: &ToolId) -> bool {
    patterns.iter().any(|p| matches_pattern(p, id))
}

/// Glob semantics: `*` matches anything; `ns:*` matches every action in
/// `ns`; anything else is a literal match against the colon form.
fn matches_pattern(pattern: &str, id: &ToolId) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(ns) = pattern.strip_suffix(":*") {
        return id.namespace == ns;
    }
    match ToolId::parse(pattern) {
        Some(p) => p == *id,
        // A bare namespace pattern covers every action within it.
        None => pattern == id.namespace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(deny: &[&str], allow: &[&str], ask: &[&str]) -> PermissionPolicy {
        PermissionPolicy::new(PolicyConfig {
            deny: deny.iter().map(|s| s.to_string()).collect(),
            allow: allow.iter().map(|s| s.to_string()).collect(),
            ask: ask.iter().map(|s| s.to_string()).collect(),
        })
    }

    fn id(raw: &str) -> ToolId {
        ToolId::parse(raw).unwrap()
    }

    #[test]
    fn empty_policy_asks_everything() {
        let p = policy(&[], &[], &[]);
        assert_eq!(p.check(&id("cache:test")), PermissionDecision::Ask);
        assert_eq!(p.check(&id("ssh:connect")), PermissionDecision::Ask);
    }

    #[test]
    fn deny_wins_over_allow() {
        let p = policy(&["ssh:*"], &["*"], &[]);
        assert_eq!(p.check(&id("ssh:connect")), PermissionDecision::Denied);
        assert_eq!(p.check(&id("cache:test")), PermissionDecision::Allowed);
    }

    #[test]
    fn deny_wins_regardless_of_ask_membership() {
        let p = policy(&["ssh:connect"], &["ssh:connect"], &["ssh:connect"]);
        assert_eq!(p.check(&id("ssh:connect")), PermissionDecision::Denied);
    }

    #[test]
    fn allow_wins_over_ask() {
        let p = policy(&[], &["cache:*"], &["*"]);
        assert_eq!(p.check(&id("cache:test")), PermissionDecision::Allowed);
        assert_eq!(p.check(&id("other:x")), PermissionDecision::Ask);
    }

    #[test]
    fn exact_match_is_literal() {
        let p = policy(&[], &["cache:test"], &[]);
        assert_eq!(p.check(&id("cache:test")), PermissionDecision::Allowed);
        assert_eq!(p.check(&id("cache:other")), PermissionDecision::Ask);
    }

    #[test]
    fn namespace_wildcard_scopes_to_namespace() {
        let p = policy(&[], &["cache:*"], &[]);
        assert_eq!(p.check(&id("cache:anything")), PermissionDecision::Allowed);
        assert_eq!(p.check(&id("cached:thing")), PermissionDecision::Ask);
    }

    #[test]
    fn bare_namespace_pattern_matches_all_actions() {
        let p = policy(&[], &["custom-mcp"], &[]);
        assert_eq!(p.check(&id("custom-mcp:store")), PermissionDecision::Allowed);
        assert_eq!(p.check(&id("other:store")), PermissionDecision::Ask);
    }

    #[test]
    fn capability_any_denied_blocks() {
        let p = policy(&["fs:write"], &["*"], &[]);
        let tools = [id("fs:read"), id("fs:write")];
        assert_eq!(p.check_capability(&tools), CapabilityDecision::Blocked);
    }

    #[test]
    fn capability_any_ask_is_hil() {
        let p = policy(&[], &["fs:read"], &[]);
        let tools = [id("fs:read"), id("fs:list")];
        assert_eq!(p.check_capability(&tools), CapabilityDecision::Hil);
    }

    #[test]
    fn capability_all_allowed_is_auto() {
        let p = policy(&[], &["fs:*"], &[]);
        let tools = [id("fs:read"), id("fs:list")];
        assert_eq!(p.check_capability(&tools), CapabilityDecision::Auto);
    }

    #[test]
    fn capability_precedence_matches_per_tool_path() {
        // An identifier in both allow and deny resolves Denied on the
        // per-tool path; the capability path must agree.
        let p = policy(&["fs:read"], &["fs:read"], &[]);
        assert_eq!(p.check(&id("fs:read")), PermissionDecision::Denied);
        assert_eq!(
            p.check_capability(&[id("fs:read")]),
            CapabilityDecision::Blocked
        );
    }

    #[test]
    fn empty_tool_list_is_auto() {
        let p = policy(&[], &[], &["*"]);
        assert_eq!(p.check_capability(&[]), CapabilityDecision::Auto);
    }

    #[test]
    fn granted_namespace_skips_ask() {
        let p = policy(&[], &[], &["*"]);
        assert_eq!(p.check(&id("memory:store")), PermissionDecision::Ask);

        p.grant_namespace("memory");
        assert_eq!(p.check(&id("memory:store")), PermissionDecision::Allowed);
        assert_eq!(p.check(&id("memory:recall")), PermissionDecision::Allowed);
        assert_eq!(p.check(&id("other:x")), PermissionDecision::Ask);
    }

    #[test]
    fn grant_never_overrides_deny() {
        let p = policy(&["memory:*"], &[], &[]);
        p.grant_namespace("memory");
        assert_eq!(p.check(&id("memory:store")), PermissionDecision::Denied);
    }

    #[test]
    fn repeated_grants_are_harmless() {
        let p = policy(&[], &[], &[]);
        p.grant_namespace("memory");
        p.grant_namespace("memory");
        assert_eq!(p.check(&id("memory:store")), PermissionDecision::Allowed);
    }
}
