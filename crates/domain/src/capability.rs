//! Capability metadata as served by the remote registry.
//!
//! The registry answers `GET <cloud_url>/mcp/<fqcn>` with one of these
//! documents. Field names follow the registry wire format (camelCase).

use serde::{Deserialize, Serialize};

use crate::identifier::Fqcn;

/// Immutable capability record retrieved from the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityMetadata {
    /// Fully-qualified capability name (≥ 4 dot segments, optional
    /// trailing revision hash).
    pub fqdn: String,
    /// Capability kind. The registry currently only publishes `deno`.
    #[serde(rename = "type")]
    pub kind: CapabilityKind,
    /// URL the executable code is fetched from (`https:` or `data:`).
    #[serde(rename = "codeUrl")]
    pub code_url: String,
    /// Tool identifiers this capability exposes.
    pub tools: Vec<String>,
    /// Where the capability prefers to run.
    pub routing: RoutingPreference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Content-integrity token over the fetched code (`sha256-<hex>`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    /// Subprocess servers this capability needs, in declared order.
    #[serde(default, rename = "mcpDeps", skip_serializing_if = "Vec::is_empty")]
    pub mcp_deps: Vec<SubprocessDep>,
}

impl CapabilityMetadata {
    pub fn fqcn(&self) -> Fqcn {
        Fqcn::from_identifier(&self.fqdn)
    }

    /// The declared subprocess dependency for a namespace, if any.
    pub fn dep_for_namespace(&self, namespace: &str) -> Option<&SubprocessDep> {
        self.mcp_deps.iter().find(|d| d.name == namespace)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Deno,
}

/// Routing preference published with the capability.
///
/// `client` capabilities execute in this runtime's sandbox; `server`
/// capabilities are invoked on the cloud endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingPreference {
    Client,
    Server,
}

/// A subprocess dependency: a long-lived stdio JSON-RPC server reached
/// under the namespace equal to its `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubprocessDep {
    pub name: String,
    #[serde(rename = "type", default)]
    pub transport: DepTransport,
    /// Install command, e.g. `npx @mcp/memory@1.0.0`. Also the launch
    /// command when no explicit `command`/`args` pair is given.
    pub install: String,
    pub version: String,
    /// Integrity token: `sha256-<hex>`, or legacy `sha1-<hex>`.
    pub integrity: String,
    /// Credential variables that must be present before install/launch.
    #[serde(default, rename = "envRequired", skip_serializing_if = "Vec::is_empty")]
    pub env_required: Vec<String>,
    /// Explicit launch program, overriding tokenization of `install`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepTransport {
    #[default]
    Stdio,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_minimal_metadata() {
        let raw = r#"{
            "fqdn": "casys.pml.cache.test",
            "type": "deno",
            "codeUrl": "data:application/javascript,export function run(){return 'ok'}",
            "tools": ["cache:test"],
            "routing": "client"
        }"#;
        let meta: CapabilityMetadata = serde_json::from_str(raw).unwrap();
        assert_eq!(meta.fqdn, "casys.pml.cache.test");
        assert_eq!(meta.kind, CapabilityKind::Deno);
        assert_eq!(meta.routing, RoutingPreference::Client);
        assert!(meta.mcp_deps.is_empty());
        assert!(meta.integrity.is_none());
    }

    #[test]
    fn deserialize_with_dependency() {
        let raw = r#"{
            "fqdn": "pml.mcp.memory.store",
            "type": "deno",
            "codeUrl": "https://cdn.example/code.js",
            "tools": ["memory:store", "memory:recall"],
            "routing": "client",
            "mcpDeps": [{
                "name": "memory",
                "type": "stdio",
                "install": "npx @mcp/memory@1.0.0",
                "version": "1.0.0",
                "integrity": "sha256-abc123",
                "envRequired": ["MEMORY_API_KEY"]
            }]
        }"#;
        let meta: CapabilityMetadata = serde_json::from_str(raw).unwrap();
        let dep = meta.dep_for_namespace("memory").unwrap();
        assert_eq!(dep.version, "1.0.0");
        assert_eq!(dep.transport, DepTransport::Stdio);
        assert_eq!(dep.env_required, vec!["MEMORY_API_KEY"]);
        assert!(meta.dep_for_namespace("unknown").is_none());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let raw = r#"{"fqdn": "a.b.c.d", "type": "deno", "tools": [], "routing": "client"}"#;
        assert!(serde_json::from_str::<CapabilityMetadata>(raw).is_err());
    }

    #[test]
    fn unknown_capability_kind_is_rejected() {
        let raw = r#"{
            "fqdn": "a.b.c.d",
            "type": "wasm",
            "codeUrl": "https://x",
            "tools": [],
            "routing": "client"
        }"#;
        assert!(serde_json::from_str::<CapabilityMetadata>(raw).is_err());
    }
}
