//! Tool identifiers and fully-qualified capability names.
//!
//! A tool identifier is a `(namespace, action)` pair. Two serializations
//! are accepted on input — the colon form `ns:action` and the legacy
//! double-underscore form `mcp__ns__action` — and the colon form is
//! always emitted. A capability name (FQCN) is dot-separated with at
//! least four segments; the first four form the lockfile base key.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};

/// Prefix of the legacy identifier serialization.
const LEGACY_PREFIX: &str = "mcp__";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ToolId
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A `(namespace, action)` tool identifier.
///
/// The namespace is the routing and permission key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolId {
    pub namespace: String,
    pub action: String,
}

impl ToolId {
    pub fn new(namespace: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            action: action.into(),
        }
    }

    /// Parse either accepted serialization.
    ///
    /// - `ns:action` — split at the first colon.
    /// - `mcp__ns__action` — second segment is the namespace, the rest
    ///   is the action (actions may themselves contain `__`).
    ///
    /// Returns `None` when neither shape applies.
    pub fn parse(raw: &str) -> Option<Self> {
        if let Some(rest) = raw.strip_prefix(LEGACY_PREFIX) {
            let (namespace, action) = rest.split_once("__")?;
            if namespace.is_empty() || action.is_empty() {
                return None;
            }
            return Some(Self::new(namespace, action));
        }
        let (namespace, action) = raw.split_once(':')?;
        if action.is_empty() {
            return None;
        }
        Some(Self::new(namespace, action))
    }

    /// Extract just the namespace from either serialization, without
    /// requiring the whole identifier to be well-formed.
    pub fn namespace_of(raw: &str) -> Option<&str> {
        if let Some(rest) = raw.strip_prefix(LEGACY_PREFIX) {
            return rest.split("__").next().filter(|ns| !ns.is_empty());
        }
        raw.split(':').next().filter(|ns| !ns.is_empty())
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.action)
    }
}

impl FromStr for ToolId {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw).ok_or_else(|| {
            Error::new(
                ErrorKind::MetadataParseError,
                format!("malformed tool identifier: {raw:?}"),
            )
            .with("identifier", raw)
        })
    }
}

impl Serialize for ToolId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ToolId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("malformed tool identifier: {raw:?}")))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fqcn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Dot-separated capability name, e.g. `casys.pml.cache.test` or with a
/// trailing revision hash `pml.mcp.tavily.server.f9a0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fqcn(String);

impl Fqcn {
    /// Canonicalize any accepted identifier spelling into a dotted name:
    /// `ns:action` → `ns.action`, `mcp__ns__action` → `ns.action`, a
    /// dotted name passes through unchanged.
    pub fn from_identifier(raw: &str) -> Self {
        if let Some(id) = ToolId::parse(raw) {
            return Self(format!("{}.{}", id.namespace, id.action));
        }
        Self(raw.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The lockfile key: the first four dot segments, or the whole name
    /// when it has fewer.
    pub fn canonical_base(&self) -> String {
        let segments: Vec<&str> = self.0.split('.').collect();
        if segments.len() <= 4 {
            self.0.clone()
        } else {
            segments[..4].join(".")
        }
    }

    pub fn segment_count(&self) -> usize {
        self.0.split('.').count()
    }
}

impl fmt::Display for Fqcn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fqcn {
    fn from(raw: &str) -> Self {
        Self::from_identifier(raw)
    }
}
