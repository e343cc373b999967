//! Static routing table: namespace → local or remote dispatch.

use caprun_domain::config::{Route, RoutingConfig};
use caprun_domain::identifier::ToolId;

/// Classifies tool identifiers against the configured namespace lists.
///
/// Both identifier serializations are accepted; only the namespace part
/// is consulted. Empty, malformed, or unknown namespaces classify as the
/// configured default.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    config: RoutingConfig,
}

impl RoutingTable {
    pub fn new(config: RoutingConfig) -> Self {
        Self { config }
    }

    /// Classify a raw identifier in either serialization.
    pub fn classify(&self, identifier: &str) -> Route {
        match ToolId::namespace_of(identifier) {
            Some(ns) => self.classify_namespace(ns),
            None => self.config.default_route,
        }
    }

    /// Classify an already-parsed identifier.
    pub fn classify_id(&self, id: &ToolId) -> Route {
        if id.namespace.is_empty() {
            return self.config.default_route;
        }
        self.classify_namespace(&id.namespace)
    }

    fn classify_namespace(&self, namespace: &str) -> Route {
        if self.config.local_namespaces.iter().any(|n| n == namespace) {
            Route::Local
        } else if self.config.remote_namespaces.iter().any(|n| n == namespace) {
            Route::Remote
        } else {
            self.config.default_route
        }
    }
}
