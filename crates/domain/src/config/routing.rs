use serde::{Deserialize, Serialize};

/// Where a tool call is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    /// Load and execute in this runtime.
    Local,
    /// Forward to the cloud endpoint.
    Remote,
}

/// Static routing table configuration: which namespaces run locally,
/// which remotely, and where unknowns go.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub local_namespaces: Vec<String>,
    #[serde(default)]
    pub remote_namespaces: Vec<String>,
    /// Classification for namespaces in neither list (and for empty or
    /// unparseable identifiers).
    #[serde(default = "d_default_route")]
    pub default_route: Route,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            local_namespaces: Vec::new(),
            remote_namespaces: Vec::new(),
            default_route: d_default_route(),
        }
    }
}

fn d_default_route() -> Route {
    Route::Remote
}
