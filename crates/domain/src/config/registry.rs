use serde::{Deserialize, Serialize};

/// Registry and cloud-endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Base URL for `/mcp/<fqcn>` metadata fetches and `/mcp/tools/call`
    /// remote dispatch.
    #[serde(default = "d_cloud_url")]
    pub cloud_url: String,
    /// Metadata fetch timeout (seconds).
    #[serde(default = "d_fetch_timeout")]
    pub fetch_timeout_sec: u64,
    /// Metadata LRU cache capacity.
    #[serde(default = "d_cache_capacity")]
    pub cache_capacity: usize,
    /// Environment variable holding the cloud bearer credential.
    #[serde(default = "d_auth_token_env")]
    pub auth_token_env: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cloud_url: d_cloud_url(),
            fetch_timeout_sec: d_fetch_timeout(),
            cache_capacity: d_cache_capacity(),
            auth_token_env: d_auth_token_env(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_cloud_url() -> String {
    "https://cloud.caprun.dev".into()
}
fn d_fetch_timeout() -> u64 {
    10
}
fn d_cache_capacity() -> usize {
    100
}
fn d_auth_token_env() -> String {
    "CAPRUN_API_KEY".into()
}
