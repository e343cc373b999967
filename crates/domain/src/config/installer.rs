use serde::{Deserialize, Serialize};

/// Dependency-installer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallerConfig {
    /// Upstream package registry packages are resolved against.
    #[serde(default = "d_package_registry")]
    pub package_registry_url: String,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            package_registry_url: d_package_registry(),
        }
    }
}

fn d_package_registry() -> String {
    "https://registry.npmjs.org".into()
}
