mod installer;
mod limits;
mod lockfile;
mod policy;
mod registry;
mod routing;
mod trace;

pub use installer::*;
pub use limits::*;
pub use lockfile::*;
pub use policy::*;
pub use registry::*;
pub use routing::*;
pub use trace::*;

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Runtime configuration, deserialized from TOML. Every section has
/// working defaults so an empty document is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub lockfile: LockfileConfig,
    #[serde(default)]
    pub installer: InstallerConfig,
    #[serde(default)]
    pub subprocess: SubprocessConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub trace: TraceConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl RuntimeConfig {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        let error = |field: &str, message: String| ConfigError {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message,
        };

        // Registry URL must be a valid http(s) URL.
        if self.registry.cloud_url.is_empty() {
            errors.push(error("registry.cloud_url", "cloud_url must not be empty".into()));
        } else if !self.registry.cloud_url.starts_with("http://")
            && !self.registry.cloud_url.starts_with("https://")
        {
            errors.push(error(
                "registry.cloud_url",
                format!(
                    "cloud_url must start with http:// or https:// (got \"{}\")",
                    self.registry.cloud_url
                ),
            ));
        }

        if self.registry.fetch_timeout_sec == 0 {
            errors.push(error(
                "registry.fetch_timeout_sec",
                "fetch timeout must be greater than 0".into(),
            ));
        }
        if self.registry.cache_capacity == 0 {
            errors.push(error(
                "registry.cache_capacity",
                "cache capacity must be greater than 0".into(),
            ));
        }
        if self.registry.auth_token_env.is_empty() {
            errors.push(error(
                "registry.auth_token_env",
                "auth_token_env must name an environment variable".into(),
            ));
        }

        if self.installer.package_registry_url.is_empty()
            || (!self.installer.package_registry_url.starts_with("http://")
                && !self.installer.package_registry_url.starts_with("https://"))
        {
            errors.push(error(
                "installer.package_registry_url",
                format!(
                    "package_registry_url must start with http:// or https:// (got \"{}\")",
                    self.installer.package_registry_url
                ),
            ));
        }

        if self.subprocess.request_timeout_sec == 0 {
            errors.push(error(
                "subprocess.request_timeout_sec",
                "request timeout must be greater than 0".into(),
            ));
        }
        if self.subprocess.idle_timeout_sec == 0 {
            errors.push(error(
                "subprocess.idle_timeout_sec",
                "idle timeout must be greater than 0".into(),
            ));
        }

        if self.sandbox.execution_timeout_sec == 0 {
            errors.push(error(
                "sandbox.execution_timeout_sec",
                "execution timeout must be greater than 0".into(),
            ));
        }
        if self.sandbox.rpc_timeout_sec == 0 {
            errors.push(error(
                "sandbox.rpc_timeout_sec",
                "rpc timeout must be greater than 0".into(),
            ));
        }

        // Trace endpoint, when set, must be a valid http(s) URL.
        if !self.trace.endpoint.is_empty()
            && !self.trace.endpoint.starts_with("http://")
            && !self.trace.endpoint.starts_with("https://")
        {
            errors.push(error(
                "trace.endpoint",
                format!(
                    "endpoint must start with http:// or https:// (got \"{}\")",
                    self.trace.endpoint
                ),
            ));
        }
        if self.trace.batch_size == 0 {
            errors.push(error("trace.batch_size", "batch size must be greater than 0".into()));
        }

        // A namespace configured both local and remote routes locally;
        // flag the ambiguity.
        for ns in &self.routing.local_namespaces {
            if self.routing.remote_namespaces.contains(ns) {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Warning,
                    field: "routing".into(),
                    message: format!(
                        "namespace \"{ns}\" is listed both local and remote — local wins"
                    ),
                });
            }
        }

        // Policy patterns must not be empty strings.
        for (list, name) in [
            (&self.policy.deny, "policy.deny"),
            (&self.policy.allow, "policy.allow"),
            (&self.policy.ask, "policy.ask"),
        ] {
            for (i, pattern) in list.iter().enumerate() {
                if pattern.is_empty() {
                    errors.push(error(
                        &format!("{name}[{i}]"),
                        "pattern must not be empty".into(),
                    ));
                }
            }
        }

        errors
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn find_issue<'a>(issues: &'a [ConfigError], field_prefix: &str) -> Option<&'a ConfigError> {
        issues.iter().find(|e| e.field.starts_with(field_prefix))
    }

    #[test]
    fn default_config_is_valid() {
        let issues = RuntimeConfig::default().validate();
        let errors: Vec<_> = issues
            .iter()
            .filter(|e| e.severity == ConfigSeverity::Error)
            .collect();
        assert!(errors.is_empty(), "expected no errors, got: {errors:?}");
    }

    #[test]
    fn empty_toml_parses_to_defaults() {
        let cfg: RuntimeConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.subprocess.request_timeout_sec, 30);
        assert_eq!(cfg.subprocess.idle_timeout_sec, 300);
        assert_eq!(cfg.registry.fetch_timeout_sec, 10);
        assert_eq!(cfg.registry.cache_capacity, 100);
        assert!(cfg.lockfile.auto_approve_new);
    }

    #[test]
    fn parses_full_document() {
        let cfg: RuntimeConfig = toml::from_str(
            r#"
            [registry]
            cloud_url = "https://cloud.example"
            fetch_timeout_sec = 5

            [routing]
            local_namespaces = ["cache"]
            remote_namespaces = ["search"]
            default_route = "local"

            [policy]
            deny = ["ssh:*"]
            ask = ["*"]

            [lockfile]
            auto_approve_new = false

            [trace]
            endpoint = "https://traces.example/ingest"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.registry.cloud_url, "https://cloud.example");
        assert_eq!(cfg.routing.default_route, Route::Local);
        assert_eq!(cfg.policy.deny, vec!["ssh:*"]);
        assert!(!cfg.lockfile.auto_approve_new);
        assert!(cfg.validate().iter().all(|i| i.severity != ConfigSeverity::Error));
    }

    #[test]
    fn bad_cloud_url_is_error() {
        let mut cfg = RuntimeConfig::default();
        cfg.registry.cloud_url = "ftp://registry".into();
        let issues = cfg.validate();
        let issue = find_issue(&issues, "registry.cloud_url").expect("expected cloud_url error");
        assert_eq!(issue.severity, ConfigSeverity::Error);
    }

    #[test]
    fn zero_timeouts_are_errors() {
        let mut cfg = RuntimeConfig::default();
        cfg.subprocess.request_timeout_sec = 0;
        cfg.sandbox.rpc_timeout_sec = 0;
        let issues = cfg.validate();
        assert!(find_issue(&issues, "subprocess.request_timeout_sec").is_some());
        assert!(find_issue(&issues, "sandbox.rpc_timeout_sec").is_some());
    }

    #[test]
    fn namespace_in_both_routing_lists_is_warning() {
        let mut cfg = RuntimeConfig::default();
        cfg.routing.local_namespaces = vec!["cache".into()];
        cfg.routing.remote_namespaces = vec!["cache".into()];
        let issues = cfg.validate();
        let issue = find_issue(&issues, "routing").expect("expected routing warning");
        assert_eq!(issue.severity, ConfigSeverity::Warning);
    }

    #[test]
    fn empty_policy_pattern_is_error() {
        let mut cfg = RuntimeConfig::default();
        cfg.policy.deny = vec!["".into()];
        let issues = cfg.validate();
        assert!(find_issue(&issues, "policy.deny[0]").is_some());
    }

    #[test]
    fn trace_endpoint_scheme_checked_only_when_set() {
        let mut cfg = RuntimeConfig::default();
        cfg.trace.endpoint = String::new();
        assert!(find_issue(&cfg.validate(), "trace.endpoint").is_none());

        cfg.trace.endpoint = "not-a-url".into();
        assert!(find_issue(&cfg.validate(), "trace.endpoint").is_some());
    }
}
