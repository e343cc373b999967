//! Runtime construction — every subsystem wired into one owning struct.
//!
//! Nothing here is a process-global: embedders construct a [`Runtime`]
//! and thread it explicitly. Cloning is cheap (one `Arc`).

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use caprun_domain::config::{ConfigSeverity, RuntimeConfig};
use caprun_domain::error::Result;
use caprun_installer::Installer;
use caprun_mcp_client::SubprocessManager;
use caprun_policy::{PermissionPolicy, RoutingTable};
use caprun_registry::RegistryClient;
use caprun_sandbox::SandboxExecutor;
use caprun_state::workspace::lockfile_path;
use caprun_state::{resolve_workspace_root, DependencyState, Lockfile};
use caprun_trace::TraceSyncer;
use caprun_workflow::WorkflowStore;

use crate::loader::LoadedCapability;

pub(crate) struct RuntimeInner {
    pub(crate) config: RuntimeConfig,
    pub(crate) registry: RegistryClient,
    pub(crate) policy: PermissionPolicy,
    pub(crate) routing: RoutingTable,
    pub(crate) deps: Arc<DependencyState>,
    pub(crate) installer: Installer,
    pub(crate) lockfile: Lockfile,
    pub(crate) subprocesses: SubprocessManager,
    pub(crate) workflows: WorkflowStore,
    pub(crate) sandbox: SandboxExecutor,
    pub(crate) syncer: TraceSyncer,
    pub(crate) http: reqwest::Client,
    /// Loaded-capability cache, keyed by canonical dotted name.
    pub(crate) loaded: Mutex<HashMap<String, Arc<LoadedCapability>>>,
}

/// The capability execution runtime.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Build a runtime with auto-detected state locations: the
    /// workspace root (for the lockfile) and the per-user dependency
    /// state under the home directory.
    pub fn new(config: RuntimeConfig) -> anyhow::Result<Self> {
        let workspace_root = resolve_workspace_root();
        let deps_path = DependencyState::default_path();
        Self::with_paths(config, &workspace_root, &deps_path)
    }

    /// Build a runtime with explicit state locations.
    pub fn with_paths(
        config: RuntimeConfig,
        workspace_root: &Path,
        deps_path: &Path,
    ) -> anyhow::Result<Self> {
        // ── Config validation ────────────────────────────────────────
        let issues = config.validate();
        for issue in &issues {
            match issue.severity {
                ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
                ConfigSeverity::Error => tracing::error!("config: {issue}"),
            }
        }
        if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
            anyhow::bail!(
                "config validation failed with {} error(s)",
                issues
                    .iter()
                    .filter(|i| i.severity == ConfigSeverity::Error)
                    .count()
            );
        }

        let registry = RegistryClient::new(&config.registry);
        tracing::info!(url = %config.registry.cloud_url, "registry client ready");

        let deps = Arc::new(DependencyState::load(deps_path));
        let installer =
            Installer::with_registry(deps.clone(), &config.installer.package_registry_url);

        let lockfile = Lockfile::load(
            &lockfile_path(workspace_root)?,
            config.lockfile.auto_approve_new,
        );
        tracing::info!(workspace = %workspace_root.display(), "workspace state ready");

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.registry.fetch_timeout_sec))
            .build()
            .unwrap_or_default();

        let inner = RuntimeInner {
            registry,
            policy: PermissionPolicy::new(config.policy.clone()),
            routing: RoutingTable::new(config.routing.clone()),
            deps,
            installer,
            lockfile,
            subprocesses: SubprocessManager::new(config.subprocess.clone()),
            workflows: WorkflowStore::new(),
            sandbox: SandboxExecutor::new(config.sandbox.clone()),
            syncer: TraceSyncer::new(&config.trace),
            http,
            loaded: Mutex::new(HashMap::new()),
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Orderly shutdown: subprocess handles, sandbox, and a final trace
    /// flush.
    pub async fn shutdown(&self) {
        self.inner.subprocesses.shutdown_all().await;
        self.inner.sandbox.shutdown();
        self.inner.syncer.flush().await;
        tracing::info!("runtime shut down");
    }

    // ── Lockfile maintenance ────────────────────────────────────────

    /// Drop lockfile entries whose canonical base is not in `keep`.
    /// Returns the number removed.
    pub fn sync_lockfile(&self, keep: &HashSet<String>) -> Result<usize> {
        self.inner.lockfile.sync(keep)
    }

    /// Drop lockfile entries not updated within `max_age`. Returns the
    /// number removed.
    pub fn prune_lockfile(&self, max_age: Duration) -> Result<usize> {
        self.inner.lockfile.prune(max_age)
    }

    // ── Observability accessors ─────────────────────────────────────

    /// Live (non-expired) pending workflow count.
    pub fn pending_workflows(&self) -> usize {
        self.inner.workflows.size()
    }

    /// Network metadata fetches performed so far (cache hits excluded).
    pub fn metadata_fetch_count(&self) -> u64 {
        self.inner.registry.fetch_count()
    }

    /// Names of currently running subprocess handles.
    pub async fn running_subprocesses(&self) -> Vec<String> {
        self.inner.subprocesses.running().await
    }
}
