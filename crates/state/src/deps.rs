//! Installed-dependency state.
//!
//! A process-wide JSON document under the user's home directory:
//! `{version: 1, installed: {<name>: {name, version, integrity,
//! installedAt, installCommand, installPath?}}}`. The installer is the
//! sole writer; an installed record existing is exactly what "the
//! dependency is satisfied" means. All in-memory mutation funnels
//! through the methods here; a dirty flag suppresses redundant saves.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use caprun_domain::capability::SubprocessDep;
use caprun_domain::error::{Error, ErrorKind, Result};

const DEPS_VERSION: u32 = 1;

/// One installed subprocess package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledDep {
    pub name: String,
    pub version: String,
    /// The verified integrity token.
    pub integrity: String,
    #[serde(rename = "installedAt")]
    pub installed_at: DateTime<Utc>,
    #[serde(rename = "installCommand")]
    pub install_command: String,
    #[serde(rename = "installPath", default, skip_serializing_if = "Option::is_none")]
    pub install_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DepsDocument {
    version: u32,
    #[serde(default)]
    installed: BTreeMap<String, InstalledDep>,
}

impl Default for DepsDocument {
    fn default() -> Self {
        Self {
            version: DEPS_VERSION,
            installed: BTreeMap::new(),
        }
    }
}

struct Inner {
    doc: DepsDocument,
    dirty: bool,
}

/// Persisted record of installed subprocess packages.
pub struct DependencyState {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl DependencyState {
    /// The process-wide default location: `~/.caprun/deps.json`.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".caprun")
            .join("deps.json")
    }

    /// Load or create the document at `path`. A corrupt file falls back
    /// to an empty document in memory; the file is only rewritten on
    /// the next legitimate write.
    pub fn load(path: &Path) -> Self {
        let doc = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<DepsDocument>(&raw) {
                Ok(doc) => doc,
                Err(error) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %error,
                        "corrupt dependency state, starting from empty document"
                    );
                    DepsDocument::default()
                }
            },
            Err(_) => DepsDocument::default(),
        };
        tracing::debug!(
            path = %path.display(),
            installed = doc.installed.len(),
            "dependency state loaded"
        );
        Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner { doc, dirty: false }),
        }
    }

    /// Is this exact `(name, version)` pair installed?
    pub fn is_installed(&self, name: &str, version: &str) -> bool {
        self.inner
            .lock()
            .doc
            .installed
            .get(name)
            .is_some_and(|dep| dep.version == version)
    }

    pub fn get(&self, name: &str) -> Option<InstalledDep> {
        self.inner.lock().doc.installed.get(name).cloned()
    }

    pub fn all(&self) -> Vec<InstalledDep> {
        self.inner.lock().doc.installed.values().cloned().collect()
    }

    /// A declared dependency needs work when absent or at another version.
    pub fn needs_update(&self, dep: &SubprocessDep) -> bool {
        !self.is_installed(&dep.name, &dep.version)
    }

    /// The subset of `deps` that is missing or outdated, declaration
    /// order preserved.
    pub fn missing_or_outdated(&self, deps: &[SubprocessDep]) -> Vec<SubprocessDep> {
        deps.iter()
            .filter(|dep| self.needs_update(dep))
            .cloned()
            .collect()
    }

    /// Record a successful install and save.
    pub fn mark_installed(
        &self,
        dep: &SubprocessDep,
        verified_integrity: &str,
        install_path: Option<PathBuf>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.doc.installed.insert(
            dep.name.clone(),
            InstalledDep {
                name: dep.name.clone(),
                version: dep.version.clone(),
                integrity: verified_integrity.to_string(),
                installed_at: Utc::now(),
                install_command: dep.install.clone(),
                install_path,
            },
        );
        inner.dirty = true;
        self.save_locked(&mut inner)?;
        tracing::info!(dep = %dep.name, version = %dep.version, "dependency marked installed");
        Ok(())
    }

    /// Remove a record. Returns whether one existed.
    pub fn mark_uninstalled(&self, name: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        let removed = inner.doc.installed.remove(name).is_some();
        if removed {
            inner.dirty = true;
            self.save_locked(&mut inner)?;
            tracing::info!(dep = %name, "dependency marked uninstalled");
        }
        Ok(removed)
    }

    /// Write to disk when dirty; a clean state is a no-op.
    pub fn save(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.save_locked(&mut inner)
    }

    fn save_locked(&self, inner: &mut Inner) -> Result<()> {
        if !inner.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let json = serde_json::to_string_pretty(&inner.doc)
            .map_err(|e| self.io_error(std::io::Error::other(e)))?;
        std::fs::write(&self.path, json).map_err(|e| self.io_error(e))?;
        inner.dirty = false;
        Ok(())
    }

    fn io_error(&self, error: std::io::Error) -> Error {
        Error::new(
            ErrorKind::DependencyInstallFailed,
            format!("dependency state write failed: {error}"),
        )
        .with("path", self.path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dep(name: &str, version: &str) -> SubprocessDep {
        SubprocessDep {
            name: name.into(),
            transport: Default::default(),
            install: format!("npx @mcp/{name}@{version}"),
            version: version.into(),
            integrity: "sha256-abc123".into(),
            env_required: vec![],
            command: None,
            args: None,
        }
    }

    fn make_state() -> (tempfile::TempDir, DependencyState) {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("deps.json");
        (tmp, DependencyState::load(&path))
    }

    #[test]
    fn install_round_trip() {
        let (_tmp, state) = make_state();
        let memory = dep("memory", "1.0.0");
        state.mark_installed(&memory, "sha256-abc123", None).unwrap();

        assert!(state.is_installed("memory", "1.0.0"));
        let record = state.get("memory").unwrap();
        assert_eq!(record.integrity, "sha256-abc123");
        assert_eq!(record.install_command, "npx @mcp/memory@1.0.0");
    }

    #[test]
    fn version_mismatch_is_not_installed() {
        let (_tmp, state) = make_state();
        state.mark_installed(&dep("memory", "1.0.0"), "sha256-x", None).unwrap();
        assert!(!state.is_installed("memory", "2.0.0"));
        assert!(state.needs_update(&dep("memory", "2.0.0")));
        assert!(!state.needs_update(&dep("memory", "1.0.0")));
    }

    #[test]
    fn missing_or_outdated_preserves_order() {
        let (_tmp, state) = make_state();
        state.mark_installed(&dep("b", "1.0.0"), "sha256-x", None).unwrap();
        let declared = vec![dep("a", "1.0.0"), dep("b", "1.0.0"), dep("c", "1.0.0")];
        let pending = state.missing_or_outdated(&declared);
        let names: Vec<_> = pending.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn persists_across_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("deps.json");
        {
            let state = DependencyState::load(&path);
            state.mark_installed(&dep("memory", "1.0.0"), "sha256-x", None).unwrap();
        }
        let reloaded = DependencyState::load(&path);
        assert!(reloaded.is_installed("memory", "1.0.0"));
    }

    #[test]
    fn mark_uninstalled_removes_record() {
        let (_tmp, state) = make_state();
        state.mark_installed(&dep("memory", "1.0.0"), "sha256-x", None).unwrap();
        assert!(state.mark_uninstalled("memory").unwrap());
        assert!(!state.is_installed("memory", "1.0.0"));
        assert!(!state.mark_uninstalled("memory").unwrap());
    }

    #[test]
    fn clean_save_does_not_touch_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("deps.json");
        let state = DependencyState::load(&path);
        state.save().unwrap();
        // No mutation happened: nothing was written.
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_file_falls_back_to_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("deps.json");
        std::fs::write(&path, "][").unwrap();
        let state = DependencyState::load(&path);
        assert!(state.all().is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "][");
    }

    #[test]
    fn document_schema_version_is_written() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("deps.json");
        let state = DependencyState::load(&path);
        state.mark_installed(&dep("memory", "1.0.0"), "sha256-x", None).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["version"], 1);
        assert!(value["installed"]["memory"]["installedAt"].is_string());
    }
}
