//! Workspace-root resolution and safe path joining.
//!
//! The workspace root anchors the integrity lockfile. An explicit
//! `CAPRUN_WORKSPACE` override wins; otherwise resolution walks up from
//! the working directory looking for common project markers.

use std::path::{Component, Path, PathBuf};

use caprun_domain::error::{Error, ErrorKind, Result};

/// Environment variable overriding workspace-root auto-detection.
pub const WORKSPACE_ENV: &str = "CAPRUN_WORKSPACE";

/// Files/directories that mark a project root.
const MARKERS: &[&str] = &[".git", "Cargo.toml", "package.json", "deno.json", "pyproject.toml"];

/// Resolve the workspace root: env override (must name an existing
/// directory), then marker walk from the CWD, then the CWD itself.
pub fn resolve_workspace_root() -> PathBuf {
    if let Ok(value) = std::env::var(WORKSPACE_ENV) {
        let path = PathBuf::from(&value);
        if path.is_dir() {
            return path;
        }
        tracing::warn!(
            path = %value,
            "{} does not name a directory, falling back to auto-detection",
            WORKSPACE_ENV
        );
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    detect_from(&cwd)
}

/// Walk up from `start` until a directory containing a marker is found.
pub fn detect_from(start: &Path) -> PathBuf {
    let mut dir = start;
    loop {
        if MARKERS.iter().any(|m| dir.join(m).exists()) {
            return dir.to_path_buf();
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => return start.to_path_buf(),
        }
    }
}

/// Join a relative path onto a workspace root, refusing escapes.
///
/// Absolute paths fail `path-outside-workspace`; `..` components fail
/// `path-traversal-attack`.
pub fn safe_join(root: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    if rel.is_absolute() {
        return Err(Error::new(
            ErrorKind::PathOutsideWorkspace,
            format!("absolute path not permitted: {relative:?}"),
        )
        .with("path", relative)
        .with("workspace", root.display().to_string()));
    }
    for component in rel.components() {
        if matches!(component, Component::ParentDir) {
            return Err(Error::new(
                ErrorKind::PathTraversalAttack,
                format!("parent-directory component in {relative:?}"),
            )
            .with("path", relative)
            .with("workspace", root.display().to_string()));
        }
    }
    Ok(root.join(rel))
}

/// Per-workspace lockfile location, resolved through [`safe_join`].
pub fn lockfile_path(root: &Path) -> Result<PathBuf> {
    safe_join(root, ".caprun/caprun-lock.json")
}
