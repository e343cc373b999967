//! `caprun-state` — persisted runtime state.
//!
//! Two independent JSON documents (neither's absence implies the
//! other's):
//! - The **integrity lockfile** (per workspace): last-approved content
//!   hash per capability base name, with change-approval semantics.
//! - The **dependency state** (per user, under the home directory):
//!   which subprocess packages are installed, at which version, with
//!   which verified integrity.
//!
//! Plus the integrity-token parsing both share, and workspace-root
//! resolution with safe path joining.

pub mod deps;
pub mod integrity;
pub mod lockfile;
pub mod workspace;

pub use deps::{DependencyState, InstalledDep};
pub use integrity::{sha256_token, short_hash, IntegrityToken};
pub use lockfile::{Lockfile, LockfileEntry, LockfileVerdict, LockKind};
pub use workspace::{resolve_workspace_root, safe_join, WORKSPACE_ENV};
