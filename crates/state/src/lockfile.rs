//! Integrity lockfile — last-approved content hash per capability base.
//!
//! Persisted per workspace as a versioned JSON document:
//! `{version: 1, entries: {<fqcn-base>: {integrity, type, approved,
//! createdAt, updatedAt}}, updatedAt}`. At most one entry per base is
//! structural (the map key). A single in-memory writer serializes every
//! mutation and save; a corrupt file on load falls back to an empty
//! document in memory and is only rewritten by the next legitimate
//! write.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use caprun_domain::error::{Error, ErrorKind, Result};
use caprun_domain::identifier::Fqcn;

use crate::integrity::short_hash;

const LOCKFILE_VERSION: u32 = 1;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Document types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What kind of content the recorded hash covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockKind {
    /// Capability code fetched from `codeUrl`.
    #[serde(rename = "local-code")]
    LocalCode,
    /// A subprocess dependency package.
    #[serde(rename = "subprocess", alias = "stdio")]
    Subprocess,
}

/// One recorded approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockfileEntry {
    pub integrity: String,
    #[serde(rename = "type")]
    pub kind: LockKind,
    pub approved: bool,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockfileDocument {
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, LockfileEntry>,
    #[serde(rename = "updatedAt")]
    updated_at: DateTime<Utc>,
}

impl Default for LockfileDocument {
    fn default() -> Self {
        Self {
            version: LOCKFILE_VERSION,
            entries: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Outcome of validating a received hash against the lockfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockfileVerdict {
    Valid,
    /// The hash drifted from the recorded one; human approval needed.
    ApprovalRequired {
        fqcn_base: String,
        old_short: String,
        new_short: String,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lockfile
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-workspace integrity lockfile with change-approval semantics.
pub struct Lockfile {
    path: PathBuf,
    auto_approve_new: bool,
    inner: Mutex<LockfileDocument>,
}

impl Lockfile {
    /// Load or create the lockfile at `path`.
    pub fn load(path: &Path, auto_approve_new: bool) -> Self {
        let doc = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<LockfileDocument>(&raw) {
                Ok(doc) => doc,
                Err(error) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %error,
                        "corrupt lockfile, starting from empty document"
                    );
                    LockfileDocument::default()
                }
            },
            Err(_) => LockfileDocument::default(),
        };
        tracing::debug!(
            path = %path.display(),
            entries = doc.entries.len(),
            "lockfile loaded"
        );
        Self {
            path: path.to_path_buf(),
            auto_approve_new,
            inner: Mutex::new(doc),
        }
    }

    /// Validate a received hash for a capability.
    ///
    /// - No prior entry: record the hash (when `auto_approve_new`) and
    ///   return `Valid`; without auto-trust the first sighting also
    ///   requires approval.
    /// - Prior entry, equal hash: `Valid`.
    /// - Prior entry, different hash: `ApprovalRequired` with short
    ///   prefixes of both hashes.
    pub fn validate(&self, fqcn: &Fqcn, received: &str, kind: LockKind) -> Result<LockfileVerdict> {
        let base = fqcn.canonical_base();
        let mut doc = self.inner.lock();

        match doc.entries.get(&base) {
            None => {
                if !self.auto_approve_new {
                    return Ok(LockfileVerdict::ApprovalRequired {
                        fqcn_base: base,
                        old_short: String::new(),
                        new_short: short_hash(received),
                    });
                }
                let now = Utc::now();
                doc.entries.insert(
                    base.clone(),
                    LockfileEntry {
                        integrity: received.to_string(),
                        kind,
                        approved: true,
                        created_at: now,
                        updated_at: now,
                    },
                );
                self.save(&mut doc)?;
                tracing::info!(fqcn = %base, integrity = %short_hash(received), "lockfile: first-seen hash recorded");
                Ok(LockfileVerdict::Valid)
            }
            Some(entry) if entry.integrity == received => Ok(LockfileVerdict::Valid),
            Some(entry) => Ok(LockfileVerdict::ApprovalRequired {
                fqcn_base: base,
                old_short: short_hash(&entry.integrity),
                new_short: short_hash(received),
            }),
        }
    }

    /// Record an explicitly approved hash change.
    pub fn approve(&self, fqcn: &Fqcn, new_hash: &str, kind: LockKind) -> Result<()> {
        let base = fqcn.canonical_base();
        let mut doc = self.inner.lock();
        let now = Utc::now();
        match doc.entries.get_mut(&base) {
            Some(entry) => {
                entry.integrity = new_hash.to_string();
                entry.kind = kind;
                entry.approved = true;
                entry.updated_at = now;
            }
            None => {
                doc.entries.insert(
                    base.clone(),
                    LockfileEntry {
                        integrity: new_hash.to_string(),
                        kind,
                        approved: true,
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }
        self.save(&mut doc)?;
        tracing::info!(fqcn = %base, integrity = %short_hash(new_hash), "lockfile: hash approved");
        Ok(())
    }

    /// Remove entries whose base is not in `keep`.
    pub fn sync(&self, keep: &HashSet<String>) -> Result<usize> {
        let mut doc = self.inner.lock();
        let before = doc.entries.len();
        doc.entries.retain(|base, _| keep.contains(base));
        let removed = before - doc.entries.len();
        if removed > 0 {
            self.save(&mut doc)?;
            tracing::info!(removed, "lockfile: synced");
        }
        Ok(removed)
    }

    /// Remove entries not updated within `max_age`.
    pub fn prune(&self, max_age: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let mut doc = self.inner.lock();
        let before = doc.entries.len();
        doc.entries.retain(|_, entry| entry.updated_at >= cutoff);
        let removed = before - doc.entries.len();
        if removed > 0 {
            self.save(&mut doc)?;
            tracing::info!(removed, "lockfile: pruned stale entries");
        }
        Ok(removed)
    }

    pub fn get(&self, fqcn: &Fqcn) -> Option<LockfileEntry> {
        self.inner.lock().entries.get(&fqcn.canonical_base()).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    fn save(&self, doc: &mut LockfileDocument) -> Result<()> {
        doc.updated_at = Utc::now();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_error(&self.path, e))?;
        }
        let json = serde_json::to_string_pretty(doc)
            .map_err(|e| io_error(&self.path, std::io::Error::other(e)))?;
        std::fs::write(&self.path, json).map_err(|e| io_error(&self.path, e))
    }
}

fn io_error(path: &Path, error: std::io::Error) -> Error {
    Error::new(
        ErrorKind::DependencyInstallFailed,
        format!("lockfile write failed: {error}"),
    )
    .with("path", path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_lockfile(auto_approve: bool) -> (tempfile::TempDir, Lockfile) {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".caprun").join("caprun-lock.json");
        let lockfile = Lockfile::load(&path, auto_approve);
        (tmp, lockfile)
    }

    #[test]
    fn first_seen_auto_trusts_and_persists() {
        let (tmp, lockfile) = make_lockfile(true);
        let fqcn = Fqcn::from_identifier("casys.pml.cache.test");
        let verdict = lockfile
            .validate(&fqcn, "sha256-abc", LockKind::LocalCode)
            .unwrap();
        assert_eq!(verdict, LockfileVerdict::Valid);

        // Reload from disk: the entry must have been written.
        let path = tmp.path().join(".caprun").join("caprun-lock.json");
        let reloaded = Lockfile::load(&path, true);
        let entry = reloaded.get(&fqcn).unwrap();
        assert_eq!(entry.integrity, "sha256-abc");
        assert!(entry.approved);
    }

    #[test]
    fn first_seen_without_auto_trust_requires_approval() {
        let (_tmp, lockfile) = make_lockfile(false);
        let fqcn = Fqcn::from_identifier("a.b.c.d");
        let verdict = lockfile
            .validate(&fqcn, "sha256-abc", LockKind::LocalCode)
            .unwrap();
        assert!(matches!(verdict, LockfileVerdict::ApprovalRequired { .. }));
        // Nothing recorded until approved.
        assert!(lockfile.get(&fqcn).is_none());
    }

    #[test]
    fn equal_hash_is_valid() {
        let (_tmp, lockfile) = make_lockfile(true);
        let fqcn = Fqcn::from_identifier("a.b.c.d");
        lockfile.validate(&fqcn, "sha256-abc", LockKind::LocalCode).unwrap();
        let verdict = lockfile
            .validate(&fqcn, "sha256-abc", LockKind::LocalCode)
            .unwrap();
        assert_eq!(verdict, LockfileVerdict::Valid);
    }

    #[test]
    fn drift_requires_approval_with_short_hashes() {
        let (_tmp, lockfile) = make_lockfile(true);
        let fqcn = Fqcn::from_identifier("pml.mcp.tavily.server");
        lockfile
            .validate(&fqcn, "sha256-oldHash", LockKind::Subprocess)
            .unwrap();

        // A revision-suffixed name shares the same canonical base.
        let revised = Fqcn::from_identifier("pml.mcp.tavily.server.f9a0");
        let verdict = lockfile
            .validate(&revised, "sha256-newHash", LockKind::Subprocess)
            .unwrap();
        match verdict {
            LockfileVerdict::ApprovalRequired {
                fqcn_base,
                old_short,
                new_short,
            } => {
                assert_eq!(fqcn_base, "pml.mcp.tavily.server");
                assert_eq!(old_short, "sha256-oldHash");
                assert_eq!(new_short, "sha256-newHash");
            }
            other => panic!("expected approval, got {other:?}"),
        }
    }

    #[test]
    fn approve_updates_stored_hash() {
        let (_tmp, lockfile) = make_lockfile(true);
        let fqcn = Fqcn::from_identifier("a.b.c.d");
        lockfile.validate(&fqcn, "sha256-old", LockKind::LocalCode).unwrap();
        lockfile.approve(&fqcn, "sha256-new", LockKind::LocalCode).unwrap();
        let verdict = lockfile
            .validate(&fqcn, "sha256-new", LockKind::LocalCode)
            .unwrap();
        assert_eq!(verdict, LockfileVerdict::Valid);
    }

    #[test]
    fn one_entry_per_canonical_base() {
        let (_tmp, lockfile) = make_lockfile(true);
        lockfile
            .validate(&Fqcn::from_identifier("a.b.c.d.rev1"), "sha256-x", LockKind::LocalCode)
            .unwrap();
        lockfile
            .approve(&Fqcn::from_identifier("a.b.c.d.rev2"), "sha256-y", LockKind::LocalCode)
            .unwrap();
        assert_eq!(lockfile.len(), 1);
    }

    #[test]
    fn sync_removes_unkept_entries() {
        let (_tmp, lockfile) = make_lockfile(true);
        lockfile
            .validate(&Fqcn::from_identifier("a.b.c.d"), "sha256-x", LockKind::LocalCode)
            .unwrap();
        lockfile
            .validate(&Fqcn::from_identifier("e.f.g.h"), "sha256-y", LockKind::LocalCode)
            .unwrap();

        let keep: HashSet<String> = ["a.b.c.d".to_string()].into();
        let removed = lockfile.sync(&keep).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(lockfile.len(), 1);
        assert!(lockfile.get(&Fqcn::from_identifier("a.b.c.d")).is_some());
    }

    #[test]
    fn prune_removes_stale_entries() {
        let (_tmp, lockfile) = make_lockfile(true);
        lockfile
            .validate(&Fqcn::from_identifier("a.b.c.d"), "sha256-x", LockKind::LocalCode)
            .unwrap();
        // Everything is fresh: nothing pruned.
        assert_eq!(lockfile.prune(Duration::from_secs(3600)).unwrap(), 0);
        // Zero max-age prunes everything older than "now".
        assert_eq!(lockfile.prune(Duration::from_secs(0)).unwrap(), 0);
        assert_eq!(lockfile.len(), 1);
    }

    #[test]
    fn corrupt_file_falls_back_to_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("caprun-lock.json");
        std::fs::write(&path, "{not json").unwrap();
        let lockfile = Lockfile::load(&path, true);
        assert!(lockfile.is_empty());
        // The corrupt file is left alone until the next legitimate write.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{not json");
    }

    #[test]
    fn stdio_alias_deserializes_as_subprocess() {
        let entry: LockfileEntry = serde_json::from_value(serde_json::json!({
            "integrity": "sha256-x",
            "type": "stdio",
            "approved": true,
            "createdAt": Utc::now(),
            "updatedAt": Utc::now(),
        }))
        .unwrap();
        assert_eq!(entry.kind, LockKind::Subprocess);
    }
}
