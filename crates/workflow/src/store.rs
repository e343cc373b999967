//! Thread-safe store for pending (suspended) workflows.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use caprun_domain::envelope::ApprovalKind;

/// Default lifetime of a suspended execution.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// A suspended execution awaiting human consent.
#[derive(Debug, Clone, Serialize)]
pub struct PendingWorkflow {
    pub id: Uuid,
    /// The original tool identifier, as the caller spelled it.
    pub tool_id: String,
    /// The original arguments document, replayed on resume.
    pub args: Value,
    /// What kind of approval is being sought.
    pub kind: ApprovalKind,
    /// The object under approval: dependency record, missing variable
    /// names, or integrity diff.
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// TTL-bounded map of pending workflows.
///
/// Expired entries are invisible to `get` immediately and physically
/// removed lazily on the next `create`.
pub struct WorkflowStore {
    pending: RwLock<HashMap<Uuid, PendingWorkflow>>,
    ttl: Duration,
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record a suspension under a fresh workflow id.
    pub fn create(&self, args: Value, tool_id: &str, kind: ApprovalKind, payload: Value) -> Uuid {
        let id = Uuid::new_v4();
        self.set_with_id(id, args, tool_id, kind, payload);
        id
    }

    /// Record a suspension under an externally decided id.
    pub fn set_with_id(
        &self,
        id: Uuid,
        args: Value,
        tool_id: &str,
        kind: ApprovalKind,
        payload: Value,
    ) {
        let mut pending = self.pending.write();
        // Opportunistic purge keeps the map bounded without a timer task.
        let cutoff = Utc::now();
        pending.retain(|_, w| !expired_at(w, cutoff, self.ttl));

        tracing::debug!(workflow_id = %id, tool = %tool_id, kind = ?kind, "workflow suspended");
        pending.insert(
            id,
            PendingWorkflow {
                id,
                tool_id: tool_id.to_string(),
                args,
                kind,
                payload,
                created_at: Utc::now(),
            },
        );
    }

    /// Look up a pending workflow. Returns `None` once the TTL has
    /// elapsed, even if the record is still physically present.
    pub fn get(&self, id: &Uuid) -> Option<PendingWorkflow> {
        let pending = self.pending.read();
        let workflow = pending.get(id)?;
        if expired_at(workflow, Utc::now(), self.ttl) {
            return None;
        }
        Some(workflow.clone())
    }

    /// Remove a workflow after resumption (approved or aborted).
    pub fn delete(&self, id: &Uuid) -> bool {
        self.pending.write().remove(id).is_some()
    }

    /// Live (non-expired) entry count.
    pub fn size(&self) -> usize {
        let now = Utc::now();
        self.pending
            .read()
            .values()
            .filter(|w| !expired_at(w, now, self.ttl))
            .count()
    }

    pub fn clear(&self) {
        self.pending.write().clear();
    }
}

impl Default for WorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

fn expired_at(workflow: &PendingWorkflow, now: DateTime<Utc>, ttl: Duration) -> bool {
    let age = now.signed_duration_since(workflow.created_at);
    age.to_std().map_or(false, |age| age > ttl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TOOL: &str = "memory:store";

    #[test]
    fn create_and_get() {
        let store = WorkflowStore::new();
        let id = store.create(
            json!({"key": "k"}),
            TOOL,
            ApprovalKind::Dependency,
            json!({"name": "memory", "version": "1.0.0"}),
        );
        let workflow = store.get(&id).expect("workflow should be live");
        assert_eq!(workflow.tool_id, TOOL);
        assert_eq!(workflow.payload["name"], "memory");
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn get_unknown_is_none() {
        let store = WorkflowStore::new();
        assert!(store.get(&Uuid::new_v4()).is_none());
    }

    #[test]
    fn delete_after_resumption() {
        let store = WorkflowStore::new();
        let id = store.create(json!({}), TOOL, ApprovalKind::Integrity, json!({}));
        assert!(store.delete(&id));
        assert!(store.get(&id).is_none());
        assert!(!store.delete(&id));
    }

    #[test]
    fn expired_entry_is_invisible() {
        let store = WorkflowStore::with_ttl(Duration::from_millis(0));
        let id = store.create(json!({}), TOOL, ApprovalKind::ApiKeyRequired, json!({}));
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.get(&id).is_none());
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn create_purges_expired_entries() {
        let store = WorkflowStore::with_ttl(Duration::from_millis(0));
        store.create(json!({}), TOOL, ApprovalKind::Dependency, json!({}));
        std::thread::sleep(Duration::from_millis(5));
        // The next create physically removes the stale record.
        let live = store.create(json!({}), TOOL, ApprovalKind::Dependency, json!({}));
        let pending = store.pending.read();
        assert_eq!(pending.len(), 1);
        assert!(pending.contains_key(&live));
    }

    #[test]
    fn set_with_id_uses_external_id() {
        let store = WorkflowStore::new();
        let id = Uuid::new_v4();
        store.set_with_id(id, json!({}), TOOL, ApprovalKind::Dependency, json!({}));
        assert!(store.get(&id).is_some());
    }

    #[test]
    fn ids_are_unique() {
        let store = WorkflowStore::new();
        let a = store.create(json!({}), TOOL, ApprovalKind::Dependency, json!({}));
        let b = store.create(json!({}), TOOL, ApprovalKind::Dependency, json!({}));
        assert_ne!(a, b);
        assert_eq!(store.size(), 2);
    }

    #[test]
    fn clear_empties_store() {
        let store = WorkflowStore::new();
        store.create(json!({}), TOOL, ApprovalKind::Dependency, json!({}));
        store.clear();
        assert_eq!(store.size(), 0);
    }
}
