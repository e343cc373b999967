//! Approval envelopes and continuation tokens.
//!
//! When a load needs human consent the runtime does not fail — it
//! returns an [`ApprovalEnvelope`] (a structurally distinct successful
//! return) carrying a workflow id. The caller resumes by re-invoking the
//! same tool with a [`ContinueWorkflow`] token attached.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The approval the envelope is asking for.
///
/// The runtime only ever emits `dependency` (install consent, with
/// `needs_installation` in context), `api_key_required`, and
/// `integrity`. `tool_permission` is still accepted on input for
/// compatibility with envelopes produced by older runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    Dependency,
    ToolPermission,
    ApiKeyRequired,
    Integrity,
}

/// Structured successful return indicating that execution is suspended
/// until a human consents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalEnvelope {
    /// Always `"approval_required"`.
    pub status: String,
    pub approval_type: ApprovalKind,
    pub workflow_id: Uuid,
    pub description: String,
    /// Type-specific payload: the dependency record, the missing
    /// variable names, or the integrity diff.
    pub context: Value,
    /// Always `["continue", "abort"]`.
    pub options: Vec<String>,
}

impl ApprovalEnvelope {
    pub fn new(
        approval_type: ApprovalKind,
        workflow_id: Uuid,
        description: impl Into<String>,
        context: Value,
    ) -> Self {
        Self {
            status: "approval_required".into(),
            approval_type,
            workflow_id,
            description: description.into(),
            context,
            options: vec!["continue".into(), "abort".into()],
        }
    }
}

/// Continuation token the caller attaches to the next invocation of the
/// same tool-id and arguments to resume a suspended workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinueWorkflow {
    pub workflow_id: Uuid,
    pub approved: bool,
    /// Remember this decision for future occurrences: approving a
    /// dependency with `always: true` grants its namespace in the
    /// allow policy, so later versions install without a prompt.
    /// (Approved integrity changes are remembered unconditionally —
    /// the lockfile records the new hash.)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub always: Option<bool>,
}

/// Result of a capability call: either a value, or a suspension.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallOutcome {
    ApprovalRequired(ApprovalEnvelope),
    Completed(Value),
}

impl CallOutcome {
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::ApprovalRequired(_))
    }

    /// The completed value, or `None` when suspended.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Completed(v) => Some(v),
            Self::ApprovalRequired(_) => None,
        }
    }
}
