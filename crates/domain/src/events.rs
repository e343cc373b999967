//! Structured runtime events emitted across all caprun crates.
//!
//! These are operational milestones surfaced through `tracing`,
//! independent of the per-execution trace collector: one line of
//! structured JSON per event, greppable and machine-parseable.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum RuntimeEvent {
    MetadataFetched {
        fqcn: String,
        from_cache: bool,
    },
    CapabilityLoaded {
        fqcn: String,
        tool_count: usize,
        dep_count: usize,
    },
    DependencyInstalled {
        name: String,
        version: String,
        already_installed: bool,
    },
    SubprocessSpawned {
        name: String,
        tool_count: usize,
    },
    SubprocessIdleExpired {
        name: String,
    },
    WorkflowSuspended {
        workflow_id: String,
        kind: String,
        tool: String,
    },
    WorkflowResumed {
        workflow_id: String,
        approved: bool,
    },
    ExecutionFinished {
        fqcn: String,
        action: String,
        success: bool,
        duration_ms: u64,
    },
}

impl RuntimeEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(runtime_event = %json, "caprun_event");
    }
}
