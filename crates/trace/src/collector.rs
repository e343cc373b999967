//! Per-execution trace collector.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use caprun_domain::error::{Error, ErrorKind, Result};

use crate::redact::{redact_str, redact_value};

/// One nested tool call, in call order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpCallRecord {
    /// `t1`, `t2`, … in call order.
    pub task_id: String,
    pub tool: String,
    pub args: Value,
    pub result: Value,
    pub success: bool,
    pub duration_ms: u64,
}

/// One branch decision taken by the capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchRecord {
    pub node_id: String,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// A finalized execution trace. Args, results, and the error message
/// have been through the credential sanitizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub capability: String,
    pub calls: Vec<McpCallRecord>,
    pub branches: Vec<BranchRecord>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finalized_at: DateTime<Utc>,
}

#[derive(Default)]
struct CollectorState {
    calls: Vec<McpCallRecord>,
    branches: Vec<BranchRecord>,
    finalized: bool,
}

/// Accumulates records for one top-level invocation. `finalize` seals
/// the collector; recording afterwards is refused loudly.
pub struct TraceCollector {
    started_at: DateTime<Utc>,
    state: Mutex<CollectorState>,
}

impl TraceCollector {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            state: Mutex::new(CollectorState::default()),
        }
    }

    /// Record a nested tool call.
    pub fn record_mcp_call(
        &self,
        tool: &str,
        args: Value,
        result: Value,
        duration_ms: u64,
        success: bool,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.finalized {
            return Err(finalized_error("record_mcp_call"));
        }
        let task_id = format!("t{}", state.calls.len() + 1);
        state.calls.push(McpCallRecord {
            task_id,
            tool: tool.to_string(),
            args,
            result,
            success,
            duration_ms,
        });
        Ok(())
    }

    /// Record a branch decision.
    pub fn record_branch(&self, node_id: &str, outcome: &str, condition: Option<String>) -> Result<()> {
        let mut state = self.state.lock();
        if state.finalized {
            return Err(finalized_error("record_branch"));
        }
        state.branches.push(BranchRecord {
            node_id: node_id.to_string(),
            outcome: outcome.to_string(),
            condition,
        });
        Ok(())
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Seal the collector and emit the sanitized trace.
    pub fn finalize(
        &self,
        capability: &str,
        success: bool,
        error: Option<String>,
        user_id: Option<String>,
    ) -> Result<Trace> {
        let mut state = self.state.lock();
        if state.finalized {
            return Err(finalized_error("finalize"));
        }
        state.finalized = true;

        let calls = state
            .calls
            .drain(..)
            .map(|record| McpCallRecord {
                args: redact_value(&record.args),
                result: redact_value(&record.result),
                ..record
            })
            .collect();

        Ok(Trace {
            capability: capability.to_string(),
            calls,
            branches: state.branches.drain(..).collect(),
            success,
            error: error.map(|message| redact_str(&message)),
            user_id,
            started_at: self.started_at,
            finalized_at: Utc::now(),
        })
    }
}

impl Default for TraceCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn finalized_error(operation: &str) -> Error {
    Error::new(
        ErrorKind::CodeError,
        format!("{operation} on a finalized trace collector"),
    )
    .with("collector", "finalized")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_ids_follow_call_order() {
        let collector = TraceCollector::new();
        collector
            .record_mcp_call("memory:store", json!({}), json!("ok"), 10, true)
            .unwrap();
        collector
            .record_mcp_call("memory:recall", json!({}), json!("ok"), 5, true)
            .unwrap();
        collector
            .record_mcp_call("search:web", json!({}), json!("ok"), 80, false)
            .unwrap();

        let trace = collector
            .finalize("casys.pml.cache.test", true, None, None)
            .unwrap();
        let ids: Vec<_> = trace.calls.iter().map(|c| c.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2", "t3"]);
        assert_eq!(trace.calls[2].tool, "search:web");
        assert!(!trace.calls[2].success);
    }

    #[test]
    fn records_after_finalize_fail_hard() {
        let collector = TraceCollector::new();
        collector.finalize("a.b.c.d", true, None, None).unwrap();

        let err = collector
            .record_mcp_call("x:y", json!({}), json!({}), 1, true)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::CodeError);
        assert_eq!(err.context.get("collector").unwrap(), "finalized");

        assert!(collector.record_branch("n1", "taken", None).is_err());
        assert!(collector.finalize("a.b.c.d", true, None, None).is_err());
    }

    #[test]
    fn finalize_redacts_args_results_and_error() {
        let collector = TraceCollector::new();
        collector
            .record_mcp_call(
                "search:web",
                json!({"query": "rust", "apiKey": "tvly-dev-secret123"}),
                json!({"note": "used sk-abcdef1234567890"}),
                42,
                true,
            )
            .unwrap();

        let trace = collector
            .finalize(
                "a.b.c.d",
                false,
                Some("auth failed with Bearer abc123def456xyz".into()),
                Some("user-1".into()),
            )
            .unwrap();

        assert_eq!(trace.calls[0].args["apiKey"], "[REDACTED]");
        assert!(!trace.calls[0].result["note"]
            .as_str()
            .unwrap()
            .contains("sk-abcdef1234567890"));
        assert!(!trace.error.as_ref().unwrap().contains("abc123def456xyz"));
        assert_eq!(trace.user_id.as_deref(), Some("user-1"));
    }

    #[test]
    fn branches_carry_conditions() {
        let collector = TraceCollector::new();
        collector
            .record_branch("n3", "taken", Some("count > 0".into()))
            .unwrap();
        collector.record_branch("n4", "skipped", None).unwrap();

        let trace = collector.finalize("a.b.c.d", true, None, None).unwrap();
        assert_eq!(trace.branches.len(), 2);
        assert_eq!(trace.branches[0].condition.as_deref(), Some("count > 0"));
    }
}
