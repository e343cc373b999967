//! Host-side surface of the sandbox RPC bridge.

use async_trait::async_trait;
use serde_json::Value;

use caprun_domain::error::Result;

/// Receives what sandboxed code reports out: tool calls made through
/// the `mcp` proxy, and branch decisions reported through
/// `caprun.branch`. Implemented by the capability loader; errors
/// returned from `call_tool` propagate as thrown exceptions inside the
/// sandbox.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn call_tool(&self, identifier: &str, args: Value, parent_trace_id: &str) -> Result<Value>;

    /// Observe a branch decision. Fire-and-forget; the default ignores
    /// it for dispatchers with no trace to feed.
    fn record_branch(&self, node_id: &str, outcome: &str, condition: Option<String>) {
        let _ = (node_id, outcome, condition);
    }
}

/// One message from the worker thread to the host.
pub(crate) enum WorkerMessage {
    /// An `mcp.<ns>.<action>` call awaiting a reply.
    ToolCall(RpcRequest),
    /// A `caprun.branch(nodeId, outcome, condition?)` report.
    Branch {
        node_id: String,
        outcome: String,
        condition: Option<String>,
    },
}

/// An in-flight tool call from the worker thread.
pub(crate) struct RpcRequest {
    /// Fresh correlation id per outbound call.
    pub correlation_id: u64,
    pub identifier: String,
    pub args: Value,
    /// The worker blocks on this channel until the host replies or the
    /// RPC deadline passes.
    pub reply: std::sync::mpsc::Sender<Result<Value>>,
}

/// A UI resource surfaced by a tool-call response shaped
/// `{_meta: {ui: {resourceUri, context?}}}`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UiResource {
    /// Tool identifier the resource came from.
    pub source: String,
    pub resource_uri: String,
    /// Monotonic position among the execution's collected resources.
    pub slot: u64,
    /// The response's `context`, augmented with `_args` — the original
    /// call arguments.
    pub context: Value,
}

/// Result of a completed sandbox execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    pub value: Value,
    pub duration_ms: u64,
    /// UI resources collected during the run, in slot order. Empty for
    /// executions that surfaced none.
    pub ui_resources: Vec<UiResource>,
}
