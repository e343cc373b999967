//! `caprun-trace` — execution traces.
//!
//! One [`TraceCollector`] per top-level invocation accumulates the
//! nested tool calls and branch decisions the capability makes, then
//! `finalize` passes everything through the credential sanitizer and
//! seals the trace. A [`TraceSyncer`] batches finalized traces to a
//! remote endpoint with bounded retries; without an endpoint it is a
//! no-op.

mod collector;
mod redact;
mod syncer;

pub use collector::{BranchRecord, McpCallRecord, Trace, TraceCollector};
pub use redact::{redact_str, redact_value};
pub use syncer::TraceSyncer;
