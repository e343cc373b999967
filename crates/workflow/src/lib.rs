//! `caprun-workflow` — TTL-bounded store of suspended executions.
//!
//! When a load needs human consent, the loader records the suspended
//! state here under the workflow id carried by the approval envelope.
//! The caller's continuation token looks the record back up; past the
//! TTL the record is gone and a late continuation fails
//! `workflow-not-found`.

mod store;

pub use store::{PendingWorkflow, WorkflowStore, DEFAULT_TTL};
