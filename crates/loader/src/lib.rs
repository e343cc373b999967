//! `caprun-loader` — the capability orchestrator.
//!
//! [`Runtime`] is the single owning composition root: it wires the
//! registry client, permission policy, routing table, dependency state,
//! installer, integrity lockfile, subprocess manager, workflow store,
//! sandbox, and trace pipeline, and exposes the runtime's one primary
//! operation — invoke a tool by identifier:
//!
//! ```rust,ignore
//! let runtime = Runtime::new(config)?;
//! match runtime.call("cache:test", json!({}), None).await? {
//!     CallOutcome::Completed(value) => println!("{value}"),
//!     CallOutcome::ApprovalRequired(envelope) => {
//!         // surface to the human, resume with a continuation token
//!     }
//! }
//! ```
//!
//! Approval envelopes are successful returns, never errors; a denied
//! policy terminates the invocation, an `ask` policy suspends it.

mod code;
mod loader;
mod remote;
mod runtime;

pub use caprun_domain::envelope::{ApprovalEnvelope, CallOutcome, ContinueWorkflow};
pub use loader::{Loaded, LoadOutcome};
pub use runtime::Runtime;
