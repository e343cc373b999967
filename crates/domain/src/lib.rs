//! `caprun-domain` — shared types for the capability execution runtime.
//!
//! This crate defines the vocabulary every other caprun crate speaks:
//! - Tool identifiers (`namespace:action`) and dotted capability names.
//! - Capability metadata as served by the remote registry.
//! - Approval envelopes and continuation tokens for the stateless
//!   human-in-the-loop protocol.
//! - The shared structured error type (kind + message + context map).
//! - Runtime configuration with validation.

pub mod capability;
pub mod config;
pub mod envelope;
pub mod error;
pub mod events;
pub mod identifier;

// Re-exports for convenience.
pub use capability::{CapabilityMetadata, RoutingPreference, SubprocessDep};
pub use envelope::{ApprovalEnvelope, ApprovalKind, CallOutcome, ContinueWorkflow};
pub use error::{Error, ErrorKind, Result};
pub use identifier::{Fqcn, ToolId};
