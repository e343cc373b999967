//! `caprun-policy` — classification of tool identifiers.
//!
//! Three small, pure decision cores used by the capability loader:
//! - [`routing::RoutingTable`] — local vs remote dispatch per namespace.
//! - [`rules::PermissionPolicy`] — allowed / denied / ask per identifier,
//!   with the derived capability-level decision.
//! - [`env`] — required-credential validation with placeholder detection.

pub mod env;
pub mod routing;
pub mod rules;

pub use env::{check_env_vars, EnvReport};
pub use routing::RoutingTable;
pub use rules::{CapabilityDecision, PermissionDecision, PermissionPolicy};
