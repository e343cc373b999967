//! `caprun-mcp-client` — subprocess MCP servers over stdio.
//!
//! This crate provides:
//! - JSON-RPC 2.0 protocol types for the MCP wire format.
//! - An NDJSON stdio transport that spawns a child process, multiplexes
//!   concurrent requests by id, and enforces per-request deadlines.
//! - A [`SubprocessManager`] that lazily spawns one server per
//!   dependency name, performs the MCP handshake, idle-expires unused
//!   handles, and shuts everything down in order.
//!
//! # Usage
//!
//! ```rust,ignore
//! use caprun_mcp_client::SubprocessManager;
//!
//! let manager = SubprocessManager::new(config);
//! manager.get_or_spawn(&dep).await?;
//! let result = manager
//!     .call("memory", "tools/call", json!({"name": "store", "arguments": {}}))
//!     .await?;
//! ```

pub mod manager;
pub mod protocol;
pub mod transport;

// Re-exports for convenience.
pub use manager::SubprocessManager;
pub use protocol::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, McpToolDef};
pub use transport::{McpTransport, StdioTransport};
