//! `caprun-sandbox` — isolated execution of fetched capability code.
//!
//! Capability code is JavaScript. Each execution runs it in a fresh Boa
//! context on a dedicated worker thread; a bare Boa context has no
//! filesystem, network, subprocess, or environment surface, so the only
//! ways out are the injected `mcp` proxy and the `caprun.branch`
//! reporting hook. Every `mcp.<ns>.<action>(args)` call crosses to the
//! host side as an RPC message with a fresh correlation id and blocks
//! the worker until the host answers or the RPC deadline passes; branch
//! reports cross the same channel fire-and-forget. The host races the
//! whole execution against an independent wall-clock budget.

mod bridge;
mod executor;
mod worker;

pub use bridge::{ExecutionOutput, ToolDispatcher, UiResource};
pub use executor::SandboxExecutor;
