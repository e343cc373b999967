use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subprocess limits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Subprocess server lifecycle limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubprocessConfig {
    /// Per-request deadline (seconds). Requests unanswered past it
    /// reject with `subprocess-timeout`.
    #[serde(default = "d_request_timeout")]
    pub request_timeout_sec: u64,
    /// Idle window (seconds) since last activity before a running
    /// handle is shut down. Every successful call re-arms it.
    #[serde(default = "d_idle_timeout")]
    pub idle_timeout_sec: u64,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            request_timeout_sec: d_request_timeout(),
            idle_timeout_sec: d_idle_timeout(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sandbox limits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Sandbox execution limits. The two timeouts are independent: a single
/// slow RPC can fail while the enclosing execution is still within
/// budget, and vice versa.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Wall-clock budget for one `execute` (seconds).
    #[serde(default = "d_execution_timeout")]
    pub execution_timeout_sec: u64,
    /// Deadline for each `mcp.*` call issued by sandboxed code (seconds).
    #[serde(default = "d_rpc_timeout")]
    pub rpc_timeout_sec: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            execution_timeout_sec: d_execution_timeout(),
            rpc_timeout_sec: d_rpc_timeout(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_request_timeout() -> u64 {
    30
}
fn d_idle_timeout() -> u64 {
    300
}
fn d_execution_timeout() -> u64 {
    60
}
fn d_rpc_timeout() -> u64 {
    30
}
