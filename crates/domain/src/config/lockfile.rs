use serde::{Deserialize, Serialize};

/// Integrity lockfile behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockfileConfig {
    /// Auto-trust the first hash seen for a capability. Drift from a
    /// recorded hash always requires approval regardless of this flag.
    #[serde(default = "d_true")]
    pub auto_approve_new: bool,
}

impl Default for LockfileConfig {
    fn default() -> Self {
        Self {
            auto_approve_new: d_true(),
        }
    }
}

fn d_true() -> bool {
    true
}
