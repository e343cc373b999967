use serde::{Deserialize, Serialize};

/// Trace syncer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Ingest endpoint for finalized traces. Empty disables shipping
    /// (the syncer becomes a no-op).
    #[serde(default)]
    pub endpoint: String,
    /// Traces per upload batch.
    #[serde(default = "d_batch_size")]
    pub batch_size: usize,
    /// Upload retry attempts before a batch is dropped.
    #[serde(default = "d_max_retries")]
    pub max_retries: u32,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            batch_size: d_batch_size(),
            max_retries: d_max_retries(),
        }
    }
}

fn d_batch_size() -> usize {
    20
}
fn d_max_retries() -> u32 {
    3
}
