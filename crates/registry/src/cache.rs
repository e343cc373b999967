//! In-memory LRU cache for capability metadata.

use std::num::NonZeroUsize;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;

use caprun_domain::capability::CapabilityMetadata;

#[derive(Debug, Clone)]
struct CacheEntry {
    metadata: CapabilityMetadata,
    fetched_at: DateTime<Utc>,
}

/// LRU map keyed by canonical dotted FQCN. Reads refresh recency; at
/// capacity, exactly the least-recently-accessed entry is evicted per
/// insertion.
pub struct MetadataCache {
    inner: Mutex<LruCache<String, CacheEntry>>,
}

impl MetadataCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is non-zero");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Look up and refresh recency.
    pub fn get(&self, fqcn: &str) -> Option<(CapabilityMetadata, DateTime<Utc>)> {
        let mut inner = self.inner.lock();
        inner
            .get(fqcn)
            .map(|entry| (entry.metadata.clone(), entry.fetched_at))
    }

    pub fn insert(&self, fqcn: String, metadata: CapabilityMetadata) -> DateTime<Utc> {
        let fetched_at = Utc::now();
        self.inner.lock().put(
            fqcn,
            CacheEntry {
                metadata,
                fetched_at,
            },
        );
        fetched_at
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}
