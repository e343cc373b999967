//! Registry HTTP client.
//!
//! `fetch` canonicalizes the identifier, consults the LRU cache, and on
//! a miss issues `GET <cloud_url>/mcp/<fqcn>` with `Accept:
//! application/json` under a bounded timeout. 404 and schema failures
//! surface as distinguishable error kinds; transport failures are never
//! retried here (retry is the caller's prerogative).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use caprun_domain::capability::CapabilityMetadata;
use caprun_domain::config::RegistryConfig;
use caprun_domain::error::{Error, ErrorKind, Result};
use caprun_domain::identifier::Fqcn;

use crate::cache::MetadataCache;

/// Result of a metadata fetch.
#[derive(Debug, Clone)]
pub struct FetchedMetadata {
    pub metadata: CapabilityMetadata,
    pub from_cache: bool,
    pub fetched_at: DateTime<Utc>,
}

/// Capability metadata client with an LRU cache.
pub struct RegistryClient {
    base_url: String,
    http: reqwest::Client,
    cache: MetadataCache,
    /// Serializes cache misses so concurrent fetches of one identifier
    /// produce a single cache entry (the second observes the first's).
    fetch_lock: Mutex<()>,
    fetch_count: std::sync::atomic::AtomicU64,
}

impl RegistryClient {
    pub fn new(config: &RegistryConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_sec))
            .build()
            .unwrap_or_default();
        Self {
            base_url: config.cloud_url.trim_end_matches('/').to_string(),
            http,
            cache: MetadataCache::new(config.cache_capacity),
            fetch_lock: Mutex::new(()),
            fetch_count: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Fetch metadata for an identifier in any accepted spelling.
    pub async fn fetch(&self, identifier: &str) -> Result<FetchedMetadata> {
        let fqcn = Fqcn::from_identifier(identifier);

        if let Some((metadata, fetched_at)) = self.cache.get(fqcn.as_str()) {
            return Ok(FetchedMetadata {
                metadata,
                from_cache: true,
                fetched_at,
            });
        }

        let _guard = self.fetch_lock.lock().await;
        // A racing fetch may have filled the entry while we waited.
        if let Some((metadata, fetched_at)) = self.cache.get(fqcn.as_str()) {
            return Ok(FetchedMetadata {
                metadata,
                from_cache: true,
                fetched_at,
            });
        }

        let metadata = self.fetch_uncached(&fqcn).await?;
        let fetched_at = self.cache.insert(fqcn.as_str().to_string(), metadata.clone());
        Ok(FetchedMetadata {
            metadata,
            from_cache: false,
            fetched_at,
        })
    }

    /// Network fetches performed so far (cache hits excluded).
    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    async fn fetch_uncached(&self, fqcn: &Fqcn) -> Result<CapabilityMetadata> {
        let url = format!("{}/mcp/{}", self.base_url, fqcn);
        self.fetch_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::debug!(fqcn = %fqcn, url = %url, "fetching capability metadata");

        let response = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|error| {
                let kind = ErrorKind::MetadataFetchFailed;
                let message = if error.is_timeout() {
                    format!("registry request timed out: {fqcn}")
                } else {
                    format!("registry request failed: {error}")
                };
                Error::new(kind, message).with("fqcn", fqcn.as_str())
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::new(
                ErrorKind::MetadataFetchFailed,
                format!("capability not found in registry: {fqcn}"),
            )
            .with("fqcn", fqcn.as_str())
            .with("reason", "not_found"));
        }
        if !status.is_success() {
            return Err(Error::new(
                ErrorKind::MetadataFetchFailed,
                format!("registry answered HTTP {status} for {fqcn}"),
            )
            .with("fqcn", fqcn.as_str())
            .with("status", status.as_u16()));
        }

        let body: Value = response.json().await.map_err(|error| {
            Error::new(
                ErrorKind::MetadataParseError,
                format!("registry body is not JSON: {error}"),
            )
            .with("fqcn", fqcn.as_str())
        })?;

        serde_json::from_value::<CapabilityMetadata>(body.clone()).map_err(|error| {
            Error::new(
                ErrorKind::MetadataParseError,
                format!("capability metadata failed validation: {error}"),
            )
            .with("fqcn", fqcn.as_str())
            .with("fragment", body)
        })
    }
}
