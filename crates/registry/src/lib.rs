//! `caprun-registry` — capability metadata retrieval.
//!
//! A thin HTTP client over `GET <cloud_url>/mcp/<fqcn>` with a bounded
//! timeout, strict schema validation, and an in-memory LRU cache so
//! repeated loads of one capability cost one fetch.

mod cache;
mod client;

pub use cache::MetadataCache;
pub use client::{FetchedMetadata, RegistryClient};
