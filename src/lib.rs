//! Pantry - cache-aside and request-coalescing layer for REST API reads
//!
//! Pantry sits between application code and an HTTP API and answers
//! repeat reads from local storage while keeping entries quietly fresh.
//!
//! ## Components
//!
//! - **Store**: a persistent JSON store with read-time freshness and a
//!   bounded in-memory tier with least-read eviction
//! - **Coalescing**: at most one in-flight network request per key, with
//!   per-caller timeouts
//! - **Fetcher**: cache-aside orchestration with silent background
//!   revalidation of served hits
//! - **Client**: an explicit service object wrapping an HTTP endpoint,
//!   with enable/disable/restore controls and direct cache accessors
//! - **Telemetry**: bounded sample recording and cache-vs-network
//!   performance reporting
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use pantry::{CacheConfig, CachedClient, HttpReadEndpoint, MemoryBackend, ReadOptions};
//!
//! # async fn demo() -> Result<(), pantry::FetchError> {
//! let endpoint = Arc::new(HttpReadEndpoint::new(
//!     reqwest::Client::new(),
//!     "https://api.example.com",
//! ));
//! let client = CachedClient::new(endpoint, Arc::new(MemoryBackend::new()), CacheConfig::from_env());
//!
//! let outcome = client
//!     .cached_fetch("/api/shows", &ReadOptions::keyed("shows", Duration::from_secs(300)))
//!     .await?;
//! println!("from_cache: {}", outcome.from_cache);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod coalesce;
pub mod config;
pub mod fetcher;
pub mod keys;
pub mod store;
pub mod telemetry;
pub mod types;

pub use client::{CachedClient, HttpReadEndpoint};
pub use coalesce::RequestCoordinator;
pub use config::CacheConfig;
pub use fetcher::{CacheAsideFetcher, ReadEndpoint};
pub use keys::CacheKey;
pub use store::{
    BoundedMemoryCache, FileBackend, MemoryBackend, MemoryCacheStats, PersistentCacheStore,
    StorageBackend,
};
pub use telemetry::{Outcome, PerformanceReport, TelemetryRecorder, TelemetrySample};
pub use types::{CacheError, FetchError, FetchResult, ReadOptions, ReadOutcome};
