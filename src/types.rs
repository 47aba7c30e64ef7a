//! Shared types for the caching layer
//!
//! The read contract (`ReadOutcome`) is deliberately identical for cache-served
//! and network-served results: callers see the same success flag, status and
//! body either way, and can only distinguish provenance via `from_cache`.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Result of an outbound read, coalesced or not.
pub type FetchResult = Result<ReadOutcome, FetchError>;

/// Cache-layer failures. These never reach application callers: corrupt
/// entries are recovered as misses and failed writes are skipped.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Entry could not be deserialized (treated as a miss)
    #[error("corrupt cache entry for '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    /// Backend rejected the write (quota, io); the write is skipped
    #[error("cache write failed for '{key}': {reason}")]
    WriteFailed { key: String, reason: String },
}

/// Read-endpoint failures. These are the only errors application callers
/// ever observe; the cache layer performs no retries.
///
/// `Clone` so that a single coalesced rejection can be delivered identically
/// to every waiter of the shared operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Transport-level failure (connect, DNS, broken body stream)
    #[error("network error: {0}")]
    Network(String),

    /// The caller's timeout elapsed before the shared operation settled
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

/// Options for a single outbound read.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// HTTP method; only GET is eligible for the cache path
    pub method: String,
    /// Request headers as (name, value) pairs
    pub headers: Vec<(String, String)>,
    /// Query parameters as (name, value) pairs
    pub query: Vec<(String, String)>,
    /// Explicit cache key override; derived from (method, url, options) if unset
    pub cache_key: Option<String>,
    /// Freshness window for this read; config default if unset
    pub ttl: Option<Duration>,
    /// Per-caller timeout; config default if unset
    pub timeout: Option<Duration>,
    /// Opt this specific call out of caching entirely
    pub bypass_cache: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            headers: Vec::new(),
            query: Vec::new(),
            cache_key: None,
            ttl: None,
            timeout: None,
            bypass_cache: false,
        }
    }
}

impl ReadOptions {
    /// GET options with an explicit cache key and ttl
    pub fn keyed(cache_key: &str, ttl: Duration) -> Self {
        Self {
            cache_key: Some(cache_key.to_string()),
            ttl: Some(ttl),
            ..Self::default()
        }
    }
}

/// Outcome of a read: the uniform contract for cache hits and live responses.
///
/// `body` is `None` when the endpoint returned an empty or unparseable
/// payload; such outcomes are returned to the caller but never written to
/// cache as a false hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadOutcome {
    /// Whether the read succeeded (2xx for live responses, always true for hits)
    pub ok: bool,
    /// HTTP status (200 for cache-served results)
    pub status: u16,
    /// Parsed response body, if any
    pub body: Option<Value>,
    /// True when this outcome was served from cache, not the network
    pub from_cache: bool,
}

impl ReadOutcome {
    /// Build an outcome from a live endpoint response
    pub fn network(status: u16, body: Option<Value>) -> Self {
        Self {
            ok: (200..300).contains(&status),
            status,
            body,
            from_cache: false,
        }
    }

    /// Build a cache-served outcome carrying the same contract as a live one
    pub fn cached(value: Value) -> Self {
        Self {
            ok: true,
            status: 200,
            body: Some(value),
            from_cache: true,
        }
    }

    /// Whether this outcome carries a cacheable body
    pub fn has_body(&self) -> bool {
        self.body.as_ref().is_some_and(|v| !v.is_null())
    }
}
