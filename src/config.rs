//! Configuration for the caching layer
//!
//! Plain struct with defaults and environment variable overrides.

use std::time::Duration;

/// Configuration for the caching runtime
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Default freshness window for durable cache reads (default: 5 minutes)
    pub default_ttl: Duration,
    /// Maximum entries in the in-memory cache (default: 100)
    pub memory_max_entries: usize,
    /// Independent TTL for in-memory entries (default: 60 seconds)
    pub memory_ttl: Duration,
    /// Ring buffer capacity for telemetry samples (default: 500)
    pub telemetry_capacity: usize,
    /// Default per-caller timeout for network reads (default: 30 seconds)
    pub request_timeout: Duration,
    /// Key namespace in the durable store, scoping this client's entries
    pub namespace: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            memory_max_entries: 100,
            memory_ttl: Duration::from_secs(60),
            telemetry_capacity: 500,
            request_timeout: Duration::from_secs(30),
            namespace: "pantry".to_string(),
        }
    }
}

impl CacheConfig {
    /// Create config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("PANTRY_DEFAULT_TTL_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.default_ttl = Duration::from_millis(ms);
            }
        }

        if let Ok(val) = std::env::var("PANTRY_MEMORY_MAX_ENTRIES") {
            if let Ok(max) = val.parse::<usize>() {
                config.memory_max_entries = max;
            }
        }

        if let Ok(val) = std::env::var("PANTRY_MEMORY_TTL_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.memory_ttl = Duration::from_millis(ms);
            }
        }

        if let Ok(val) = std::env::var("PANTRY_TELEMETRY_CAPACITY") {
            if let Ok(capacity) = val.parse::<usize>() {
                config.telemetry_capacity = capacity;
            }
        }

        if let Ok(val) = std::env::var("PANTRY_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.request_timeout = Duration::from_millis(ms);
            }
        }

        if let Ok(val) = std::env::var("PANTRY_NAMESPACE") {
            if !val.is_empty() {
                config.namespace = val;
            }
        }

        config
    }

    /// Set the default freshness window
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the in-memory cache capacity
    pub fn with_memory_max_entries(mut self, max: usize) -> Self {
        self.memory_max_entries = max;
        self
    }

    /// Set the in-memory entry TTL
    pub fn with_memory_ttl(mut self, ttl: Duration) -> Self {
        self.memory_ttl = ttl;
        self
    }

    /// Set the per-caller request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the durable store namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
}
