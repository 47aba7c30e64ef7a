//! Cache key definitions
//!
//! Stable keys for outbound read calls, derived from the endpoint identity
//! and the call options.

use std::fmt;

use crate::types::ReadOptions;

/// Cache key for an outbound read call
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// HTTP method (uppercased)
    pub method: String,
    /// Request URL or path
    pub url: String,
    /// Hash of the call options (for cache key uniqueness)
    pub args_hash: String,
}

impl CacheKey {
    /// Create a key from a URL and its call options.
    ///
    /// Headers and query parameters are folded into a short hash so that
    /// distinct calls to the same URL get distinct keys.
    pub fn new(url: &str, options: &ReadOptions) -> Self {
        let mut args = String::new();
        for (name, value) in &options.headers {
            args.push_str(name);
            args.push('=');
            args.push_str(value);
            args.push('&');
        }
        for (name, value) in &options.query {
            args.push('?');
            args.push_str(name);
            args.push('=');
            args.push_str(value);
        }

        let args_hash = if args.is_empty() {
            "empty".to_string()
        } else {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(args.as_bytes());
            let hash = hasher.finalize();
            hex::encode(&hash[..8]) // First 8 bytes = 16 hex chars
        };

        Self {
            method: options.method.to_ascii_uppercase(),
            url: url.to_string(),
            args_hash,
        }
    }

    /// Create from components with a pre-computed args hash
    pub fn with_args_hash(method: &str, url: &str, args_hash: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            url: url.to_string(),
            args_hash: args_hash.to_string(),
        }
    }

    /// Convert to storage key string
    /// Format: method:url:args_hash
    pub fn to_storage_key(&self) -> String {
        format!("{}:{}:{}", self.method, self.url, self.args_hash)
    }

}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}({})", self.method, self.url, self.args_hash)
    }
}
