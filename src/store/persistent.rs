//! Durable cache store with caller-specified freshness windows
//!
//! Entries are persisted as `{"value": <json>, "stored_at": <epoch ms>}`.
//! Freshness is not a property of the entry: it is evaluated at read time
//! against the ttl the *reader* supplies, so the same physical entry can be
//! fresh for one caller and stale for another. That asymmetry is intentional.
//!
//! Every failure in this layer degrades silently: a corrupt entry reads as a
//! miss, a rejected write is logged and skipped. The cache must never be the
//! cause of an application-visible failure.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::backend::StorageBackend;
use crate::types::CacheError;

/// Wall-clock milliseconds since the epoch
pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// The persisted entry shape. `stored_at` is wall-clock epoch millis so the
/// store survives process restarts.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    value: Value,
    stored_at: i64,
}

/// Durable key→entry cache over a raw [`StorageBackend`].
///
/// Keys are scoped under a namespace so several clients can share one
/// backing store without colliding.
pub struct PersistentCacheStore {
    backend: Arc<dyn StorageBackend>,
    namespace: String,
}

impl PersistentCacheStore {
    pub fn new(backend: Arc<dyn StorageBackend>, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
        }
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    /// Read a value if present and fresh for the supplied ttl.
    ///
    /// Absent, corrupt, or aged-out entries all read as `None`; corruption
    /// is logged at debug and never surfaced.
    pub fn get(&self, key: &str, ttl: Duration) -> Option<Value> {
        let raw = self.backend.raw_get(&self.storage_key(key))?;

        let entry: PersistedEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                let err = CacheError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                };
                debug!(key = key, error = %err, "Treating corrupt entry as a miss");
                return None;
            }
        };

        let age_ms = now_ms().saturating_sub(entry.stored_at);
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        // Fresh strictly below the ttl; an entry exactly at the boundary is stale
        if age_ms < ttl_ms {
            Some(entry.value)
        } else {
            debug!(key = key, age_ms = age_ms, "Entry too stale for this reader");
            None
        }
    }

    /// Overwrite the entry for a key unconditionally, stamped with now.
    ///
    /// A failed backend write (the quota case) is logged and skipped; it
    /// never propagates to the caller.
    pub fn set(&self, key: &str, value: Value) {
        let entry = PersistedEntry {
            value,
            stored_at: now_ms(),
        };

        let raw = match serde_json::to_string(&entry) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = key, error = %e, "Unserializable value, skipping cache write");
                return;
            }
        };

        if let Err(e) = self.backend.raw_set(&self.storage_key(key), &raw) {
            let err = CacheError::WriteFailed {
                key: key.to_string(),
                reason: e.to_string(),
            };
            warn!(key = key, error = %err, "Skipping cache write");
        }
    }

    /// Remove a single entry
    pub fn remove(&self, key: &str) {
        self.backend.raw_remove(&self.storage_key(key));
    }

    /// Remove every entry in this namespace whose key contains `pattern`.
    /// Returns the number of entries removed; non-matching keys (and other
    /// namespaces) are untouched.
    pub fn clear_pattern(&self, pattern: &str) -> usize {
        let ns_prefix = format!("{}:", self.namespace);
        let matching: Vec<String> = self
            .backend
            .keys()
            .into_iter()
            .filter(|k| {
                k.strip_prefix(&ns_prefix)
                    .is_some_and(|rest| rest.contains(pattern))
            })
            .collect();

        for key in &matching {
            self.backend.raw_remove(key);
        }

        if !matching.is_empty() {
            debug!(pattern = pattern, removed = matching.len(), "Cleared cache entries");
        }
        matching.len()
    }
}
