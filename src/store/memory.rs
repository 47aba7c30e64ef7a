//! Bounded in-memory cache with access-count eviction
//!
//! Capacity-bounded, with an independent TTL per entry and lazy expiry.
//! Eviction removes the entry with the lowest cumulative access count,
//! an LFU-by-count policy rather than recency-based LRU: an entry read
//! many times long ago outranks one read once just now.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

struct MemoryEntry {
    value: Value,
    inserted_at: Instant,
    expires_at: Instant,
    access_count: AtomicU32,
}

/// Statistics snapshot for the in-memory cache.
///
/// `hit_rate` is the mean access count across live entries. This conflates
/// repeat-reads with a true hit ratio and is documented as an approximation,
/// not a corrected metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryCacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hit_rate: f64,
}

/// Capacity-bounded in-process cache. Thread-safe, O(1) lookups; eviction
/// scans live entries for the lowest access count.
pub struct BoundedMemoryCache {
    entries: DashMap<String, MemoryEntry>,
    max_entries: usize,
    default_ttl: Duration,
}

impl BoundedMemoryCache {
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            default_ttl,
        }
    }

    /// Insert a value, evicting the least-read entry first when at capacity.
    /// The cache never exceeds `max_entries`.
    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);

        if !self.entries.contains_key(key) && self.entries.len() >= self.max_entries {
            self.evict_one();
        }

        let now = Instant::now();
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                inserted_at: now,
                expires_at: now + ttl,
                access_count: AtomicU32::new(0),
            },
        );
    }

    /// Remove the entry with the lowest access count; the first entry seen
    /// in iteration order wins ties.
    fn evict_one(&self) {
        let mut victim: Option<(String, u32)> = None;
        for entry in self.entries.iter() {
            let count = entry.access_count.load(Ordering::Relaxed);
            match &victim {
                Some((_, best)) if count >= *best => {}
                _ => victim = Some((entry.key().clone(), count)),
            }
        }

        if let Some((key, count)) = victim {
            self.entries.remove(&key);
            debug!(key = %key, access_count = count, "Evicted least-read entry");
        }
    }

    /// Get a value, counting the access. An expired entry is deleted on
    /// sight and reads as a miss (lazy expiry).
    pub fn get(&self, key: &str) -> Option<Value> {
        if let Some(entry) = self.entries.get(key) {
            if Instant::now() < entry.expires_at {
                entry.access_count.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            drop(entry);
            self.entries.remove(key);
            debug!(key = key, "Expired entry removed");
        }
        None
    }

    /// Like `get`, but additionally applies the reader's own freshness
    /// bound: the entry must be younger than `max_age` as well as within
    /// its stored TTL. The same entry can satisfy one reader and miss for
    /// a stricter one.
    pub fn get_fresh(&self, key: &str, max_age: Duration) -> Option<Value> {
        if let Some(entry) = self.entries.get(key) {
            if entry.inserted_at.elapsed() >= max_age {
                return None;
            }
        }
        self.get(key)
    }

    /// Same expiry check as `get`, without touching the access count
    pub fn has(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|e| Instant::now() < e.expires_at)
            .unwrap_or(false)
    }

    /// Remove a single entry
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every entry whose key contains `pattern`; returns how many
    pub fn remove_matching(&self, pattern: &str) -> usize {
        let matching: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().contains(pattern))
            .map(|e| e.key().clone())
            .collect();

        for key in &matching {
            self.entries.remove(key);
        }
        matching.len()
    }

    /// Drop all entries
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Statistics snapshot; see [`MemoryCacheStats`] for the hit_rate caveat
    pub fn stats(&self) -> MemoryCacheStats {
        let size = self.entries.len();
        let total_accesses: u64 = self
            .entries
            .iter()
            .map(|e| u64::from(e.access_count.load(Ordering::Relaxed)))
            .sum();

        MemoryCacheStats {
            size,
            max_size: self.max_entries,
            hit_rate: if size == 0 {
                0.0
            } else {
                total_accesses as f64 / size as f64
            },
        }
    }
}
