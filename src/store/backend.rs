//! Raw storage backends for the durable cache
//!
//! A backend is a flat string-keyed map, the shape of browser local storage:
//! `raw_get`/`raw_set`/`raw_remove` plus key enumeration for pattern
//! invalidation. Backends are synchronous; the durable probe in the fetch
//! path must not suspend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use dashmap::DashMap;
use tracing::{debug, warn};

/// Flat key/value storage consumed by [`PersistentCacheStore`](super::PersistentCacheStore).
///
/// Writes may fail (quota, io); callers are expected to swallow those
/// failures. Reads and removes are infallible by contract: a backend that
/// cannot read a key reports it as absent.
pub trait StorageBackend: Send + Sync {
    /// Read the raw serialized entry for a key, `None` if absent
    fn raw_get(&self, key: &str) -> Option<String>;

    /// Write the raw serialized entry for a key, overwriting unconditionally
    fn raw_set(&self, key: &str, value: &str) -> std::io::Result<()>;

    /// Remove a key; removing an absent key is a no-op
    fn raw_remove(&self, key: &str);

    /// Enumerate all stored keys
    fn keys(&self) -> Vec<String>;
}

/// In-process backend. Not durable; used in tests and as a default when no
/// storage path is configured.
#[derive(Default)]
pub struct MemoryBackend {
    entries: DashMap<String, String>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn raw_get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.clone())
    }

    fn raw_set(&self, key: &str, value: &str) -> std::io::Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn raw_remove(&self, key: &str) {
        self.entries.remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}

/// File-backed backend: one JSON map file, loaded on open and flushed on
/// every write. Shared by other processes of the same origin with no
/// cross-process locking; conflicting writes resolve last-write-wins.
pub struct FileBackend {
    path: PathBuf,
    entries: RwLock<HashMap<String, String>>,
}

impl FileBackend {
    /// Open (or create) the backing file at `path`.
    ///
    /// An unreadable or corrupt file is treated as empty rather than an
    /// error; the cache must never be the cause of a startup failure.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, String>>(&raw) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Discarding unreadable cache file");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        debug!(path = %path.display(), entries = entries.len(), "File backend opened");

        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    /// Serialize the whole map and replace the backing file.
    /// Writes to a sibling temp file first so a crash mid-write cannot
    /// truncate the store.
    fn flush(&self, entries: &HashMap<String, String>) -> std::io::Result<()> {
        let raw = serde_json::to_string(entries)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)
    }
}

impl StorageBackend for FileBackend {
    fn raw_get(&self, key: &str) -> Option<String> {
        self.entries
            .read()
            .ok()
            .and_then(|map| map.get(key).cloned())
    }

    fn raw_set(&self, key: &str, value: &str) -> std::io::Result<()> {
        let mut map = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.insert(key.to_string(), value.to_string());
        self.flush(&map)
    }

    fn raw_remove(&self, key: &str) {
        let mut map = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if map.remove(key).is_some() {
            if let Err(e) = self.flush(&map) {
                warn!(key = key, error = %e, "Failed to flush removal");
            }
        }
    }

    fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }
}
