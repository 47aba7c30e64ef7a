//! Cache storage: durable and in-memory tiers

pub mod backend;
pub mod memory;
pub mod persistent;

pub use backend::{FileBackend, MemoryBackend, StorageBackend};
pub use memory::{BoundedMemoryCache, MemoryCacheStats};
pub use persistent::PersistentCacheStore;
