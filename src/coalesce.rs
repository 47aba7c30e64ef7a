//! Request coalescing - per-key single flight
//!
//! When multiple callers request the same key concurrently, only ONE
//! underlying operation runs; every caller awaits the same broadcast and
//! receives the identical settlement. This prevents thundering herd on
//! popular endpoints and is the sole duplicate-suppression mechanism in
//! the caching layer.
//!
//! ## Settlement
//!
//! The in-flight registration is removed in a guaranteed cleanup step the
//! instant the operation settles, success or failure, before any waiter
//! observes the result. A later issue for the same key always starts a
//! fresh invocation.
//!
//! ## Per-caller timeouts
//!
//! Each caller may carry an independent timeout wrapping the shared
//! operation. A timeout fires for that caller alone; the underlying
//! operation is cancelled only when the last interested waiter has
//! abandoned it (reference-counted cancellation).

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::types::{FetchError, FetchResult};

/// State for one in-flight coalesced operation
struct InFlight {
    /// Broadcast channel delivering the single settlement to all waiters
    sender: broadcast::Sender<FetchResult>,
    /// How many callers are still awaiting this operation
    waiters: Arc<AtomicUsize>,
    /// Handle to cancel the underlying task once no waiter remains
    abort: AbortHandle,
    /// Distinguishes this registration from a later one under the same key
    generation: u64,
}

/// Removes an in-flight registration exactly once, even if the underlying
/// task panics or is aborted mid-operation.
struct Deregister {
    map: Arc<Mutex<HashMap<String, InFlight>>>,
    key: String,
    generation: u64,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        let mut map = self
            .map
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Only remove our own registration; a newer one may exist already
        if map.get(&self.key).is_some_and(|e| e.generation == self.generation) {
            map.remove(&self.key);
        }
    }
}

/// Deduplicates concurrent calls for the same key into one underlying
/// operation. For any key, at most one factory invocation is outstanding
/// at any instant.
pub struct RequestCoordinator {
    in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
    generation: AtomicU64,
}

impl RequestCoordinator {
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Issue an operation for a key, coalescing onto an in-flight one when
    /// present. `factory` is invoked only when no operation is registered
    /// for the key; all callers receive the identical resolution or the
    /// identical rejection. No retries happen at this layer.
    ///
    /// `timeout`, when set, bounds this caller's wait without cancelling
    /// the shared operation for other waiters.
    pub async fn issue<F, Fut>(&self, key: &str, timeout: Option<Duration>, factory: F) -> FetchResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        let (mut rx, waiters, abort, generation) = {
            let mut map = self.lock();
            if let Some(entry) = map.get(key) {
                entry.waiters.fetch_add(1, Ordering::SeqCst);
                debug!(key = key, "Coalescing onto in-flight request");
                (
                    entry.sender.subscribe(),
                    Arc::clone(&entry.waiters),
                    entry.abort.clone(),
                    entry.generation,
                )
            } else {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = broadcast::channel(1);
                let waiters = Arc::new(AtomicUsize::new(1));
                let guard = Deregister {
                    map: Arc::clone(&self.in_flight),
                    key: key.to_string(),
                    generation,
                };

                let fut = factory();
                let tx_task = tx.clone();
                let key_owned = key.to_string();
                let started = Instant::now();
                let handle = tokio::spawn(async move {
                    let result = fut.await;
                    // Deregister before any waiter observes settlement, so a
                    // follow-up issue is guaranteed a fresh invocation
                    drop(guard);
                    debug!(
                        key = %key_owned,
                        duration_ms = started.elapsed().as_millis() as u64,
                        ok = result.is_ok(),
                        "Coalesced request settled"
                    );
                    let _ = tx_task.send(result);
                });

                map.insert(
                    key.to_string(),
                    InFlight {
                        sender: tx,
                        waiters: Arc::clone(&waiters),
                        abort: handle.abort_handle(),
                        generation,
                    },
                );
                (rx, waiters, handle.abort_handle(), generation)
            }
        };

        let result = match timeout {
            Some(dur) => match tokio::time::timeout(dur, rx.recv()).await {
                Ok(received) => Self::settle(received),
                Err(_) => {
                    // This caller abandons; cancel the shared operation only
                    // if it was the last one interested
                    if waiters.fetch_sub(1, Ordering::SeqCst) == 1 {
                        abort.abort();
                        self.deregister(key, generation);
                        debug!(key = key, "Last waiter timed out, aborting shared request");
                    }
                    return Err(FetchError::Timeout(dur));
                }
            },
            None => Self::settle(rx.recv().await),
        };

        waiters.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn settle(received: Result<FetchResult, broadcast::error::RecvError>) -> FetchResult {
        match received {
            Ok(result) => result,
            // Sender dropped without settling (abort or panic upstream)
            Err(_) => Err(FetchError::Network(
                "coalesced request was abandoned before settling".to_string(),
            )),
        }
    }

    fn deregister(&self, key: &str, generation: u64) {
        let mut map = self.lock();
        if map.get(key).is_some_and(|e| e.generation == generation) {
            map.remove(key);
        }
    }

    /// Number of keys with an operation currently in flight
    pub fn in_flight_count(&self) -> usize {
        self.lock().len()
    }

    /// Whether an operation is currently registered for this key
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }
}

impl Default for RequestCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
