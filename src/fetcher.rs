//! Cache-aside fetch orchestration
//!
//! Read path for a single request:
//!
//! 1. Probe the persistent store, then the memory tier, with the caller's
//!    idea of freshness.
//! 2. On a hit, answer from cache immediately and kick off a background
//!    revalidation that refreshes the entry without the caller waiting.
//! 3. On a miss, go to the network through the [`RequestCoordinator`] so
//!    concurrent misses for the same key share one request, then write the
//!    response through both cache tiers.
//!
//! Revalidation is silent: a failed refresh is logged and the previously
//! cached entry stays in place. The next foreground read decides whether
//! that entry is still fresh enough.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::coalesce::RequestCoordinator;
use crate::config::CacheConfig;
use crate::keys::CacheKey;
use crate::store::{BoundedMemoryCache, PersistentCacheStore};
use crate::telemetry::{Outcome, TelemetryRecorder};
use crate::types::{FetchResult, ReadOptions, ReadOutcome};

/// Transport seam: anything that can perform one uncached read.
///
/// The production implementation wraps an HTTP client; tests substitute
/// scripted endpoints.
#[async_trait]
pub trait ReadEndpoint: Send + Sync {
    async fn perform_read(&self, url: &str, options: &ReadOptions) -> FetchResult;
}

/// Orchestrates cache probe, coalesced network fetch, write-through, and
/// background revalidation for read requests.
pub struct CacheAsideFetcher {
    endpoint: Arc<dyn ReadEndpoint>,
    persistent: Arc<PersistentCacheStore>,
    memory: Arc<BoundedMemoryCache>,
    coordinator: Arc<RequestCoordinator>,
    telemetry: Arc<TelemetryRecorder>,
    /// Live background revalidation tasks, by storage key
    revalidations: DashMap<String, JoinHandle<()>>,
    default_ttl: Duration,
    request_timeout: Duration,
}

impl CacheAsideFetcher {
    pub fn new(
        endpoint: Arc<dyn ReadEndpoint>,
        persistent: Arc<PersistentCacheStore>,
        memory: Arc<BoundedMemoryCache>,
        telemetry: Arc<TelemetryRecorder>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            endpoint,
            persistent,
            memory,
            coordinator: Arc::new(RequestCoordinator::new()),
            telemetry,
            revalidations: DashMap::new(),
            default_ttl: config.default_ttl,
            request_timeout: config.request_timeout,
        }
    }

    /// Resolve a read through the cache layers, falling back to the network.
    ///
    /// Freshness is judged here, at read time, against the caller's TTL:
    /// the same stored entry can be a hit for a lenient caller and a miss
    /// for a strict one. Cached answers carry `from_cache = true` and are
    /// otherwise shaped exactly like network answers.
    pub async fn fetch(&self, url: &str, options: &ReadOptions) -> FetchResult {
        let key = options
            .cache_key
            .clone()
            .unwrap_or_else(|| CacheKey::new(url, options).to_storage_key());
        let ttl = options.ttl.unwrap_or(self.default_ttl);
        let started = Instant::now();

        if let Some(value) = self.probe(&key, ttl) {
            self.telemetry.record(
                "cached_fetch",
                started.elapsed().as_secs_f64() * 1000.0,
                Outcome::Hit,
            );
            debug!(key = %key, "Cache hit, revalidating in background");
            self.spawn_revalidation(&key, url, options);
            return Ok(ReadOutcome::cached(value));
        }

        let timeout = options.timeout.unwrap_or(self.request_timeout);
        let result = self
            .coordinator
            .issue(&key, Some(timeout), self.read_factory(url, options))
            .await;

        self.telemetry.record(
            "cached_fetch",
            started.elapsed().as_secs_f64() * 1000.0,
            Outcome::Miss,
        );

        match result {
            Ok(outcome) => {
                self.write_through(&key, &outcome);
                Ok(outcome)
            }
            Err(err) => Err(err),
        }
    }

    fn probe(&self, key: &str, ttl: Duration) -> Option<serde_json::Value> {
        self.persistent
            .get(key, ttl)
            .or_else(|| self.memory.get_fresh(key, ttl))
    }

    /// Store a successful response in both tiers. Empty and bodyless
    /// responses are never cached; serving them later as hits would turn a
    /// transient empty answer into a sticky one.
    fn write_through(&self, key: &str, outcome: &ReadOutcome) {
        if !outcome.ok || !outcome.has_body() {
            return;
        }
        if let Some(body) = &outcome.body {
            self.persistent.set(key, body.clone());
            self.memory.set(key, body.clone(), None);
        }
    }

    fn read_factory(
        &self,
        url: &str,
        options: &ReadOptions,
    ) -> impl FnOnce() -> futures::future::BoxFuture<'static, FetchResult> {
        let endpoint = Arc::clone(&self.endpoint);
        let url = url.to_string();
        let options = options.clone();
        move || Box::pin(async move { endpoint.perform_read(&url, &options).await })
    }

    /// Refresh a cached entry in the background. At most one revalidation
    /// per key is live; a hit while one is running does not stack another.
    fn spawn_revalidation(&self, key: &str, url: &str, options: &ReadOptions) {
        if let Some(existing) = self.revalidations.get(key) {
            if !existing.is_finished() {
                return;
            }
        }
        // Handles for keys never hit again would otherwise accumulate
        self.revalidations.retain(|_, handle| !handle.is_finished());

        let endpoint = Arc::clone(&self.endpoint);
        let persistent = Arc::clone(&self.persistent);
        let memory = Arc::clone(&self.memory);
        let coordinator = Arc::clone(&self.coordinator);
        let key_owned = key.to_string();
        let url = url.to_string();
        let options = options.clone();
        let timeout = options.timeout.unwrap_or(self.request_timeout);

        let handle = tokio::spawn(async move {
            let result = coordinator
                .issue(&key_owned, Some(timeout), move || {
                    Box::pin(async move { endpoint.perform_read(&url, &options).await })
                        as futures::future::BoxFuture<'static, FetchResult>
                })
                .await;
            match result {
                Ok(outcome) if outcome.ok && outcome.has_body() => {
                    if let Some(body) = outcome.body {
                        persistent.set(&key_owned, body.clone());
                        memory.set(&key_owned, body, None);
                        debug!(key = %key_owned, "Background revalidation refreshed entry");
                    }
                }
                Ok(_) => {
                    // Response unusable for caching; keep the stale entry
                    debug!(key = %key_owned, "Background revalidation returned no cacheable body");
                }
                Err(err) => {
                    // Never surfaces and never evicts what we already have
                    debug!(key = %key_owned, error = %err, "Background revalidation failed");
                }
            }
        });

        self.revalidations.insert(key.to_string(), handle);
    }

    /// Wait for every live background revalidation to finish. Intended for
    /// tests and orderly shutdown.
    pub async fn await_revalidations(&self) {
        let keys: Vec<String> = self.revalidations.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, handle)) = self.revalidations.remove(&key) {
                let _ = handle.await;
            }
        }
    }

    /// Cancel outstanding background revalidations.
    pub fn abort_revalidations(&self) {
        let keys: Vec<String> = self.revalidations.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, handle)) = self.revalidations.remove(&key) {
                handle.abort();
            }
        }
    }

    /// Number of revalidation handles currently tracked
    pub fn revalidation_count(&self) -> usize {
        self.revalidations.len()
    }

    pub fn coordinator(&self) -> &RequestCoordinator {
        &self.coordinator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use crate::types::FetchError;
    use futures::future::join_all;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::assert_ok;

    /// Scripted endpoint: counts calls, optionally sleeps, answers from a
    /// fixed script of results (last one repeats).
    struct MockEndpoint {
        calls: AtomicUsize,
        delay: Duration,
        script: Vec<FetchResult>,
    }

    impl MockEndpoint {
        fn returning(result: FetchResult) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                script: vec![result],
            }
        }

        fn scripted(script: Vec<FetchResult>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                script,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReadEndpoint for MockEndpoint {
        async fn perform_read(&self, _url: &str, _options: &ReadOptions) -> FetchResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.script
                .get(n)
                .or_else(|| self.script.last())
                .cloned()
                .unwrap_or_else(|| Err(FetchError::Network("script exhausted".to_string())))
        }
    }

    fn fetcher_with(endpoint: Arc<MockEndpoint>) -> (CacheAsideFetcher, Arc<TelemetryRecorder>) {
        let config = CacheConfig::new();
        let persistent = Arc::new(PersistentCacheStore::new(
            Arc::new(MemoryBackend::new()),
            "test",
        ));
        let memory = Arc::new(BoundedMemoryCache::new(
            config.memory_max_entries,
            config.memory_ttl,
        ));
        let telemetry = Arc::new(TelemetryRecorder::new(config.telemetry_capacity));
        let fetcher = CacheAsideFetcher::new(
            endpoint,
            persistent,
            memory,
            Arc::clone(&telemetry),
            &config,
        );
        (fetcher, telemetry)
    }

    fn shows() -> Value {
        json!([{"id": 1, "title": "Hamlet"}])
    }

    #[tokio::test]
    async fn miss_fetches_and_caches() {
        let endpoint = Arc::new(MockEndpoint::returning(Ok(ReadOutcome::network(
            200,
            Some(shows()),
        ))));
        let (fetcher, telemetry) = fetcher_with(Arc::clone(&endpoint));
        let options = ReadOptions::keyed("shows", Duration::from_secs(60));

        let outcome = assert_ok!(fetcher.fetch("/api/shows", &options).await);
        assert!(!outcome.from_cache);
        assert_eq!(outcome.body, Some(shows()));
        assert_eq!(endpoint.calls(), 1);

        // Second read is served from cache without touching the network
        let outcome = assert_ok!(fetcher.fetch("/api/shows", &options).await);
        assert!(outcome.from_cache);
        assert_eq!(outcome.body, Some(shows()));
        fetcher.await_revalidations().await;

        let report = telemetry.report();
        assert_eq!(report.misses, 1);
        assert_eq!(report.hits, 1);
    }

    #[tokio::test]
    async fn hit_revalidates_in_background() {
        let endpoint = Arc::new(MockEndpoint::scripted(vec![
            Ok(ReadOutcome::network(200, Some(json!({"v": 1})))),
            Ok(ReadOutcome::network(200, Some(json!({"v": 2})))),
        ]));
        let (fetcher, _) = fetcher_with(Arc::clone(&endpoint));
        let options = ReadOptions::keyed("k", Duration::from_secs(60));

        assert_ok!(fetcher.fetch("/api/k", &options).await);

        let outcome = assert_ok!(fetcher.fetch("/api/k", &options).await);
        assert_eq!(outcome.body, Some(json!({"v": 1})));
        fetcher.await_revalidations().await;

        // Revalidation refreshed the stored entry
        assert_eq!(endpoint.calls(), 2);
        let outcome = assert_ok!(fetcher.fetch("/api/k", &options).await);
        assert_eq!(outcome.body, Some(json!({"v": 2})));
        fetcher.await_revalidations().await;
    }

    #[tokio::test]
    async fn failed_revalidation_keeps_cached_entry() {
        let endpoint = Arc::new(MockEndpoint::scripted(vec![
            Ok(ReadOutcome::network(200, Some(json!({"v": 1})))),
            Err(FetchError::Network("refused".to_string())),
        ]));
        let (fetcher, _) = fetcher_with(Arc::clone(&endpoint));
        let options = ReadOptions::keyed("k", Duration::from_secs(60));

        assert_ok!(fetcher.fetch("/api/k", &options).await);
        let outcome = assert_ok!(fetcher.fetch("/api/k", &options).await);
        assert!(outcome.from_cache);
        fetcher.await_revalidations().await;

        // The refresh failed silently; the old entry still serves
        let outcome = assert_ok!(fetcher.fetch("/api/k", &options).await);
        assert!(outcome.from_cache);
        assert_eq!(outcome.body, Some(json!({"v": 1})));
        fetcher.await_revalidations().await;
    }

    #[tokio::test]
    async fn finished_revalidation_handles_are_pruned() {
        let endpoint = Arc::new(MockEndpoint::returning(Ok(ReadOutcome::network(
            200,
            Some(json!(1)),
        ))));
        let (fetcher, _) = fetcher_with(Arc::clone(&endpoint));

        // A hit on "a" spawns a revalidation; let it run to completion
        let a = ReadOptions::keyed("a", Duration::from_secs(60));
        assert_ok!(fetcher.fetch("/api/a", &a).await);
        assert_ok!(fetcher.fetch("/api/a", &a).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fetcher.revalidation_count(), 1);

        // Spawning for "b" sweeps the finished "a" handle out
        let b = ReadOptions::keyed("b", Duration::from_secs(60));
        assert_ok!(fetcher.fetch("/api/b", &b).await);
        assert_ok!(fetcher.fetch("/api/b", &b).await);
        assert_eq!(fetcher.revalidation_count(), 1);
        fetcher.await_revalidations().await;
    }

    #[tokio::test]
    async fn empty_body_is_not_cached() {
        let endpoint = Arc::new(MockEndpoint::returning(Ok(ReadOutcome::network(200, None))));
        let (fetcher, _) = fetcher_with(Arc::clone(&endpoint));
        let options = ReadOptions::keyed("k", Duration::from_secs(60));

        let outcome = assert_ok!(fetcher.fetch("/api/k", &options).await);
        assert!(!outcome.from_cache);

        // Still a miss the second time around
        let outcome = assert_ok!(fetcher.fetch("/api/k", &options).await);
        assert!(!outcome.from_cache);
        assert_eq!(endpoint.calls(), 2);
    }

    #[tokio::test]
    async fn error_response_is_not_cached() {
        let endpoint = Arc::new(MockEndpoint::scripted(vec![
            Ok(ReadOutcome::network(500, Some(json!({"error": "boom"})))),
            Ok(ReadOutcome::network(200, Some(shows()))),
        ]));
        let (fetcher, _) = fetcher_with(Arc::clone(&endpoint));
        let options = ReadOptions::keyed("k", Duration::from_secs(60));

        let outcome = assert_ok!(fetcher.fetch("/api/k", &options).await);
        assert!(!outcome.ok);

        let outcome = assert_ok!(fetcher.fetch("/api/k", &options).await);
        assert!(outcome.ok);
        assert!(!outcome.from_cache);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_network_call() {
        let endpoint = Arc::new(
            MockEndpoint::returning(Ok(ReadOutcome::network(200, Some(shows()))))
                .with_delay(Duration::from_millis(20)),
        );
        let (fetcher, _) = fetcher_with(Arc::clone(&endpoint));
        let options = ReadOptions::keyed("shows", Duration::from_secs(60));

        let reads: Vec<_> = (0..4).map(|_| fetcher.fetch("/api/shows", &options)).collect();
        let results = join_all(reads).await;

        assert_eq!(endpoint.calls(), 1);
        for result in results {
            let outcome = assert_ok!(result);
            assert_eq!(outcome.body, Some(shows()));
        }
    }

    #[tokio::test]
    async fn per_caller_ttl_decides_freshness() {
        let endpoint = Arc::new(MockEndpoint::returning(Ok(ReadOutcome::network(
            200,
            Some(shows()),
        ))));
        let (fetcher, _) = fetcher_with(Arc::clone(&endpoint));

        assert_ok!(
            fetcher
                .fetch("/api/shows", &ReadOptions::keyed("shows", Duration::from_secs(60)))
                .await
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Strict caller: 1ms TTL, the entry is stale for them
        let strict = ReadOptions::keyed("shows", Duration::from_millis(1));
        let outcome = assert_ok!(fetcher.fetch("/api/shows", &strict).await);
        assert!(!outcome.from_cache);

        // Lenient caller: same entry is still fresh
        let lenient = ReadOptions::keyed("shows", Duration::from_secs(60));
        let outcome = assert_ok!(fetcher.fetch("/api/shows", &lenient).await);
        assert!(outcome.from_cache);
        fetcher.await_revalidations().await;
    }

    #[tokio::test]
    async fn network_error_propagates_unchanged() {
        let endpoint = Arc::new(MockEndpoint::returning(Err(FetchError::Network(
            "connection refused".to_string(),
        ))));
        let (fetcher, _) = fetcher_with(Arc::clone(&endpoint));
        let options = ReadOptions::keyed("k", Duration::from_secs(60));

        let result = fetcher.fetch("/api/k", &options).await;
        assert_eq!(
            result,
            Err(FetchError::Network("connection refused".to_string()))
        );
    }

    #[tokio::test]
    async fn caller_timeout_bounds_slow_reads() {
        let endpoint = Arc::new(
            MockEndpoint::returning(Ok(ReadOutcome::network(200, Some(shows()))))
                .with_delay(Duration::from_millis(200)),
        );
        let (fetcher, _) = fetcher_with(Arc::clone(&endpoint));
        let mut options = ReadOptions::keyed("k", Duration::from_secs(60));
        options.timeout = Some(Duration::from_millis(10));

        let result = fetcher.fetch("/api/k", &options).await;
        assert_eq!(result, Err(FetchError::Timeout(Duration::from_millis(10))));
    }

    #[tokio::test]
    async fn derived_keys_separate_distinct_queries() {
        let endpoint = Arc::new(MockEndpoint::scripted(vec![
            Ok(ReadOutcome::network(200, Some(json!({"page": 1})))),
            Ok(ReadOutcome::network(200, Some(json!({"page": 2})))),
        ]));
        let (fetcher, _) = fetcher_with(Arc::clone(&endpoint));

        let mut page1 = ReadOptions::default();
        page1.query = vec![("page".to_string(), "1".to_string())];
        let mut page2 = ReadOptions::default();
        page2.query = vec![("page".to_string(), "2".to_string())];

        let a = assert_ok!(fetcher.fetch("/api/shows", &page1).await);
        let b = assert_ok!(fetcher.fetch("/api/shows", &page2).await);
        assert_ne!(a.body, b.body);
        assert_eq!(endpoint.calls(), 2);

        // Repeating a query hits its own entry
        let again = assert_ok!(fetcher.fetch("/api/shows", &page1).await);
        assert!(again.from_cache);
        assert_eq!(again.body, Some(json!({"page": 1})));
        fetcher.await_revalidations().await;
    }
}
