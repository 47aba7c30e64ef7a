//! Caching client surface
//!
//! [`CachedClient`] is the explicit service object applications hold: it
//! owns the cache tiers, the fetch orchestration, and the switch that
//! turns caching on and off. There is no process-global state and no
//! patching of a shared HTTP client; callers that want uncached behavior
//! get it per request or by disabling the whole layer.
//!
//! Only GET reads are cache-eligible. Everything else goes straight to
//! the underlying endpoint untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::fetcher::{CacheAsideFetcher, ReadEndpoint};
use crate::store::{BoundedMemoryCache, MemoryCacheStats, PersistentCacheStore, StorageBackend};
use crate::telemetry::{PerformanceReport, TelemetryRecorder};
use crate::types::{FetchError, FetchResult, ReadOptions, ReadOutcome};

/// HTTP transport backing the cache layer. Maps responses and transport
/// failures into the layer's result shape; never panics on bad payloads.
pub struct HttpReadEndpoint {
    client: reqwest::Client,
    base_url: String,
}

impl HttpReadEndpoint {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn resolve_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}{}", self.base_url.trim_end_matches('/'), url)
        }
    }
}

#[async_trait]
impl ReadEndpoint for HttpReadEndpoint {
    async fn perform_read(&self, url: &str, options: &ReadOptions) -> FetchResult {
        let method = Method::from_bytes(options.method.as_bytes()).unwrap_or(Method::GET);
        let mut request = self.client.request(method, self.resolve_url(url));

        for (name, value) in &options.headers {
            request = request.header(name, value);
        }
        if !options.query.is_empty() {
            request = request.query(&options.query);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        // An unparseable or null body reads as no body at all
        let body = response.json::<Value>().await.ok().filter(|v| !v.is_null());

        Ok(ReadOutcome::network(status, body))
    }
}

/// Client with a cache-aside middleware over an HTTP read endpoint.
///
/// Construct once, share by reference. Caching applies only to eligible
/// requests (GET, caching enabled, no per-request bypass); ineligible
/// requests pass through to the endpoint unchanged, so responses keep an
/// identical contract either way, apart from the `from_cache` flag.
pub struct CachedClient {
    endpoint: Arc<dyn ReadEndpoint>,
    fetcher: CacheAsideFetcher,
    persistent: Arc<PersistentCacheStore>,
    memory: Arc<BoundedMemoryCache>,
    telemetry: Arc<TelemetryRecorder>,
    enabled: AtomicBool,
    enabled_at_init: bool,
}

impl CachedClient {
    pub fn new(
        endpoint: Arc<dyn ReadEndpoint>,
        backend: Arc<dyn StorageBackend>,
        config: CacheConfig,
    ) -> Self {
        let persistent = Arc::new(PersistentCacheStore::new(backend, config.namespace.clone()));
        let memory = Arc::new(BoundedMemoryCache::new(
            config.memory_max_entries,
            config.memory_ttl,
        ));
        let telemetry = Arc::new(TelemetryRecorder::new(config.telemetry_capacity));
        let fetcher = CacheAsideFetcher::new(
            Arc::clone(&endpoint),
            Arc::clone(&persistent),
            Arc::clone(&memory),
            Arc::clone(&telemetry),
            &config,
        );

        info!(
            namespace = %config.namespace,
            memory_max_entries = config.memory_max_entries,
            default_ttl_ms = config.default_ttl.as_millis() as u64,
            "Caching client initialized"
        );

        Self {
            endpoint,
            fetcher,
            persistent,
            memory,
            telemetry,
            enabled: AtomicBool::new(true),
            enabled_at_init: true,
        }
    }

    /// Perform a read, through the cache when the request is eligible.
    pub async fn cached_fetch(&self, url: &str, options: &ReadOptions) -> FetchResult {
        if self.is_cacheable(options) {
            self.fetcher.fetch(url, options).await
        } else {
            self.endpoint.perform_read(url, options).await
        }
    }

    fn is_cacheable(&self, options: &ReadOptions) -> bool {
        self.enabled.load(Ordering::Relaxed)
            && !options.bypass_cache
            && options.method.eq_ignore_ascii_case("GET")
    }

    /// Read a stored value directly, judged against the given TTL
    pub fn get_cached_data(&self, key: &str, ttl: Duration) -> Option<Value> {
        self.persistent.get(key, ttl)
    }

    /// Store a value directly in both tiers under an explicit key
    pub fn set_cached_data(&self, key: &str, value: Value) {
        self.persistent.set(key, value.clone());
        self.memory.set(key, value, None);
    }

    /// Invalidate every cached entry whose key contains `pattern`, in both
    /// tiers. Matches explicit keys and derived URL keys alike; a URL works
    /// as a pattern since it is a substring of every key derived from it.
    /// Returns how many entries were removed.
    pub fn clear_cache_pattern(&self, pattern: &str) -> usize {
        let removed =
            self.persistent.clear_pattern(pattern) + self.memory.remove_matching(pattern);
        debug!(pattern = pattern, removed = removed, "Invalidated cached entries");
        removed
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Return the layer to its construction-time state: enabled flag reset,
    /// both tiers emptied, telemetry cleared.
    pub fn restore(&self) {
        self.enabled.store(self.enabled_at_init, Ordering::Relaxed);
        self.persistent.clear_pattern("");
        self.memory.clear();
        self.telemetry.reset();
        info!("Caching layer restored to initial state");
    }

    pub fn performance_stats(&self) -> PerformanceReport {
        self.telemetry.report()
    }

    pub fn memory_stats(&self) -> MemoryCacheStats {
        self.memory.stats()
    }

    /// Wait for background revalidations to finish; for tests and shutdown
    pub async fn await_revalidations(&self) {
        self.fetcher.await_revalidations().await;
    }

    /// Cancel background work. The caches themselves are left intact.
    pub fn dispose(&self) {
        self.fetcher.abort_revalidations();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio_test::assert_ok;

    struct MockEndpoint {
        calls: AtomicUsize,
        body: Value,
    }

    impl MockEndpoint {
        fn new(body: Value) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                body,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReadEndpoint for MockEndpoint {
        async fn perform_read(&self, _url: &str, _options: &ReadOptions) -> FetchResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ReadOutcome::network(200, Some(self.body.clone())))
        }
    }

    fn client_with(endpoint: Arc<MockEndpoint>) -> CachedClient {
        CachedClient::new(
            endpoint,
            Arc::new(MemoryBackend::new()),
            CacheConfig::new().with_namespace("test"),
        )
    }

    fn get_options() -> ReadOptions {
        ReadOptions::keyed("orders", Duration::from_secs(60))
    }

    #[tokio::test]
    async fn eligible_reads_are_cached() {
        let endpoint = Arc::new(MockEndpoint::new(json!([1, 2, 3])));
        let client = client_with(Arc::clone(&endpoint));

        let first = assert_ok!(client.cached_fetch("/api/orders", &get_options()).await);
        assert!(!first.from_cache);

        let second = assert_ok!(client.cached_fetch("/api/orders", &get_options()).await);
        assert!(second.from_cache);
        assert_eq!(second.body, first.body);
        assert_eq!(second.status, first.status);
        assert_eq!(second.ok, first.ok);
        client.await_revalidations().await;
    }

    #[tokio::test]
    async fn non_get_goes_direct() {
        let endpoint = Arc::new(MockEndpoint::new(json!({"created": true})));
        let client = client_with(Arc::clone(&endpoint));

        let mut options = get_options();
        options.method = "POST".to_string();

        for _ in 0..3 {
            let outcome = assert_ok!(client.cached_fetch("/api/orders", &options).await);
            assert!(!outcome.from_cache);
        }
        assert_eq!(endpoint.calls(), 3);
    }

    #[tokio::test]
    async fn bypass_flag_skips_the_cache() {
        let endpoint = Arc::new(MockEndpoint::new(json!(1)));
        let client = client_with(Arc::clone(&endpoint));

        assert_ok!(client.cached_fetch("/api/orders", &get_options()).await);

        let mut options = get_options();
        options.bypass_cache = true;
        let outcome = assert_ok!(client.cached_fetch("/api/orders", &options).await);
        assert!(!outcome.from_cache);
        assert_eq!(endpoint.calls(), 2);
    }

    #[tokio::test]
    async fn disabled_client_goes_direct() {
        let endpoint = Arc::new(MockEndpoint::new(json!(1)));
        let client = client_with(Arc::clone(&endpoint));

        client.disable();
        assert!(!client.is_enabled());

        assert_ok!(client.cached_fetch("/api/orders", &get_options()).await);
        let outcome = assert_ok!(client.cached_fetch("/api/orders", &get_options()).await);
        assert!(!outcome.from_cache);
        assert_eq!(endpoint.calls(), 2);

        client.enable();
        assert_ok!(client.cached_fetch("/api/orders", &get_options()).await);
        let outcome = assert_ok!(client.cached_fetch("/api/orders", &get_options()).await);
        assert!(outcome.from_cache);
        client.await_revalidations().await;
    }

    #[tokio::test]
    async fn restore_resets_to_initial_state() {
        let endpoint = Arc::new(MockEndpoint::new(json!(1)));
        let client = client_with(Arc::clone(&endpoint));

        assert_ok!(client.cached_fetch("/api/orders", &get_options()).await);
        client.disable();

        client.restore();

        assert!(client.is_enabled());
        assert_eq!(client.performance_stats().misses, 0);
        // The caches were emptied too
        let outcome = assert_ok!(client.cached_fetch("/api/orders", &get_options()).await);
        assert!(!outcome.from_cache);
        client.await_revalidations().await;
    }

    #[tokio::test]
    async fn clear_pattern_invalidates_all_variants() {
        let endpoint = Arc::new(MockEndpoint::new(json!([1])));
        let client = client_with(Arc::clone(&endpoint));

        // Two argument variants of the same URL, no explicit key
        let plain = ReadOptions::default();
        let mut paged = ReadOptions::default();
        paged.query = vec![("page".to_string(), "2".to_string())];

        assert_ok!(client.cached_fetch("/api/shows", &plain).await);
        assert_ok!(client.cached_fetch("/api/shows", &paged).await);
        assert_ok!(client.cached_fetch("/api/halls", &plain).await);

        let removed = client.clear_cache_pattern("/api/shows");
        assert!(removed >= 2);

        // Shows refetch from the network; halls still hit
        let outcome = assert_ok!(client.cached_fetch("/api/shows", &plain).await);
        assert!(!outcome.from_cache);
        let outcome = assert_ok!(client.cached_fetch("/api/halls", &plain).await);
        assert!(outcome.from_cache);
        client.await_revalidations().await;
    }

    #[tokio::test]
    async fn clear_pattern_invalidates_explicit_keys() {
        let endpoint = Arc::new(MockEndpoint::new(json!([1])));
        let client = client_with(Arc::clone(&endpoint));

        // Entries stored under explicit keys, not derived URL keys
        assert_ok!(client.cached_fetch("/api/orders", &get_options()).await);
        client.set_cached_data("orders-summary", json!({"total": 3}));

        let removed = client.clear_cache_pattern("orders");
        assert!(removed >= 2, "explicit keys must match the raw pattern");

        let outcome = assert_ok!(client.cached_fetch("/api/orders", &get_options()).await);
        assert!(!outcome.from_cache);
        assert!(client
            .get_cached_data("orders-summary", Duration::from_secs(60))
            .is_none());
        client.await_revalidations().await;
    }

    #[tokio::test]
    async fn direct_cache_accessors() {
        let endpoint = Arc::new(MockEndpoint::new(json!(1)));
        let client = client_with(endpoint);

        assert!(client.get_cached_data("seats", Duration::from_secs(60)).is_none());

        client.set_cached_data("seats", json!({"rows": 12}));
        assert_eq!(
            client.get_cached_data("seats", Duration::from_secs(60)),
            Some(json!({"rows": 12}))
        );
        // A zero TTL reader sees nothing
        assert!(client.get_cached_data("seats", Duration::ZERO).is_none());
    }

    #[tokio::test]
    async fn stats_reflect_traffic() {
        let endpoint = Arc::new(MockEndpoint::new(json!(1)));
        let client = client_with(endpoint);

        assert_ok!(client.cached_fetch("/api/orders", &get_options()).await);
        assert_ok!(client.cached_fetch("/api/orders", &get_options()).await);
        client.await_revalidations().await;

        let report = client.performance_stats();
        assert_eq!(report.misses, 1);
        assert_eq!(report.hits, 1);
        assert!(client.memory_stats().size >= 1);
    }
}
