//! Cached query layer.
//!
//! The read/write API the rest of the station software talks to. Reads go
//! through the entry cache and fall through to the store on a miss; writes go
//! straight to the store and then invalidate what the cache holds for the
//! collection before returning.
//!
//! # Example
//!
//! ```ignore
//! let layer = CachedQueryLayer::builder(Arc::new(InMemoryStore::default()))
//!     .with_config(LayerConfig::default())
//!     .with_caller("alice")
//!     .build()?;
//!
//! let ctx = CallContext::new().with_timeout(Duration::from_secs(5));
//! let page = layer
//!     .query("news", &Predicates::new().with_owner("alice"), &Pagination::new(), &ctx)
//!     .await?;
//! ```

use std::sync::Arc;

use onair_core::{
    CollectionRegistry, EpochMillis, Item, ItemKey, LayerConfig, OnAirError, OnAirResult, Page,
    Pagination, Predicates, SharedClock, StoreError, SystemClock, WriteIntent,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::cache::{CacheKey, CacheStats, CachedValue, EntryCache};
use crate::events::{InvalidationEvent, InvalidationSource};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::store::{CallContext, StoreBackend, StoreClient};
use crate::strategy::QueryStrategySelector;

/// Identity stamped on items written without an owner.
pub const UNKNOWN_CALLER: &str = "unknown";

/// How a query uses the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadMode {
    /// Serve a fresh cached page, otherwise fetch and cache.
    #[default]
    Cached,
    /// Always fetch; replace whatever the cache holds for the query.
    Refresh,
    /// Always fetch; leave the cache untouched.
    Bypass,
}

struct LayerInner<B: StoreBackend> {
    cache: EntryCache,
    client: StoreClient<B>,
    metrics: Arc<MetricsCollector>,
    clock: SharedClock,
    config: LayerConfig,
    caller: String,
}

/// Read-through cache in front of a [`StoreBackend`].
///
/// Cloning is cheap; clones share the cache, the metrics and the backend.
pub struct CachedQueryLayer<B: StoreBackend> {
    inner: Arc<LayerInner<B>>,
}

impl<B: StoreBackend> Clone for CachedQueryLayer<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Builder for [`CachedQueryLayer`].
pub struct LayerBuilder<B: StoreBackend> {
    backend: Arc<B>,
    registry: CollectionRegistry,
    config: LayerConfig,
    clock: SharedClock,
    caller: String,
}

impl<B: StoreBackend> LayerBuilder<B> {
    /// Collection catalogue. Defaults to the station tables.
    pub fn with_registry(mut self, registry: CollectionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_config(mut self, config: LayerConfig) -> Self {
        self.config = config;
        self
    }

    /// Time source for TTL and item preparation. Defaults to the system clock.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Identity recorded as owner of items written without one.
    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = caller.into();
        self
    }

    /// Validate the configuration and assemble the layer.
    pub fn build(self) -> OnAirResult<CachedQueryLayer<B>> {
        self.config.validate()?;
        let metrics = Arc::new(MetricsCollector::new());
        let cache = EntryCache::new(&self.config.cache, self.clock.clone(), metrics.clone());
        let selector =
            QueryStrategySelector::new(Arc::new(self.registry), self.config.pagination.clone());
        let client = StoreClient::new(
            self.backend,
            selector,
            metrics.clone(),
            self.config.batch.clone(),
        );
        Ok(CachedQueryLayer {
            inner: Arc::new(LayerInner {
                cache,
                client,
                metrics,
                clock: self.clock,
                config: self.config,
                caller: self.caller,
            }),
        })
    }
}

impl<B: StoreBackend> CachedQueryLayer<B> {
    pub fn builder(backend: Arc<B>) -> LayerBuilder<B> {
        LayerBuilder {
            backend,
            registry: CollectionRegistry::station_defaults(),
            config: LayerConfig::default(),
            clock: Arc::new(SystemClock),
            caller: UNKNOWN_CALLER.to_string(),
        }
    }

    /// Layer over the station tables with the given configuration.
    pub fn new(backend: Arc<B>, config: LayerConfig) -> OnAirResult<Self> {
        Self::builder(backend).with_config(config).build()
    }

    pub fn config(&self) -> &LayerConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> &B {
        self.inner.client.backend()
    }

    pub fn registry(&self) -> &CollectionRegistry {
        self.inner.client.selector().registry()
    }

    fn generation(&self) -> u64 {
        self.inner.cache.generation()
    }

    /// Cache a freshly fetched value unless an invalidation ran meanwhile.
    fn populate(&self, key: CacheKey, value: CachedValue, started_at: u64) {
        if !self.inner.cache.set_if_current(key.clone(), value, started_at) {
            tracing::debug!(key = %key, "Skipping cache fill after concurrent invalidation");
        }
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// One page of items matching `predicates`.
    ///
    /// Bad page sizes and unknown collections are rejected before the cache
    /// or the store is consulted.
    pub async fn query(
        &self,
        collection: &str,
        predicates: &Predicates,
        pagination: &Pagination,
        ctx: &CallContext,
    ) -> OnAirResult<Page> {
        self.query_with(collection, predicates, pagination, ReadMode::Cached, ctx)
            .await
    }

    /// [`CachedQueryLayer::query`] with an explicit cache policy.
    pub async fn query_with(
        &self,
        collection: &str,
        predicates: &Predicates,
        pagination: &Pagination,
        mode: ReadMode,
        ctx: &CallContext,
    ) -> OnAirResult<Page> {
        let plan = self
            .inner
            .client
            .selector()
            .select(collection, predicates, pagination)?;
        let key = CacheKey::page(collection, predicates, plan.limit, pagination.cursor.as_ref());

        if mode == ReadMode::Cached {
            if let Some(page) = self.inner.cache.get_page(&key) {
                tracing::debug!(key = %key, count = page.count, "Cache hit");
                return Ok(page);
            }
            tracing::debug!(key = %key, strategy = %plan.strategy, "Cache miss");
        } else {
            tracing::debug!(key = %key, strategy = %plan.strategy, ?mode, "Cache skipped");
        }

        let started_at = self.generation();
        let page = self.inner.client.execute(&plan, ctx).await?;
        if mode != ReadMode::Bypass {
            self.populate(key, CachedValue::Page(page.clone()), started_at);
        }
        Ok(page)
    }

    /// Follow a page's continuation cursor. A final page yields an empty one
    /// without touching the store.
    pub async fn load_more(
        &self,
        collection: &str,
        predicates: &Predicates,
        page: &Page,
        page_size: Option<i64>,
        ctx: &CallContext,
    ) -> OnAirResult<Page> {
        let Some(cursor) = page.next_cursor.clone() else {
            return Ok(Page::empty());
        };
        let pagination = Pagination {
            page_size,
            cursor: Some(cursor),
        };
        self.query(collection, predicates, &pagination, ctx).await
    }

    /// One item by id. `None` when the store has no such item.
    pub async fn get(&self, collection: &str, id: &str, ctx: &CallContext) -> OnAirResult<Option<Item>> {
        self.registry().resolve(collection)?;
        if id.is_empty() {
            return Err(OnAirError::invalid_argument("id", "must not be empty"));
        }
        let key = CacheKey::item(collection, id);
        if let Some(item) = self.inner.cache.get_item(&key) {
            tracing::debug!(key = %key, "Cache hit");
            return Ok(Some(item));
        }

        let started_at = self.generation();
        let item = self.inner.client.get(collection, id, ctx).await?;
        if let Some(found) = &item {
            self.populate(key, CachedValue::Item(found.clone()), started_at);
        }
        Ok(item)
    }

    /// Read many items by key. Not cached; missing keys are omitted.
    pub async fn batch_get(
        &self,
        collection: &str,
        keys: &[ItemKey],
        ctx: &CallContext,
    ) -> OnAirResult<Vec<Item>> {
        self.inner.client.batch_get(collection, keys, ctx).await
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    fn prepare(&self, collection: &str, item: Item) -> OnAirResult<Item> {
        let spec = self.registry().resolve(collection)?;
        Ok(item.prepare(
            self.inner.clock.now_millis(),
            &self.inner.caller,
            &spec.default_status,
        ))
    }

    /// Create or replace an item under optimistic concurrency.
    ///
    /// `expected_updated_at = None` creates; `Some(v)` replaces only if the
    /// stored version is still `v`. A lost race is returned as
    /// `ConcurrentModification` and never retried here. On success every
    /// cached page of the collection is dropped and a cached copy of the item
    /// is patched in place.
    pub async fn upsert(
        &self,
        collection: &str,
        item: Item,
        expected_updated_at: Option<EpochMillis>,
        ctx: &CallContext,
    ) -> OnAirResult<Item> {
        let intent = WriteIntent {
            item: self.prepare(collection, item)?,
            expected_updated_at,
        };
        let stored = self.inner.client.conditional_put(collection, &intent, ctx).await?;

        self.invalidate_pages(collection);
        let patched = self.inner.cache.patch(
            &CacheKey::item(collection, &stored.id),
            CachedValue::Item(stored.clone()),
        );
        tracing::debug!(
            collection,
            id = %stored.id,
            updated_at = stored.updated_at,
            patched,
            "Upsert committed"
        );
        Ok(stored)
    }

    /// Delete an item, then drop the collection's pages and the item's entry.
    pub async fn delete(
        &self,
        collection: &str,
        id: &str,
        created_at: EpochMillis,
        ctx: &CallContext,
    ) -> OnAirResult<()> {
        let key = ItemKey::new(id, created_at);
        self.inner.client.delete(collection, &key, ctx).await?;
        self.invalidate_pages(collection);
        self.inner.cache.remove(&CacheKey::item(collection, id));
        Ok(())
    }

    /// Write many items without version checks.
    ///
    /// Pages are invalidated whatever the outcome, since earlier chunks may
    /// have committed before a later one failed.
    pub async fn batch_write(
        &self,
        collection: &str,
        items: Vec<Item>,
        ctx: &CallContext,
    ) -> OnAirResult<Vec<Item>> {
        let prepared = items
            .into_iter()
            .map(|item| self.prepare(collection, item))
            .collect::<OnAirResult<Vec<_>>>()?;

        let result = self.inner.client.batch_write(collection, &prepared, ctx).await;
        self.invalidate_pages(collection);

        match &result {
            Ok(written) => self.patch_items(collection, written),
            Err(OnAirError::Store(StoreError::PartialBatchFailure { succeeded, .. })) => {
                self.patch_items(collection, succeeded)
            }
            Err(_) => {
                for item in &prepared {
                    self.inner.cache.remove(&CacheKey::item(collection, &item.id));
                }
            }
        }
        result
    }

    fn patch_items(&self, collection: &str, items: &[Item]) {
        for item in items {
            self.inner.cache.patch(
                &CacheKey::item(collection, &item.id),
                CachedValue::Item(item.clone()),
            );
        }
    }

    // ------------------------------------------------------------------------
    // Invalidation
    // ------------------------------------------------------------------------

    fn invalidate_pages(&self, collection: &str) -> usize {
        self.inner
            .cache
            .invalidate_prefix(&CacheKey::page_prefix(collection))
    }

    /// Drop every cached page and item of a collection.
    pub fn invalidate_collection(&self, collection: &str) -> usize {
        let removed = self
            .inner
            .cache
            .invalidate_prefix(&CacheKey::collection_prefix(collection));
        tracing::info!(collection, removed, "Collection invalidated");
        removed
    }

    /// Drop everything cached.
    pub fn clear_cache(&self) -> usize {
        let removed = self.inner.cache.clear();
        tracing::info!(removed, "Cache cleared");
        removed
    }

    /// Handle one pushed change notification.
    pub fn apply_invalidation(&self, event: &InvalidationEvent) -> usize {
        self.invalidate_collection(event.collection())
    }

    /// True when the query's page is cached and fresh. Not a lookup: hit and
    /// miss counters and recency are untouched.
    pub fn is_cached(
        &self,
        collection: &str,
        predicates: &Predicates,
        pagination: &Pagination,
    ) -> OnAirResult<bool> {
        let plan = self
            .inner
            .client
            .selector()
            .select(collection, predicates, pagination)?;
        let key = CacheKey::page(collection, predicates, plan.limit, pagination.cursor.as_ref());
        Ok(self.inner.cache.contains(&key))
    }

    /// True when the item is cached and fresh. Not a lookup.
    pub fn is_item_cached(&self, collection: &str, id: &str) -> bool {
        self.inner.cache.contains(&CacheKey::item(collection, id))
    }

    // ------------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------------

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Counters plus current cache occupancy.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = self.inner.metrics.snapshot();
        let stats = self.inner.cache.stats();
        snapshot.cache_entries = stats.entry_count;
        snapshot.cache_bytes = stats.memory_bytes;
        snapshot
    }
}

impl<B: StoreBackend + 'static> CachedQueryLayer<B> {
    /// Listen to a change feed on a background task until the returned
    /// handle is dropped or the feed closes.
    ///
    /// Every event invalidates its collection. A subscriber that falls
    /// behind and misses events clears the whole cache.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn subscribe<S: InvalidationSource + ?Sized>(&self, source: &S) -> InvalidationSubscription {
        let mut events = source.subscribe();
        let layer = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        layer.apply_invalidation(&event);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Invalidation feed lagged, clearing cache");
                        layer.clear_cache();
                    }
                    Err(RecvError::Closed) => {
                        tracing::debug!("Invalidation feed closed");
                        break;
                    }
                }
            }
        });
        InvalidationSubscription { handle }
    }
}

/// Handle to a running invalidation listener. Dropping it stops the listener.
#[derive(Debug)]
pub struct InvalidationSubscription {
    handle: JoinHandle<()>,
}

impl InvalidationSubscription {
    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for InvalidationSubscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastInvalidationSource;
    use crate::store::InMemoryStore;
    use onair_core::{Clock, ManualClock};
    use serde_json::json;

    fn layer() -> (CachedQueryLayer<InMemoryStore>, ManualClock) {
        let clock = ManualClock::new(1_000);
        let store = InMemoryStore::new(Arc::new(clock.clone()));
        let layer = CachedQueryLayer::builder(Arc::new(store))
            .with_clock(Arc::new(clock.clone()))
            .with_caller("alice")
            .build()
            .expect("valid layer");
        (layer, clock)
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let result = CachedQueryLayer::new(
            Arc::new(InMemoryStore::default()),
            LayerConfig::new().with_max_entries(0),
        );
        assert!(matches!(result, Err(OnAirError::Config(_))));
    }

    #[tokio::test]
    async fn test_upsert_prepares_item() {
        let (layer, _) = layer();
        let stored = layer
            .upsert("news", Item::new("", 0, "", ""), None, &CallContext::new())
            .await
            .expect("create");
        assert!(!stored.id.is_empty());
        assert_eq!(stored.created_at, 1_000);
        assert_eq!(stored.owner_id, "alice");
        assert_eq!(stored.status, "draft");
        assert!(stored.updated_at >= stored.created_at);
    }

    #[tokio::test]
    async fn test_query_caches_and_hits() {
        let (layer, _) = layer();
        let ctx = CallContext::new();
        layer
            .upsert("news", Item::new("n1", 10, "alice", "active"), None, &ctx)
            .await
            .expect("seed");

        let predicates = Predicates::new().with_owner("alice");
        let first = layer.query("news", &predicates, &Pagination::new(), &ctx).await.expect("query");
        let second = layer.query("news", &predicates, &Pagination::new(), &ctx).await.expect("query");
        assert_eq!(first, second);
        assert_eq!(layer.backend().call_counts().index_queries, 1);

        let snapshot = layer.metrics_snapshot();
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 1);
        assert_eq!(snapshot.cache_entries, 1);
    }

    #[tokio::test]
    async fn test_explicit_default_page_size_shares_cache_entry() {
        let (layer, _) = layer();
        let ctx = CallContext::new();
        layer.query("blocks", &Predicates::new(), &Pagination::new(), &ctx).await.expect("query");
        assert!(layer
            .is_cached("blocks", &Predicates::new(), &Pagination::page_size(20))
            .expect("valid"));
    }

    #[tokio::test]
    async fn test_invalid_page_size_touches_nothing() {
        let (layer, _) = layer();
        let err = layer
            .query("news", &Predicates::new(), &Pagination::page_size(0), &CallContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OnAirError::Validation(_)));
        assert_eq!(layer.backend().call_counts().total(), 0);
        assert_eq!(layer.metrics_snapshot().cache_misses, 0);
    }

    #[tokio::test]
    async fn test_get_missing_item_is_none_and_not_cached() {
        let (layer, _) = layer();
        let ctx = CallContext::new();
        assert_eq!(layer.get("news", "ghost", &ctx).await.expect("get"), None);
        assert!(!layer.is_item_cached("news", "ghost"));
    }

    #[tokio::test]
    async fn test_delete_drops_item_and_pages() {
        let (layer, _) = layer();
        let ctx = CallContext::new();
        let stored = layer
            .upsert("news", Item::new("n1", 10, "alice", "active"), None, &ctx)
            .await
            .expect("seed");
        layer.get("news", "n1", &ctx).await.expect("get");
        layer.query("news", &Predicates::new(), &Pagination::new(), &ctx).await.expect("query");
        assert_eq!(layer.cache_stats().entry_count, 2);

        layer.delete("news", "n1", stored.created_at, &ctx).await.expect("delete");
        assert_eq!(layer.cache_stats().entry_count, 0);
        assert_eq!(layer.get("news", "n1", &ctx).await.expect("get"), None);
    }

    #[tokio::test]
    async fn test_load_more_follows_cursor() {
        let (layer, _) = layer();
        let ctx = CallContext::new();
        let items: Vec<Item> = (1..=5)
            .map(|i| Item::new(format!("b{}", i), i * 10, "dj", "ready").with_field("slot", json!(i)))
            .collect();
        layer.batch_write("blocks", items, &ctx).await.expect("seed");

        let first = layer
            .query("blocks", &Predicates::new(), &Pagination::page_size(3), &ctx)
            .await
            .expect("first page");
        assert!(first.has_more);
        let second = layer
            .load_more("blocks", &Predicates::new(), &first, Some(3), &ctx)
            .await
            .expect("second page");
        assert_eq!(second.count, 2);
        assert!(!second.has_more);
        let done = layer
            .load_more("blocks", &Predicates::new(), &second, Some(3), &ctx)
            .await
            .expect("past the end");
        assert!(done.is_empty());
    }

    #[tokio::test]
    async fn test_invalidation_event_drops_collection_only() {
        let (layer, _) = layer();
        let ctx = CallContext::new();
        layer.query("news", &Predicates::new(), &Pagination::new(), &ctx).await.expect("query");
        layer.query("blocks", &Predicates::new(), &Pagination::new(), &ctx).await.expect("query");
        let removed = layer.apply_invalidation(&InvalidationEvent::collection_changed("news"));
        assert_eq!(removed, 1);
        assert!(layer.is_cached("blocks", &Predicates::new(), &Pagination::new()).expect("valid"));
    }

    #[tokio::test]
    async fn test_bypass_read_leaves_cache_untouched() {
        let (layer, _) = layer();
        let ctx = CallContext::new();
        let (predicates, pagination) = (Predicates::new(), Pagination::new());

        layer
            .query_with("news", &predicates, &pagination, ReadMode::Bypass, &ctx)
            .await
            .expect("bypass");
        assert!(!layer.is_cached("news", &predicates, &pagination).expect("valid"));

        layer.query("news", &predicates, &pagination, &ctx).await.expect("fill");
        layer
            .query_with("news", &predicates, &pagination, ReadMode::Bypass, &ctx)
            .await
            .expect("bypass");
        assert_eq!(layer.backend().call_counts().scans, 3);
        let snapshot = layer.metrics_snapshot();
        assert_eq!(snapshot.cache_hits, 0);
        assert_eq!(snapshot.cache_misses, 1);
    }

    #[tokio::test]
    async fn test_refresh_read_skips_fresh_entry_and_refills() {
        let (layer, clock) = layer();
        let ctx = CallContext::new();
        let (predicates, pagination) = (Predicates::new(), Pagination::new());
        layer.query("news", &predicates, &pagination, &ctx).await.expect("fill");

        layer
            .backend()
            .seed("onair-news", vec![Item::new("late", clock.now_millis(), "bob", "active")])
            .await;
        let refreshed = layer
            .query_with("news", &predicates, &pagination, ReadMode::Refresh, &ctx)
            .await
            .expect("refresh");
        assert_eq!(refreshed.count, 1);

        let cached = layer.query("news", &predicates, &pagination, &ctx).await.expect("hit");
        assert_eq!(cached.count, 1);
        assert_eq!(layer.backend().call_counts().scans, 2);
    }

    #[test]
    #[should_panic]
    fn test_subscribe_requires_runtime() {
        let (layer, _) = layer();
        let source = BroadcastInvalidationSource::new(4);
        let _subscription = layer.subscribe(&source);
    }
}
