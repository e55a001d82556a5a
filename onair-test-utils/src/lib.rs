//! OnAir Test Utilities
//!
//! Shared test infrastructure for the OnAir workspace:
//! - A fault-injecting store wrapper
//! - Proptest generators for items, predicates and pagination
//! - Fixtures for layers wired to a manual clock
//! - Assertions for the error taxonomy

pub use onair_core::{
    CollectionRegistry, CollectionSpec, Cursor, EpochMillis, Item, ItemKey, LayerConfig,
    ManualClock, OnAirError, OnAirResult, Page, Pagination, Predicates, StoreError,
    ValidationError, WriteIntent, OWNER_INDEX,
};
pub use onair_storage::{
    CachedQueryLayer, CallContext, CancellationToken, InMemoryStore, RetrievalStrategy,
    StoreBackend,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use onair_storage::{
    BatchWriteOutput, GetRequest, IndexQueryRequest, PutCondition, ScanRequest, StoreOutput,
};
use parking_lot::Mutex;

/// Install a `tracing` subscriber honoring `RUST_LOG`. Safe to call from
/// every test; only the first call installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// MOCK STORE
// ============================================================================

/// Wraps a backend and misbehaves on demand.
///
/// Faults are keyed by item id for batch writes, so a test can make exactly
/// one chunk fail. Latency applies to every call and lets cancellation tests
/// catch a call in flight.
pub struct FaultInjectingStore<B: StoreBackend = InMemoryStore> {
    inner: Arc<B>,
    latency: Mutex<Option<Duration>>,
    failing_ids: Mutex<HashMap<String, u32>>,
    unprocessed_ids: Mutex<HashMap<String, u32>>,
    outage_calls: AtomicU64,
    batch_write_calls: AtomicU64,
}

impl<B: StoreBackend> FaultInjectingStore<B> {
    pub fn new(inner: Arc<B>) -> Self {
        Self {
            inner,
            latency: Mutex::new(None),
            failing_ids: Mutex::new(HashMap::new()),
            unprocessed_ids: Mutex::new(HashMap::new()),
            outage_calls: AtomicU64::new(0),
            batch_write_calls: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Fail the next `times` batch-write requests that contain `id`.
    /// `u32::MAX` fails them forever.
    pub fn fail_batches_containing(&self, id: impl Into<String>, times: u32) {
        self.failing_ids.lock().insert(id.into(), times);
    }

    /// Report `id` as unprocessed the next `times` it is batch-written.
    pub fn leave_unprocessed(&self, id: impl Into<String>, times: u32) {
        self.unprocessed_ids.lock().insert(id.into(), times);
    }

    /// Fail the next `calls` calls of any kind with `StoreUnavailable`.
    pub fn fail_next_calls(&self, calls: u64) {
        self.outage_calls.store(calls, Ordering::SeqCst);
    }

    pub fn batch_write_calls(&self) -> u64 {
        self.batch_write_calls.load(Ordering::SeqCst)
    }

    async fn before_call(&self) -> OnAirResult<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let outage = self
            .outage_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if outage {
            return Err(OnAirError::unavailable("injected outage"));
        }
        Ok(())
    }

    /// Consume one charge from `faults` if `item` carries one.
    fn take_fault(faults: &Mutex<HashMap<String, u32>>, item: &Item) -> bool {
        let mut faults = faults.lock();
        match faults.get_mut(&item.id) {
            Some(0) | None => false,
            Some(remaining) => {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                true
            }
        }
    }
}

#[async_trait]
impl<B: StoreBackend> StoreBackend for FaultInjectingStore<B> {
    async fn get_item(&self, request: &GetRequest) -> OnAirResult<StoreOutput<Option<Item>>> {
        self.before_call().await?;
        self.inner.get_item(request).await
    }

    async fn query_index(&self, request: &IndexQueryRequest) -> OnAirResult<StoreOutput<Page>> {
        self.before_call().await?;
        self.inner.query_index(request).await
    }

    async fn scan(&self, request: &ScanRequest) -> OnAirResult<StoreOutput<Page>> {
        self.before_call().await?;
        self.inner.scan(request).await
    }

    async fn put_item(
        &self,
        table: &str,
        item: &Item,
        condition: PutCondition,
    ) -> OnAirResult<StoreOutput<Item>> {
        self.before_call().await?;
        self.inner.put_item(table, item, condition).await
    }

    async fn delete_item(&self, table: &str, key: &ItemKey) -> OnAirResult<StoreOutput<()>> {
        self.before_call().await?;
        self.inner.delete_item(table, key).await
    }

    async fn batch_get(&self, table: &str, keys: &[ItemKey]) -> OnAirResult<StoreOutput<Vec<Item>>> {
        self.before_call().await?;
        self.inner.batch_get(table, keys).await
    }

    async fn batch_write(&self, table: &str, items: &[Item]) -> OnAirResult<StoreOutput<BatchWriteOutput>> {
        self.batch_write_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;

        let poisoned = items
            .iter()
            .filter(|item| Self::take_fault(&self.failing_ids, item))
            .count();
        if poisoned > 0 {
            return Err(OnAirError::unavailable("injected chunk failure"));
        }

        let (held_back, to_write): (Vec<Item>, Vec<Item>) = items
            .iter()
            .cloned()
            .partition(|item| Self::take_fault(&self.unprocessed_ids, item));
        let mut output = self.inner.batch_write(table, &to_write).await?;
        output.value.unprocessed.extend(held_back);
        Ok(output)
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for OnAir query and item types.

    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    /// One of the station collections.
    pub fn arb_collection() -> impl Strategy<Value = &'static str> {
        prop::sample::select(vec!["news", "animations", "blocks", "conductors", "habillage"])
    }

    pub fn arb_status() -> impl Strategy<Value = String> {
        prop::sample::select(vec!["draft", "active", "scheduled", "archived"]).prop_map(String::from)
    }

    pub fn arb_owner() -> impl Strategy<Value = String> {
        prop::sample::select(vec!["alice", "bob", "carol"]).prop_map(String::from)
    }

    pub fn arb_category() -> impl Strategy<Value = String> {
        prop::sample::select(vec!["sport", "culture", "local", "weather"]).prop_map(String::from)
    }

    /// An item with a small id space so generated sets collide sometimes.
    pub fn arb_item() -> impl Strategy<Value = Item> {
        (
            "[a-z]{1,3}[0-9]{0,2}",
            1i64..1_000_000,
            arb_owner(),
            arb_status(),
            proptest::option::of(arb_category()),
        )
            .prop_map(|(id, created_at, owner, status, category)| {
                let item = Item::new(id, created_at, owner, status);
                match category {
                    Some(c) => item.with_field("category", json!(c)),
                    None => item,
                }
            })
    }

    /// Items with distinct ids.
    pub fn arb_items(max: usize) -> impl Strategy<Value = Vec<Item>> {
        prop::collection::vec(arb_item(), 0..max).prop_map(|items| {
            let mut seen = std::collections::HashSet::new();
            items
                .into_iter()
                .filter(|item| seen.insert(item.id.clone()))
                .collect()
        })
    }

    pub fn arb_predicates() -> impl Strategy<Value = Predicates> {
        (
            proptest::option::of("[a-z]{1,3}"),
            proptest::option::of(arb_owner()),
            proptest::option::of(arb_status()),
            proptest::option::of(arb_category()),
            proptest::option::of((
                proptest::option::of(0i64..500_000),
                proptest::option::of(500_000i64..1_000_000),
            )),
        )
            .prop_map(|(id, owner_id, status, category, range)| Predicates {
                id,
                owner_id,
                status,
                category,
                created_range: range.map(|(from, to)| onair_core::CreatedRange { from, to }),
            })
    }

    /// Pagination with a valid or absent page size and no cursor.
    pub fn arb_pagination() -> impl Strategy<Value = Pagination> {
        proptest::option::of(1i64..150).prop_map(|page_size| Pagination {
            page_size,
            cursor: None,
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built layers and items for common scenarios.

    use super::*;
    use serde_json::json;

    /// Start time of every fixture clock.
    pub const T0: EpochMillis = 1_700_000_000_000;

    /// A layer over `backend`, driven by `clock`.
    pub fn layer_over<B: StoreBackend>(
        backend: B,
        config: LayerConfig,
        clock: &ManualClock,
    ) -> OnAirResult<CachedQueryLayer<B>> {
        CachedQueryLayer::builder(Arc::new(backend))
            .with_config(config)
            .with_clock(Arc::new(clock.clone()))
            .with_caller("tester")
            .build()
    }

    /// A layer over a fresh in-memory store, both driven by one manual clock.
    pub fn layer_with_config(
        config: LayerConfig,
    ) -> OnAirResult<(CachedQueryLayer<InMemoryStore>, ManualClock)> {
        let clock = ManualClock::new(T0);
        let store = InMemoryStore::new(Arc::new(clock.clone()));
        Ok((layer_over(store, config, &clock)?, clock))
    }

    pub fn station_layer() -> OnAirResult<(CachedQueryLayer<InMemoryStore>, ManualClock)> {
        layer_with_config(LayerConfig::default())
    }

    /// A layer over a fault-injecting wrapper around an in-memory store.
    pub fn faulty_layer(
        config: LayerConfig,
    ) -> OnAirResult<(CachedQueryLayer<FaultInjectingStore>, ManualClock)> {
        let clock = ManualClock::new(T0);
        let store = InMemoryStore::new(Arc::new(clock.clone()));
        let faulty = FaultInjectingStore::new(Arc::new(store));
        Ok((layer_over(faulty, config, &clock)?, clock))
    }

    /// A news item with a title.
    pub fn news_item(id: &str, created_at: EpochMillis, owner: &str, status: &str) -> Item {
        Item::new(id, created_at, owner, status).with_field("title", json!(format!("News {}", id)))
    }

    /// A programme block with a slot time and duration.
    pub fn block_item(id: &str, created_at: EpochMillis, owner: &str) -> Item {
        Item::new(id, created_at, owner, "scheduled")
            .with_field("startTime", json!("08:00"))
            .with_field("durationMinutes", json!(30))
    }

    /// `count` news items owned by `owner`, one second apart from `T0`.
    pub fn news_batch(count: usize, owner: &str) -> Vec<Item> {
        (0..count)
            .map(|i| news_item(&format!("n{:03}", i), T0 + (i as i64) * 1_000, owner, "active"))
            .collect()
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for the OnAir error taxonomy and result ordering.

    use super::*;

    #[track_caller]
    pub fn assert_concurrent_modification<T: std::fmt::Debug>(result: &OnAirResult<T>) {
        match result {
            Err(OnAirError::Store(StoreError::ConcurrentModification { .. })) => {}
            other => panic!("Expected ConcurrentModification, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_invalid_argument<T: std::fmt::Debug>(result: &OnAirResult<T>) {
        match result {
            Err(OnAirError::Validation(ValidationError::InvalidArgument { .. })) => {}
            other => panic!("Expected InvalidArgument, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_cancelled<T: std::fmt::Debug>(result: &OnAirResult<T>) {
        match result {
            Err(err) if err.is_cancellation() => {}
            other => panic!("Expected cancellation, got: {:?}", other),
        }
    }

    /// Unpack a `PartialBatchFailure`, panicking on anything else.
    #[track_caller]
    pub fn expect_partial_failure<T: std::fmt::Debug>(result: OnAirResult<T>) -> (Vec<Item>, Vec<String>) {
        match result {
            Err(OnAirError::Store(StoreError::PartialBatchFailure {
                succeeded,
                failed_ids,
            })) => (succeeded, failed_ids),
            other => panic!("Expected PartialBatchFailure, got: {:?}", other),
        }
    }

    /// Items are ordered newest-first by `createdAt`.
    #[track_caller]
    pub fn assert_newest_first(items: &[Item]) {
        for pair in items.windows(2) {
            assert!(
                pair[0].created_at >= pair[1].created_at,
                "Items out of order: {} ({}) before {} ({})",
                pair[0].id,
                pair[0].created_at,
                pair[1].id,
                pair[1].created_at
            );
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_news_batch_fixture() {
        let items = fixtures::news_batch(3, "alice");
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|i| i.owner_id == "alice"));
        assert!(items[0].created_at < items[2].created_at);
    }

    #[tokio::test]
    async fn test_fault_store_fails_marked_chunks_then_recovers() {
        let store = FaultInjectingStore::new(Arc::new(InMemoryStore::default()));
        store.fail_batches_containing("b", 1);
        let items = vec![Item::new("a", 1, "o", "s"), Item::new("b", 1, "o", "s")];
        assert!(store.batch_write("t", &items).await.is_err());
        let out = store.batch_write("t", &items).await.expect("second attempt");
        assert_eq!(out.value.written.len(), 2);
        assert_eq!(store.batch_write_calls(), 2);
    }

    #[tokio::test]
    async fn test_fault_store_reports_unprocessed() {
        let store = FaultInjectingStore::new(Arc::new(InMemoryStore::default()));
        store.leave_unprocessed("a", 1);
        let items = vec![Item::new("a", 1, "o", "s"), Item::new("b", 1, "o", "s")];
        let out = store.batch_write("t", &items).await.expect("batch write");
        assert_eq!(out.value.written.len(), 1);
        assert_eq!(out.value.unprocessed.len(), 1);
        assert_eq!(out.value.unprocessed[0].id, "a");
    }

    #[tokio::test]
    async fn test_fault_store_outage() {
        let store = FaultInjectingStore::new(Arc::new(InMemoryStore::default()));
        store.fail_next_calls(1);
        let key = ItemKey::new("a", 1);
        assert!(store.delete_item("t", &key).await.is_err());
        assert!(store.delete_item("t", &key).await.is_ok());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_arb_items_have_distinct_ids(items in generators::arb_items(20)) {
            let ids: std::collections::HashSet<_> = items.iter().map(|i| &i.id).collect();
            prop_assert_eq!(ids.len(), items.len());
        }

        #[test]
        fn prop_arb_pagination_is_valid(pagination in generators::arb_pagination()) {
            prop_assert!(pagination.page_size.map_or(true, |s| s > 0));
        }
    }
}
