//! Store client: executes plans against a backend.
//!
//! Owns everything between a [`QueryPlan`] and the wire: index fallback,
//! batch chunking, chunk retries with exponential backoff, cancellation and
//! capacity accounting. Cancelled calls record no metrics.

use std::collections::HashSet;
use std::sync::Arc;

use onair_core::{
    BatchSettings, Item, ItemKey, OnAirError, OnAirResult, Page, StoreError, WriteIntent,
};

use super::backend::{PutCondition, StoreBackend};
use super::context::CallContext;
use crate::metrics::MetricsCollector;
use crate::strategy::{GetRequest, QueryPlan, QueryStrategySelector, RequestParams, RetrievalStrategy};

/// Write units assumed for a put or delete when the store reports none.
const SINGLE_WRITE_UNITS: f64 = 1.0;

/// Read units assumed per key of a batch get when the store reports none.
const BATCH_READ_UNITS_PER_KEY: f64 = 0.5;

/// Write units assumed per item of a batch write when the store reports none.
const BATCH_WRITE_UNITS_PER_ITEM: f64 = 1.0;

/// Backend adapter shared by every layer operation.
pub struct StoreClient<B: StoreBackend> {
    backend: Arc<B>,
    selector: QueryStrategySelector,
    metrics: Arc<MetricsCollector>,
    batch: BatchSettings,
}

impl<B: StoreBackend> StoreClient<B> {
    pub fn new(
        backend: Arc<B>,
        selector: QueryStrategySelector,
        metrics: Arc<MetricsCollector>,
        batch: BatchSettings,
    ) -> Self {
        Self {
            backend,
            selector,
            metrics,
            batch,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn selector(&self) -> &QueryStrategySelector {
        &self.selector
    }

    fn table(&self, collection: &str) -> OnAirResult<String> {
        Ok(self.selector.registry().resolve(collection)?.table.clone())
    }

    /// Run a plan, falling back to a scan once if the store reports the
    /// plan's index missing.
    pub async fn execute(&self, plan: &QueryPlan, ctx: &CallContext) -> OnAirResult<Page> {
        match self.execute_once(plan, ctx).await {
            Err(err) if err.is_index_unavailable() => {
                let Some(fallback) = self.selector.fallback_for(plan) else {
                    return Err(err);
                };
                tracing::warn!(
                    collection = %plan.collection,
                    error = %err,
                    fallback = %fallback.strategy,
                    "Index unavailable, falling back to scan"
                );
                self.metrics.record_index_fallback();
                self.execute_once(&fallback, ctx).await
            }
            other => other,
        }
    }

    async fn execute_once(&self, plan: &QueryPlan, ctx: &CallContext) -> OnAirResult<Page> {
        let output = match &plan.params {
            RequestParams::Get(request) => ctx
                .run(self.backend.get_item(request))
                .await?
                .map(|item| Page::new(item.into_iter().collect(), None)),
            RequestParams::IndexQuery(request) => ctx.run(self.backend.query_index(request)).await?,
            RequestParams::Scan(request) => ctx.run(self.backend.scan(request)).await?,
        };
        self.metrics.record_strategy(plan.strategy);
        self.metrics
            .record_read_cost(output.units_or(plan.strategy.estimated_read_units()));
        tracing::debug!(
            collection = %plan.collection,
            strategy = %plan.strategy,
            count = output.value.count,
            has_more = output.value.has_more,
            "Store query completed"
        );
        Ok(output.value)
    }

    /// Point read by id.
    pub async fn get(&self, collection: &str, id: &str, ctx: &CallContext) -> OnAirResult<Option<Item>> {
        let request = GetRequest {
            table: self.table(collection)?,
            id: id.to_string(),
            filters: Vec::new(),
        };
        let output = ctx.run(self.backend.get_item(&request)).await?;
        let strategy = RetrievalStrategy::DirectKeyGet;
        self.metrics.record_strategy(strategy);
        self.metrics
            .record_read_cost(output.units_or(strategy.estimated_read_units()));
        Ok(output.value)
    }

    /// Conditional put. A lost race surfaces as `ConcurrentModification`
    /// naming the logical collection.
    pub async fn conditional_put(
        &self,
        collection: &str,
        intent: &WriteIntent,
        ctx: &CallContext,
    ) -> OnAirResult<Item> {
        let table = self.table(collection)?;
        let condition = PutCondition::from_expected(intent.expected_updated_at);
        match ctx.run(self.backend.put_item(&table, &intent.item, condition)).await {
            Ok(output) => {
                self.metrics
                    .record_write_cost(output.units_or(SINGLE_WRITE_UNITS));
                Ok(output.value)
            }
            Err(OnAirError::Store(StoreError::ConcurrentModification {
                id,
                expected,
                actual,
                ..
            })) => {
                self.metrics.record_write_cost(SINGLE_WRITE_UNITS);
                tracing::debug!(
                    collection,
                    id = %id,
                    ?expected,
                    ?actual,
                    "Conditional put rejected"
                );
                Err(StoreError::ConcurrentModification {
                    collection: collection.to_string(),
                    id,
                    expected,
                    actual,
                }
                .into())
            }
            Err(err) => Err(err),
        }
    }

    /// Delete by primary key. Absent items are not an error.
    pub async fn delete(&self, collection: &str, key: &ItemKey, ctx: &CallContext) -> OnAirResult<()> {
        let table = self.table(collection)?;
        let output = ctx.run(self.backend.delete_item(&table, key)).await?;
        self.metrics
            .record_write_cost(output.units_or(SINGLE_WRITE_UNITS));
        Ok(())
    }

    /// Read many items, split into store-sized chunks. Absent keys are
    /// skipped; order follows chunk order.
    pub async fn batch_get(
        &self,
        collection: &str,
        keys: &[ItemKey],
        ctx: &CallContext,
    ) -> OnAirResult<Vec<Item>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let table = self.table(collection)?;
        let mut items = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(self.batch.get_limit.max(1)) {
            let output = ctx.run(self.backend.batch_get(&table, chunk)).await?;
            self.metrics.record_batch_chunk();
            self.metrics
                .record_read_cost(output.units_or(BATCH_READ_UNITS_PER_KEY * chunk.len() as f64));
            items.extend(output.value);
        }
        Ok(items)
    }

    /// Write many items, split into store-sized chunks.
    ///
    /// A chunk that fails, or that the store only partly processes, is
    /// retried with exponential backoff up to the configured attempt count.
    /// Items still pending after that are reported in `PartialBatchFailure`
    /// alongside everything that was committed. Cancellation after some
    /// chunks committed is reported the same way, with every uncommitted id
    /// listed as failed; with nothing committed it surfaces unchanged.
    pub async fn batch_write(
        &self,
        collection: &str,
        items: &[Item],
        ctx: &CallContext,
    ) -> OnAirResult<Vec<Item>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let table = self.table(collection)?;
        let mut written = Vec::with_capacity(items.len());
        let mut failed_ids = Vec::new();

        for (chunk_index, chunk) in items.chunks(self.batch.write_limit.max(1)).enumerate() {
            let mut pending = chunk.to_vec();
            let mut attempt = 1u32;
            loop {
                match ctx.run(self.backend.batch_write(&table, &pending)).await {
                    Ok(output) => {
                        self.metrics.record_batch_chunk();
                        self.metrics.record_write_cost(
                            output.units_or(BATCH_WRITE_UNITS_PER_ITEM * pending.len() as f64),
                        );
                        written.extend(output.value.written);
                        pending = output.value.unprocessed;
                    }
                    Err(err) if err.is_cancellation() => {
                        return Err(interrupted(collection, err, items, written));
                    }
                    Err(err) => {
                        self.metrics.record_batch_chunk();
                        tracing::warn!(
                            collection,
                            chunk = chunk_index,
                            attempt,
                            error = %err,
                            "Batch write chunk failed"
                        );
                    }
                }

                if pending.is_empty() {
                    break;
                }
                if attempt >= self.batch.max_attempts {
                    tracing::error!(
                        collection,
                        chunk = chunk_index,
                        pending = pending.len(),
                        "Batch write chunk exhausted its retries"
                    );
                    failed_ids.extend(pending.iter().map(|item| item.id.clone()));
                    break;
                }
                if let Err(err) = ctx.sleep(self.batch.backoff_for(attempt)).await {
                    return Err(interrupted(collection, err, items, written));
                }
                self.metrics.record_batch_retry();
                attempt += 1;
            }
        }

        if failed_ids.is_empty() {
            Ok(written)
        } else {
            Err(StoreError::PartialBatchFailure {
                succeeded: written,
                failed_ids,
            }
            .into())
        }
    }
}

/// Outcome of a batch write cut short by cancellation or the deadline.
fn interrupted(collection: &str, err: OnAirError, items: &[Item], written: Vec<Item>) -> OnAirError {
    if written.is_empty() {
        return err;
    }
    let committed: HashSet<&str> = written.iter().map(|item| item.id.as_str()).collect();
    let failed_ids: Vec<String> = items
        .iter()
        .filter(|item| !committed.contains(item.id.as_str()))
        .map(|item| item.id.clone())
        .collect();
    tracing::warn!(
        collection,
        committed = written.len(),
        uncommitted = failed_ids.len(),
        error = %err,
        "Batch write interrupted"
    );
    StoreError::PartialBatchFailure {
        succeeded: written,
        failed_ids,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use onair_core::{
        CollectionRegistry, ManualClock, Pagination, PaginationSettings, Predicates, OWNER_INDEX,
    };

    fn client(store: InMemoryStore) -> (StoreClient<InMemoryStore>, Arc<MetricsCollector>) {
        let metrics = Arc::new(MetricsCollector::new());
        let selector = QueryStrategySelector::new(
            Arc::new(CollectionRegistry::station_defaults()),
            PaginationSettings::default(),
        );
        let client = StoreClient::new(
            Arc::new(store),
            selector,
            metrics.clone(),
            BatchSettings::default(),
        );
        (client, metrics)
    }

    fn clock_store() -> InMemoryStore {
        InMemoryStore::new(Arc::new(ManualClock::new(1_000)))
    }

    #[tokio::test]
    async fn test_execute_records_strategy_and_cost() {
        let (client, metrics) = client(clock_store().without_capacity_reporting());
        client
            .backend()
            .seed("onair-news", vec![Item::new("a", 1, "alice", "active")])
            .await;
        let plan = client
            .selector()
            .select("news", &Predicates::new().with_status("active"), &Pagination::new())
            .expect("plan");
        let page = client.execute(&plan, &CallContext::new()).await.expect("execute");
        assert_eq!(page.count, 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.strategy_count(RetrievalStrategy::ByStatusFilteredScan), 1);
        assert_eq!(snapshot.read_capacity_units, 4.0);
    }

    #[tokio::test]
    async fn test_missing_index_falls_back_to_scan() {
        let (client, metrics) = client(clock_store());
        client.backend().drop_index("onair-news", OWNER_INDEX);
        client
            .backend()
            .seed(
                "onair-news",
                vec![Item::new("a", 1, "alice", "active"), Item::new("b", 2, "bob", "active")],
            )
            .await;
        let plan = client
            .selector()
            .select("news", &Predicates::new().with_owner("alice"), &Pagination::new())
            .expect("plan");
        assert_eq!(plan.strategy, RetrievalStrategy::ByOwnerIndex);

        let page = client.execute(&plan, &CallContext::new()).await.expect("fallback");
        assert_eq!(page.count, 1);
        assert_eq!(page.items[0].owner_id, "alice");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.index_fallbacks, 1);
        assert_eq!(snapshot.strategy_count(RetrievalStrategy::UnfilteredPaginatedScan), 1);
        assert_eq!(snapshot.strategy_count(RetrievalStrategy::ByOwnerIndex), 0);
        assert_eq!(client.backend().call_counts().index_queries, 1);
        assert_eq!(client.backend().call_counts().scans, 1);
    }

    #[tokio::test]
    async fn test_conflict_names_logical_collection() {
        let (client, _) = client(clock_store());
        let intent = WriteIntent::create(Item::new("x", 1, "alice", "draft"));
        let ctx = CallContext::new();
        client.conditional_put("news", &intent, &ctx).await.expect("create");
        let err = client.conditional_put("news", &intent, &ctx).await.unwrap_err();
        assert!(matches!(
            err,
            OnAirError::Store(StoreError::ConcurrentModification { ref collection, .. }) if collection == "news"
        ));
    }

    #[tokio::test]
    async fn test_batch_write_chunks() {
        let (client, metrics) = client(clock_store());
        let items: Vec<Item> = (0..57)
            .map(|i| Item::new(format!("i{:02}", i), 1, "alice", "draft"))
            .collect();
        let written = client
            .batch_write("news", &items, &CallContext::new())
            .await
            .expect("batch write");
        assert_eq!(written.len(), 57);
        assert_eq!(client.backend().call_counts().batch_writes, 3);
        assert_eq!(metrics.snapshot().batch_chunks, 3);
        assert_eq!(metrics.snapshot().batch_retries, 0);
    }

    #[tokio::test]
    async fn test_batch_get_chunks_and_skips_absent() {
        let (client, _) = client(clock_store());
        client
            .backend()
            .seed("onair-news", (0..150).map(|i| Item::new(format!("i{}", i), 1, "a", "x")))
            .await;
        let mut keys: Vec<ItemKey> = (0..150).map(|i| ItemKey::new(format!("i{}", i), 1)).collect();
        keys.push(ItemKey::new("absent", 1));
        let items = client
            .batch_get("news", &keys, &CallContext::new())
            .await
            .expect("batch get");
        assert_eq!(items.len(), 150);
        assert_eq!(client.backend().call_counts().batch_gets, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_store_exhausts_retries() {
        let (client, metrics) = client(clock_store());
        client.backend().set_available(false);
        let items = vec![Item::new("a", 1, "o", "s"), Item::new("b", 1, "o", "s")];
        let err = client
            .batch_write("news", &items, &CallContext::new())
            .await
            .unwrap_err();
        match err {
            OnAirError::Store(StoreError::PartialBatchFailure { succeeded, failed_ids }) => {
                assert!(succeeded.is_empty());
                assert_eq!(failed_ids, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(client.backend().call_counts().batch_writes, 3);
        assert_eq!(metrics.snapshot().batch_retries, 2);
    }

    #[tokio::test]
    async fn test_cancelled_call_records_nothing() {
        let (client, metrics) = client(clock_store());
        let ctx = CallContext::new();
        ctx.token().cancel();
        let plan = client
            .selector()
            .select("news", &Predicates::new(), &Pagination::new())
            .expect("plan");
        let err = client.execute(&plan, &ctx).await.unwrap_err();
        assert!(err.is_cancellation());
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.store_calls, 0);
        assert_eq!(snapshot.strategy_count(RetrievalStrategy::UnfilteredPaginatedScan), 0);
        assert_eq!(client.backend().call_counts().total(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_batch_write_counts_no_chunk() {
        let (client, metrics) = client(clock_store());
        let ctx = CallContext::new();
        ctx.token().cancel();
        let items = vec![Item::new("a", 1, "o", "s"), Item::new("b", 1, "o", "s")];
        let err = client.batch_write("news", &items, &ctx).await.unwrap_err();
        assert!(matches!(err, OnAirError::Store(StoreError::Cancelled)));
        assert_eq!(metrics.snapshot().batch_chunks, 0);
        assert_eq!(metrics.snapshot().batch_retries, 0);
        assert_eq!(client.backend().call_counts().batch_writes, 0);
    }
}
