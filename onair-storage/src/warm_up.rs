//! Cache warm-up and refresh.
//!
//! At start-up the station console loads the pages every screen needs
//! before the first user interaction. The queries run concurrently and a
//! failing query never stops the others; only cancellation aborts the batch.

use futures_util::future::join_all;
use onair_core::{OnAirResult, Page, Pagination, Predicates};

use crate::layer::{CachedQueryLayer, ReadMode};
use crate::store::{CallContext, StoreBackend};

/// Page size used by [`CachedQueryLayer::refresh_collection`].
pub const REFRESH_PAGE_SIZE: i64 = 50;

/// One query to run during warm-up.
#[derive(Debug, Clone, PartialEq)]
pub struct WarmUpQuery {
    pub collection: String,
    pub predicates: Predicates,
    pub pagination: Pagination,
}

impl WarmUpQuery {
    pub fn new(collection: impl Into<String>, predicates: Predicates, pagination: Pagination) -> Self {
        Self {
            collection: collection.into(),
            predicates,
            pagination,
        }
    }

    /// The pages the console opens on: 20 active news items, 20 animations
    /// and 10 blocks.
    pub fn station_essentials() -> Vec<WarmUpQuery> {
        vec![
            WarmUpQuery::new(
                "news",
                Predicates::new().with_status("active"),
                Pagination::page_size(20),
            ),
            WarmUpQuery::new("animations", Predicates::new(), Pagination::page_size(20)),
            WarmUpQuery::new("blocks", Predicates::new(), Pagination::page_size(10)),
        ]
    }
}

/// Outcome of [`CachedQueryLayer::warm_up`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmUpReport {
    /// Collection and item count of every page that loaded.
    pub loaded: Vec<(String, usize)>,
    /// Collections whose query failed.
    pub failed: Vec<String>,
}

impl WarmUpReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn items_loaded(&self) -> usize {
        self.loaded.iter().map(|(_, count)| count).sum()
    }
}

impl<B: StoreBackend> CachedQueryLayer<B> {
    /// Fetch `queries` concurrently and cache every page that comes back.
    ///
    /// Pages already cached are fetched again. Failures are logged and listed
    /// in the report. Cancellation or an expired deadline fails the call.
    pub async fn warm_up(&self, queries: &[WarmUpQuery], ctx: &CallContext) -> OnAirResult<WarmUpReport> {
        let results = join_all(queries.iter().map(|query| {
            self.query_with(
                &query.collection,
                &query.predicates,
                &query.pagination,
                ReadMode::Refresh,
                ctx,
            )
        }))
        .await;

        let mut report = WarmUpReport::default();
        for (query, result) in queries.iter().zip(results) {
            match result {
                Ok(page) => report.loaded.push((query.collection.clone(), page.count)),
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => {
                    tracing::warn!(collection = %query.collection, error = %err, "Warm-up query failed");
                    report.failed.push(query.collection.clone());
                }
            }
        }

        tracing::info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            items = report.items_loaded(),
            "Cache warm-up finished"
        );
        Ok(report)
    }

    /// Re-read the first [`REFRESH_PAGE_SIZE`] active items of `collection`
    /// from the store and replace the cached page.
    ///
    /// On failure the cache keeps whatever it held before.
    pub async fn refresh_collection(&self, collection: &str, ctx: &CallContext) -> OnAirResult<Page> {
        self.query_with(
            collection,
            &Predicates::new().with_status("active"),
            &Pagination::page_size(REFRESH_PAGE_SIZE),
            ReadMode::Refresh,
            ctx,
        )
        .await
    }
}
