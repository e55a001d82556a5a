//! Backing store abstraction.
//!
//! A [`StoreBackend`] speaks the store's native operations: point get, index
//! query, scan, conditional put, delete and the two batch calls. It knows
//! nothing about caching, strategies or retries.

use async_trait::async_trait;
use onair_core::{EpochMillis, Item, ItemKey, OnAirResult, Page};

use crate::strategy::{GetRequest, IndexQueryRequest, ScanRequest};

/// Condition attached to a put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutCondition {
    /// Succeed only when no item with the same id exists.
    NotExists,
    /// Succeed only when the stored item's `updatedAt` equals this value.
    UpdatedAtEquals(EpochMillis),
}

impl PutCondition {
    pub fn from_expected(expected: Option<EpochMillis>) -> Self {
        match expected {
            Some(at) => PutCondition::UpdatedAtEquals(at),
            None => PutCondition::NotExists,
        }
    }

    pub fn expected(self) -> Option<EpochMillis> {
        match self {
            PutCondition::NotExists => None,
            PutCondition::UpdatedAtEquals(at) => Some(at),
        }
    }
}

/// A store response plus the capacity it reported, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreOutput<T> {
    pub value: T,
    /// Capacity units the store says the call consumed.
    pub consumed_units: Option<f64>,
}

impl<T> StoreOutput<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            consumed_units: None,
        }
    }

    pub fn with_consumed(mut self, units: f64) -> Self {
        self.consumed_units = Some(units);
        self
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StoreOutput<U> {
        StoreOutput {
            value: f(self.value),
            consumed_units: self.consumed_units,
        }
    }

    /// Reported consumption, or `estimate` when the store reported none.
    pub fn units_or(&self, estimate: f64) -> f64 {
        self.consumed_units.unwrap_or(estimate)
    }
}

/// Outcome of one batch-write request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchWriteOutput {
    /// Items the store committed, with their assigned `updatedAt`.
    pub written: Vec<Item>,
    /// Items the store declined to process this time.
    pub unprocessed: Vec<Item>,
}

/// Native operations of a key-value document store with secondary indexes.
///
/// Implementations must be thread-safe. Table names are physical names.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Read one item by id. Items failing the request's filters read as absent.
    async fn get_item(&self, request: &GetRequest) -> OnAirResult<StoreOutput<Option<Item>>>;

    /// Query one partition of a secondary index.
    ///
    /// Fails with `IndexUnavailable` when the index does not exist.
    async fn query_index(&self, request: &IndexQueryRequest) -> OnAirResult<StoreOutput<Page>>;

    /// Scan a table, newest-first, applying filters.
    async fn scan(&self, request: &ScanRequest) -> OnAirResult<StoreOutput<Page>>;

    /// Write an item if `condition` holds, assigning a fresh `updatedAt`.
    ///
    /// Fails with `ConcurrentModification` when the condition does not hold.
    async fn put_item(
        &self,
        table: &str,
        item: &Item,
        condition: PutCondition,
    ) -> OnAirResult<StoreOutput<Item>>;

    /// Delete an item. Deleting an absent item succeeds.
    async fn delete_item(&self, table: &str, key: &ItemKey) -> OnAirResult<StoreOutput<()>>;

    /// Read many items by key in one request. Absent keys are skipped.
    async fn batch_get(&self, table: &str, keys: &[ItemKey]) -> OnAirResult<StoreOutput<Vec<Item>>>;

    /// Write many items unconditionally in one request.
    async fn batch_write(&self, table: &str, items: &[Item]) -> OnAirResult<StoreOutput<BatchWriteOutput>>;
}
