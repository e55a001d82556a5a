//! In-memory store backend.
//!
//! Emulates the station's document store closely enough to exercise every
//! strategy: newest-first ordering, cursors, filters, secondary-index
//! availability, conditional puts, batch limits and reported capacity.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use onair_core::{
    Cursor, EpochMillis, FilterCondition, Item, ItemKey, OnAirError, OnAirResult, Page,
    SharedClock, StoreError, SystemClock,
};
use parking_lot::RwLock as SyncRwLock;
use tokio::sync::RwLock;

use super::backend::{BatchWriteOutput, PutCondition, StoreBackend, StoreOutput};
use crate::strategy::{GetRequest, IndexQueryRequest, ScanRequest};

const READ_UNIT_BYTES: usize = 4 * 1024;
const WRITE_UNIT_BYTES: usize = 1024;

fn read_units(bytes: usize) -> f64 {
    0.5 * bytes.div_ceil(READ_UNIT_BYTES).max(1) as f64
}

fn write_units(bytes: usize) -> f64 {
    bytes.div_ceil(WRITE_UNIT_BYTES).max(1) as f64
}

fn item_bytes(item: &Item) -> usize {
    serde_json::to_vec(item).map(|b| b.len()).unwrap_or(0)
}

/// Number of calls received per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub gets: u64,
    pub index_queries: u64,
    pub scans: u64,
    pub puts: u64,
    pub deletes: u64,
    pub batch_gets: u64,
    pub batch_writes: u64,
}

impl CallCounts {
    pub fn total(&self) -> u64 {
        self.gets
            + self.index_queries
            + self.scans
            + self.puts
            + self.deletes
            + self.batch_gets
            + self.batch_writes
    }
}

#[derive(Debug, Default)]
struct CallCounters {
    gets: AtomicU64,
    index_queries: AtomicU64,
    scans: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
    batch_gets: AtomicU64,
    batch_writes: AtomicU64,
}

impl CallCounters {
    fn snapshot(&self) -> CallCounts {
        CallCounts {
            gets: self.gets.load(Ordering::Relaxed),
            index_queries: self.index_queries.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            batch_gets: self.batch_gets.load(Ordering::Relaxed),
            batch_writes: self.batch_writes.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Items of one table, keyed by id.
type Table = HashMap<String, Item>;

/// Thread-safe in-memory document store.
pub struct InMemoryStore {
    tables: RwLock<HashMap<String, Table>>,
    missing_indexes: SyncRwLock<HashSet<(String, String)>>,
    available: AtomicBool,
    report_capacity: bool,
    batch_get_limit: usize,
    batch_write_limit: usize,
    clock: SharedClock,
    calls: CallCounters,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("available", &self.available.load(Ordering::Relaxed))
            .field("report_capacity", &self.report_capacity)
            .field("calls", &self.calls.snapshot())
            .finish()
    }
}

impl InMemoryStore {
    /// Create an empty store that assigns `updatedAt` from `clock`.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            missing_indexes: SyncRwLock::new(HashSet::new()),
            available: AtomicBool::new(true),
            report_capacity: true,
            batch_get_limit: 100,
            batch_write_limit: 25,
            clock,
            calls: CallCounters::default(),
        }
    }

    /// Stop reporting consumed capacity, forcing callers onto estimates.
    pub fn without_capacity_reporting(mut self) -> Self {
        self.report_capacity = false;
        self
    }

    /// Per-request batch limits enforced by the store.
    pub fn with_batch_limits(mut self, get_limit: usize, write_limit: usize) -> Self {
        self.batch_get_limit = get_limit;
        self.batch_write_limit = write_limit;
        self
    }

    /// Insert items as-is, bypassing conditions and `updatedAt` assignment.
    pub async fn seed(&self, table: &str, items: impl IntoIterator<Item = Item>) {
        let mut tables = self.tables.write().await;
        let table = tables.entry(table.to_string()).or_default();
        for item in items {
            table.insert(item.id.clone(), item);
        }
    }

    /// Current stored version of an item, bypassing call accounting.
    pub async fn peek(&self, table: &str, id: &str) -> Option<Item> {
        self.tables.read().await.get(table).and_then(|t| t.get(id)).cloned()
    }

    pub async fn item_count(&self, table: &str) -> usize {
        self.tables.read().await.get(table).map_or(0, HashMap::len)
    }

    /// Make an index unavailable, as if it were never created.
    pub fn drop_index(&self, table: &str, index: &str) {
        self.missing_indexes
            .write()
            .insert((table.to_string(), index.to_string()));
    }

    pub fn restore_index(&self, table: &str, index: &str) {
        self.missing_indexes
            .write()
            .remove(&(table.to_string(), index.to_string()));
    }

    /// Toggle availability. An unavailable store fails every call.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn call_counts(&self) -> CallCounts {
        self.calls.snapshot()
    }

    fn ensure_available(&self) -> OnAirResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(OnAirError::unavailable("in-memory store is offline"))
        }
    }

    fn output<T>(&self, value: T, units: f64) -> StoreOutput<T> {
        let output = StoreOutput::new(value);
        if self.report_capacity {
            output.with_consumed(units)
        } else {
            output
        }
    }

    /// Version assigned to a write: strictly above the previous version and
    /// never below creation time.
    fn next_version(&self, previous: Option<EpochMillis>, created_at: EpochMillis) -> EpochMillis {
        let now = self.clock.now_millis();
        let floor = previous.map_or(created_at, |p| p.saturating_add(1));
        now.max(floor).max(created_at)
    }
}

// ============================================================================
// ORDERING AND CURSORS
// ============================================================================

/// Newest first; ties broken by id, descending.
fn newest_first(a: &Item, b: &Item) -> std::cmp::Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.id.cmp(&a.id))
}

fn encode_cursor(item: &Item) -> Cursor {
    Cursor::new(format!("{}:{}", item.created_at, item.id).into_bytes())
}

fn decode_cursor(cursor: &Cursor) -> OnAirResult<(EpochMillis, String)> {
    let malformed = || OnAirError::invalid_argument("cursor", "malformed pagination cursor");
    let text = std::str::from_utf8(cursor.as_bytes()).map_err(|_| malformed())?;
    let (created_at, id) = text.split_once(':').ok_or_else(malformed)?;
    let created_at = created_at.parse::<EpochMillis>().map_err(|_| malformed())?;
    Ok((created_at, id.to_string()))
}

/// True when `item` comes strictly after the cursor position in walk order.
fn after_cursor(item: &Item, position: &(EpochMillis, String), descending: bool) -> bool {
    let order = (item.created_at, item.id.as_str()).cmp(&(position.0, position.1.as_str()));
    if descending {
        order.is_lt()
    } else {
        order.is_gt()
    }
}

/// Walk `candidates` from the cursor, newest-first when `descending`, and
/// collect one page.
///
/// Returns the page and the bytes examined.
fn paginate<'a>(
    candidates: impl Iterator<Item = &'a Item>,
    filters: &[FilterCondition],
    limit: usize,
    cursor: Option<&Cursor>,
    descending: bool,
) -> OnAirResult<(Page, usize)> {
    let position = cursor.map(decode_cursor).transpose()?;
    let mut ordered: Vec<&Item> = candidates
        .filter(|item| position.as_ref().map_or(true, |p| after_cursor(item, p, descending)))
        .collect();
    ordered.sort_by(|a, b| newest_first(a, b));
    if !descending {
        ordered.reverse();
    }

    let mut examined = 0usize;
    let mut items = Vec::new();
    let mut has_more = false;
    for item in ordered {
        if !filters.iter().all(|f| f.matches(item)) {
            examined += item_bytes(item);
            continue;
        }
        if items.len() == limit {
            has_more = true;
            break;
        }
        examined += item_bytes(item);
        items.push(item.clone());
    }

    let next_cursor = if has_more {
        items.last().map(encode_cursor)
    } else {
        None
    };
    Ok((Page::new(items, next_cursor), examined))
}

#[async_trait]
impl StoreBackend for InMemoryStore {
    async fn get_item(&self, request: &GetRequest) -> OnAirResult<StoreOutput<Option<Item>>> {
        bump(&self.calls.gets);
        self.ensure_available()?;
        let tables = self.tables.read().await;
        let item = tables
            .get(&request.table)
            .and_then(|t| t.get(&request.id))
            .filter(|item| request.filters.iter().all(|f| f.matches(item)))
            .cloned();
        let bytes = item.as_ref().map_or(0, item_bytes);
        Ok(self.output(item, read_units(bytes)))
    }

    async fn query_index(&self, request: &IndexQueryRequest) -> OnAirResult<StoreOutput<Page>> {
        bump(&self.calls.index_queries);
        self.ensure_available()?;
        let missing = self
            .missing_indexes
            .read()
            .contains(&(request.table.clone(), request.index_name.clone()));
        if missing {
            return Err(StoreError::IndexUnavailable {
                index: request.index_name.clone(),
            }
            .into());
        }

        let tables = self.tables.read().await;
        let empty = Table::new();
        let table = tables.get(&request.table).unwrap_or(&empty);
        let partition = serde_json::Value::String(request.partition_value.clone());
        let candidates = table
            .values()
            .filter(|item| item.attribute(&request.partition_attribute).as_ref() == Some(&partition));
        let (page, bytes) = paginate(
            candidates,
            &request.filters,
            request.limit,
            request.cursor.as_ref(),
            request.descending,
        )?;
        Ok(self.output(page, read_units(bytes)))
    }

    async fn scan(&self, request: &ScanRequest) -> OnAirResult<StoreOutput<Page>> {
        bump(&self.calls.scans);
        self.ensure_available()?;
        let tables = self.tables.read().await;
        let empty = Table::new();
        let table = tables.get(&request.table).unwrap_or(&empty);
        let (page, bytes) =
            paginate(table.values(), &request.filters, request.limit, request.cursor.as_ref(), true)?;
        Ok(self.output(page, read_units(bytes)))
    }

    async fn put_item(
        &self,
        table: &str,
        item: &Item,
        condition: PutCondition,
    ) -> OnAirResult<StoreOutput<Item>> {
        bump(&self.calls.puts);
        self.ensure_available()?;
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.to_string()).or_default();
        let existing = rows.get(&item.id);

        let holds = match (condition, existing) {
            (PutCondition::NotExists, None) => true,
            (PutCondition::UpdatedAtEquals(expected), Some(current)) => current.updated_at == expected,
            _ => false,
        };
        if !holds {
            return Err(StoreError::ConcurrentModification {
                collection: table.to_string(),
                id: item.id.clone(),
                expected: condition.expected(),
                actual: existing.map(|current| current.updated_at),
            }
            .into());
        }

        let mut stored = item.clone();
        if let Some(current) = existing {
            stored.created_at = current.created_at;
        }
        stored.updated_at = self.next_version(existing.map(|c| c.updated_at), stored.created_at);
        rows.insert(stored.id.clone(), stored.clone());
        let units = write_units(item_bytes(&stored));
        Ok(self.output(stored, units))
    }

    async fn delete_item(&self, table: &str, key: &ItemKey) -> OnAirResult<StoreOutput<()>> {
        bump(&self.calls.deletes);
        self.ensure_available()?;
        let mut tables = self.tables.write().await;
        if let Some(rows) = tables.get_mut(table) {
            if rows.get(&key.id).is_some_and(|item| item.created_at == key.created_at) {
                rows.remove(&key.id);
            }
        }
        Ok(self.output((), 1.0))
    }

    async fn batch_get(&self, table: &str, keys: &[ItemKey]) -> OnAirResult<StoreOutput<Vec<Item>>> {
        bump(&self.calls.batch_gets);
        self.ensure_available()?;
        if keys.len() > self.batch_get_limit {
            return Err(OnAirError::invalid_argument(
                "keys",
                format!("batch get accepts at most {} keys, got {}", self.batch_get_limit, keys.len()),
            ));
        }
        let tables = self.tables.read().await;
        let items: Vec<Item> = keys
            .iter()
            .filter_map(|key| {
                tables
                    .get(table)
                    .and_then(|rows| rows.get(&key.id))
                    .filter(|item| item.created_at == key.created_at)
                    .cloned()
            })
            .collect();
        let units = items.iter().map(|item| read_units(item_bytes(item))).sum::<f64>();
        Ok(self.output(items, units.max(0.5)))
    }

    async fn batch_write(&self, table: &str, items: &[Item]) -> OnAirResult<StoreOutput<BatchWriteOutput>> {
        bump(&self.calls.batch_writes);
        self.ensure_available()?;
        if items.len() > self.batch_write_limit {
            return Err(OnAirError::invalid_argument(
                "items",
                format!("batch write accepts at most {} items, got {}", self.batch_write_limit, items.len()),
            ));
        }
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.to_string()).or_default();
        let mut written = Vec::with_capacity(items.len());
        let mut units = 0.0;
        for item in items {
            let mut stored = item.clone();
            let previous = rows.get(&item.id).map(|current| current.updated_at);
            stored.updated_at = self.next_version(previous, stored.created_at);
            units += write_units(item_bytes(&stored));
            rows.insert(stored.id.clone(), stored.clone());
            written.push(stored);
        }
        let output = BatchWriteOutput {
            written,
            unprocessed: Vec::new(),
        };
        Ok(self.output(output, units))
    }
}
