//! Bounded in-memory cache with TTL expiry and LRU eviction.
//!
//! Entries live in an [`lru::LruCache`] behind a short-held mutex. The lock
//! is never held across an await point, so a read only ever waits for another
//! in-memory cache operation, never for store I/O.
//!
//! Every removal bumps a generation counter while the lock is held. A caller
//! that reads the generation before fetching and fills with
//! [`EntryCache::set_if_current`] never caches data that an invalidation
//! raced past.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use onair_core::{CacheSettings, EpochMillis, Item, Page, SharedClock};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use super::key::CacheKey;
use crate::metrics::MetricsCollector;

/// A cached query result or single item.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CachedValue {
    Page(Page),
    Item(Item),
}

impl CachedValue {
    pub fn into_page(self) -> Option<Page> {
        match self {
            CachedValue::Page(page) => Some(page),
            CachedValue::Item(_) => None,
        }
    }

    pub fn into_item(self) -> Option<Item> {
        match self {
            CachedValue::Item(item) => Some(item),
            CachedValue::Page(_) => None,
        }
    }

    /// Approximate footprint: length of the JSON encoding.
    fn estimated_size(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(0)
    }
}

#[derive(Debug)]
struct CacheEntry {
    value: CachedValue,
    inserted_at: EpochMillis,
    last_access: EpochMillis,
    hits: u64,
    size_bytes: usize,
}

/// Bookkeeping for one resident entry, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub inserted_at: EpochMillis,
    pub last_access: EpochMillis,
    pub hits: u64,
    pub size_bytes: usize,
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently resident.
    pub entry_count: usize,
    /// Approximate memory usage in bytes.
    pub memory_bytes: usize,
    /// Number of evictions due to capacity.
    pub evictions: u64,
    pub capacity: usize,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Key-value cache with per-entry TTL and least-recently-used eviction.
pub struct EntryCache {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
    /// Only written while `entries` is locked.
    generation: AtomicU64,
    capacity: usize,
    ttl_ms: i64,
    clock: SharedClock,
    metrics: Arc<MetricsCollector>,
}

impl std::fmt::Debug for EntryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryCache")
            .field("capacity", &self.capacity)
            .field("ttl_ms", &self.ttl_ms)
            .field("len", &self.len())
            .finish()
    }
}

impl EntryCache {
    pub fn new(settings: &CacheSettings, clock: SharedClock, metrics: Arc<MetricsCollector>) -> Self {
        let capacity = NonZeroUsize::new(settings.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            generation: AtomicU64::new(0),
            capacity: capacity.get(),
            ttl_ms: i64::try_from(settings.ttl_ms).unwrap_or(i64::MAX),
            clock,
            metrics,
        }
    }

    fn is_fresh(&self, entry: &CacheEntry, now: EpochMillis) -> bool {
        now.saturating_sub(entry.inserted_at) < self.ttl_ms
    }

    /// Look up a value.
    ///
    /// A fresh entry counts as a hit, becomes most-recently-used and has its
    /// access time bumped. A missing or expired entry counts as a miss; an
    /// expired entry is removed on the way out.
    pub fn get(&self, key: &CacheKey) -> Option<CachedValue> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();

        match entries.peek(key).map(|entry| self.is_fresh(entry, now)) {
            None => {
                drop(entries);
                self.metrics.record_miss();
                return None;
            }
            Some(false) => {
                entries.pop(key);
                drop(entries);
                debug!(key = %key, "cache entry expired");
                self.metrics.record_miss();
                return None;
            }
            Some(true) => {}
        }

        let value = entries.get_mut(key).map(|entry| {
            entry.hits += 1;
            entry.last_access = now;
            entry.value.clone()
        });
        drop(entries);
        self.metrics.record_hit();
        value
    }

    pub fn get_page(&self, key: &CacheKey) -> Option<Page> {
        self.get(key).and_then(CachedValue::into_page)
    }

    pub fn get_item(&self, key: &CacheKey) -> Option<Item> {
        self.get(key).and_then(CachedValue::into_item)
    }

    fn new_entry(&self, value: CachedValue) -> CacheEntry {
        let now = self.clock.now_millis();
        CacheEntry {
            size_bytes: value.estimated_size(),
            value,
            inserted_at: now,
            last_access: now,
            hits: 0,
        }
    }

    fn note_displaced(&self, key: &CacheKey, displaced: Option<(CacheKey, CacheEntry)>) {
        if let Some((old_key, _)) = displaced {
            if old_key != *key {
                debug!(evicted = %old_key, "cache entry evicted");
                self.metrics.record_eviction();
            }
        }
    }

    /// Insert or replace a value, evicting the least-recently-used entry when
    /// the cache is full.
    pub fn set(&self, key: CacheKey, value: CachedValue) {
        let entry = self.new_entry(value);
        let displaced = self.entries.lock().push(key.clone(), entry);
        self.note_displaced(&key, displaced);
    }

    /// Current invalidation generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Insert `value` only if no removal happened since `observed` was read
    /// from [`EntryCache::generation`]. Returns true when inserted.
    pub fn set_if_current(&self, key: CacheKey, value: CachedValue, observed: u64) -> bool {
        let entry = self.new_entry(value);
        let mut entries = self.entries.lock();
        if self.generation.load(Ordering::SeqCst) != observed {
            return false;
        }
        let displaced = entries.push(key.clone(), entry);
        drop(entries);
        self.note_displaced(&key, displaced);
        true
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Replace the value of a resident entry with fresher data.
    ///
    /// Absent keys are left absent. The entry's insertion time is reset;
    /// recency and hit counters are untouched. Returns true when patched.
    pub fn patch(&self, key: &CacheKey, value: CachedValue) -> bool {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        match entries.peek_mut(key) {
            Some(entry) => {
                entry.size_bytes = value.estimated_size();
                entry.value = value;
                entry.inserted_at = now;
                true
            }
            None => false,
        }
    }

    /// Remove one entry. Returns true when it was resident.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let mut entries = self.entries.lock();
        self.bump_generation();
        let removed = entries.pop(key).is_some();
        drop(entries);
        if removed {
            self.metrics.record_invalidated(1);
        }
        removed
    }

    /// Remove every entry whose key contains `pattern`.
    pub fn invalidate(&self, pattern: &str) -> usize {
        self.remove_where(|key| key.as_str().contains(pattern))
    }

    /// Remove every entry whose key starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        self.remove_where(|key| key.as_str().starts_with(prefix))
    }

    fn remove_where(&self, predicate: impl Fn(&CacheKey) -> bool) -> usize {
        let mut entries = self.entries.lock();
        self.bump_generation();
        let doomed: Vec<CacheKey> = entries
            .iter()
            .filter(|(key, _)| predicate(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        drop(entries);

        if !doomed.is_empty() {
            debug!(removed = doomed.len(), "cache entries invalidated");
            self.metrics.record_invalidated(doomed.len() as u64);
        }
        doomed.len()
    }

    /// Drop expired entries without waiting for a lookup to find them.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        let expired: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, entry)| !self.is_fresh(entry, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    /// Remove everything. Returns the number of entries dropped.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        self.bump_generation();
        let count = entries.len();
        entries.clear();
        drop(entries);
        if count > 0 {
            self.metrics.record_invalidated(count as u64);
        }
        count
    }

    /// Resident entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True when a fresh entry is resident. Does not count as a lookup and
    /// does not change recency.
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = self.clock.now_millis();
        self.entries
            .lock()
            .peek(key)
            .is_some_and(|entry| self.is_fresh(entry, now))
    }

    /// Bookkeeping for a resident entry without touching recency.
    pub fn info(&self, key: &CacheKey) -> Option<EntryInfo> {
        self.entries.lock().peek(key).map(|entry| EntryInfo {
            inserted_at: entry.inserted_at,
            last_access: entry.last_access,
            hits: entry.hits,
            size_bytes: entry.size_bytes,
        })
    }

    pub fn stats(&self) -> CacheStats {
        let (entry_count, memory_bytes) = {
            let entries = self.entries.lock();
            let bytes = entries.iter().map(|(_, entry)| entry.size_bytes).sum();
            (entries.len(), bytes)
        };
        CacheStats {
            hits: self.metrics.cache_hits(),
            misses: self.metrics.cache_misses(),
            entry_count,
            memory_bytes,
            evictions: self.metrics.cache_evictions(),
            capacity: self.capacity,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
