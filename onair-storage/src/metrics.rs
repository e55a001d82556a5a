//! Cache and store usage counters.
//!
//! Every counter is a relaxed atomic: recording never blocks and a snapshot
//! may interleave with concurrent updates. Capacity units are accumulated in
//! thousandths so fractional read costs survive integer storage.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::strategy::RetrievalStrategy;

/// Dollar cost of one read capacity unit.
pub const READ_UNIT_PRICE_USD: f64 = 0.00013;

/// Dollar cost of one write capacity unit.
pub const WRITE_UNIT_PRICE_USD: f64 = 0.00065;

const MILLI: f64 = 1000.0;

fn to_milli(units: f64) -> u64 {
    if units.is_finite() && units > 0.0 {
        (units * MILLI).round() as u64
    } else {
        0
    }
}

/// Shared, lock-free metrics sink.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_evictions: AtomicU64,
    invalidated_entries: AtomicU64,
    strategy_counts: [AtomicU64; 4],
    store_calls: AtomicU64,
    read_units_milli: AtomicU64,
    write_units_milli: AtomicU64,
    index_fallbacks: AtomicU64,
    batch_chunks: AtomicU64,
    batch_retries: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.cache_evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record entries removed by explicit invalidation.
    pub fn record_invalidated(&self, count: u64) {
        self.invalidated_entries.fetch_add(count, Ordering::Relaxed);
    }

    /// Record one completed store call served by `strategy`.
    pub fn record_strategy(&self, strategy: RetrievalStrategy) {
        self.strategy_counts[strategy.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Record read capacity consumed by one store call.
    pub fn record_read_cost(&self, units: f64) {
        self.store_calls.fetch_add(1, Ordering::Relaxed);
        self.read_units_milli.fetch_add(to_milli(units), Ordering::Relaxed);
    }

    /// Record write capacity consumed by one store call.
    pub fn record_write_cost(&self, units: f64) {
        self.store_calls.fetch_add(1, Ordering::Relaxed);
        self.write_units_milli.fetch_add(to_milli(units), Ordering::Relaxed);
    }

    pub fn record_index_fallback(&self) {
        self.index_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_chunk(&self) {
        self.batch_chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_retry(&self) {
        self.batch_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn cache_evictions(&self) -> u64 {
        self.cache_evictions.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter.
    ///
    /// Cache occupancy is not tracked here; callers that own a cache fill
    /// `cache_entries` and `cache_bytes` themselves.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let strategy_usage = RetrievalStrategy::ALL
            .iter()
            .map(|s| (*s, self.strategy_counts[s.index()].load(Ordering::Relaxed)))
            .collect();
        MetricsSnapshot {
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses(),
            cache_evictions: self.cache_evictions(),
            invalidated_entries: self.invalidated_entries.load(Ordering::Relaxed),
            cache_entries: 0,
            cache_bytes: 0,
            strategy_usage,
            store_calls: self.store_calls.load(Ordering::Relaxed),
            read_capacity_units: self.read_units_milli.load(Ordering::Relaxed) as f64 / MILLI,
            write_capacity_units: self.write_units_milli.load(Ordering::Relaxed) as f64 / MILLI,
            index_fallbacks: self.index_fallbacks.load(Ordering::Relaxed),
            batch_chunks: self.batch_chunks.load(Ordering::Relaxed),
            batch_retries: self.batch_retries.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of [`MetricsCollector`] at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub invalidated_entries: u64,
    pub cache_entries: usize,
    pub cache_bytes: usize,
    pub strategy_usage: BTreeMap<RetrievalStrategy, u64>,
    pub store_calls: u64,
    pub read_capacity_units: f64,
    pub write_capacity_units: f64,
    pub index_fallbacks: u64,
    pub batch_chunks: u64,
    pub batch_retries: u64,
}

impl MetricsSnapshot {
    /// Hits over lookups, 0.0 when nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    /// Misses over lookups, 0.0 when nothing was looked up.
    pub fn miss_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_misses as f64 / total as f64
        }
    }

    pub fn strategy_count(&self, strategy: RetrievalStrategy) -> u64 {
        self.strategy_usage.get(&strategy).copied().unwrap_or(0)
    }

    /// Store calls served by a table scan.
    pub fn scans(&self) -> u64 {
        self.strategy_usage
            .iter()
            .filter(|(s, _)| s.is_scan())
            .map(|(_, n)| n)
            .sum()
    }

    /// Store calls served by a key get or an index query.
    pub fn targeted_reads(&self) -> u64 {
        self.strategy_usage
            .iter()
            .filter(|(s, _)| !s.is_scan())
            .map(|(_, n)| n)
            .sum()
    }

    pub fn read_cost_usd(&self) -> f64 {
        self.read_capacity_units * READ_UNIT_PRICE_USD
    }

    pub fn write_cost_usd(&self) -> f64 {
        self.write_capacity_units * WRITE_UNIT_PRICE_USD
    }

    pub fn estimated_cost_usd(&self) -> f64 {
        self.read_cost_usd() + self.write_cost_usd()
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "cache: {} entries, {:.2} KB, hit rate {:.2}% ({} hits / {} misses), {} evictions",
            self.cache_entries,
            self.cache_bytes as f64 / 1024.0,
            self.hit_rate() * 100.0,
            self.cache_hits,
            self.cache_misses,
            self.cache_evictions,
        )?;
        writeln!(
            f,
            "store: {} calls, {} scans vs {} targeted reads, {} index fallbacks",
            self.store_calls,
            self.scans(),
            self.targeted_reads(),
            self.index_fallbacks,
        )?;
        for (strategy, count) in &self.strategy_usage {
            writeln!(f, "  {}: {}", strategy, count)?;
        }
        write!(
            f,
            "capacity: {:.3} RCU, {:.3} WCU, estimated ${:.6}",
            self.read_capacity_units,
            self.write_capacity_units,
            self.estimated_cost_usd(),
        )
    }
}
