//! Entry cache for query pages and single items.
//!
//! The cache is a plain bounded map: it knows nothing about the store. The
//! query layer decides what to look up, what to populate and what to
//! invalidate after a write.

pub mod entry_cache;
pub mod key;

pub use entry_cache::{CacheStats, CachedValue, EntryCache, EntryInfo};
pub use key::CacheKey;
