//! OnAir Storage - Cached Query Layer
//!
//! Read-through caching and adaptive query planning in front of the station's
//! document store. [`CachedQueryLayer`] is the entry point; the pieces it is
//! built from are public so they can be used and tested on their own.

pub mod cache;
pub mod events;
pub mod layer;
pub mod metrics;
pub mod store;
pub mod strategy;
pub mod warm_up;

pub use cache::{CacheKey, CacheStats, CachedValue, EntryCache, EntryInfo};
pub use events::{BroadcastInvalidationSource, InvalidationEvent, InvalidationSource};
pub use layer::{CachedQueryLayer, InvalidationSubscription, LayerBuilder, ReadMode, UNKNOWN_CALLER};
pub use metrics::{MetricsCollector, MetricsSnapshot, READ_UNIT_PRICE_USD, WRITE_UNIT_PRICE_USD};
pub use store::{
    BatchWriteOutput, CallContext, CallCounts, CancellationToken, InMemoryStore, PutCondition,
    StoreBackend, StoreClient, StoreOutput,
};
pub use strategy::{
    GetRequest, IndexQueryRequest, QueryPlan, QueryStrategySelector, RequestParams,
    RetrievalStrategy, ScanRequest,
};
pub use warm_up::{WarmUpQuery, WarmUpReport, REFRESH_PAGE_SIZE};
