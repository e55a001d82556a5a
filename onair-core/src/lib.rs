//! OnAir Core - Entity Types
//!
//! Data structures shared by every OnAir crate: items and their keys, query
//! shapes, the collection catalogue, the error taxonomy and configuration.
//! This crate contains no I/O.

pub mod collection;
pub mod config;
pub mod error;
pub mod identity;
pub mod item;
pub mod query;

pub use collection::{CollectionRegistry, CollectionSpec, OWNER_INDEX};
pub use config::{BatchSettings, CacheSettings, LayerConfig, PaginationSettings};
pub use error::{ConfigError, OnAirError, OnAirResult, StoreError, ValidationError};
pub use identity::{new_item_id, Clock, EpochMillis, ManualClock, SharedClock, SystemClock};
pub use item::{Item, ItemKey, WriteIntent, DEFAULT_STATUS};
pub use query::{
    range_filters, CreatedRange, Cursor, FilterCondition, FilterOperator, Page, Pagination,
    Predicates,
};
