//! Collection catalogue: logical names, physical tables and available indexes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{OnAirResult, ValidationError};
use crate::item::DEFAULT_STATUS;

/// Owner index name used by the station tables.
pub const OWNER_INDEX: &str = "userId-createdAt-index";

/// Static description of one logical collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    /// Logical name used by callers (`news`, `blocks`, ...).
    pub name: String,
    /// Physical table name in the backing store.
    pub table: String,
    /// Secondary index keyed by owner, newest-first on `createdAt`.
    pub owner_index: Option<String>,
    /// Status written when an item arrives without one.
    pub default_status: String,
}

impl CollectionSpec {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            owner_index: None,
            default_status: DEFAULT_STATUS.to_string(),
        }
    }

    pub fn with_owner_index(mut self, index: impl Into<String>) -> Self {
        self.owner_index = Some(index.into());
        self
    }

    pub fn with_default_status(mut self, status: impl Into<String>) -> Self {
        self.default_status = status.into();
        self
    }
}

/// Lookup table from logical collection name to its spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRegistry {
    collections: BTreeMap<String, CollectionSpec>,
}

impl CollectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The station's standard tables.
    ///
    /// `habillage` (jingles and station imaging) has no owner index; owner
    /// queries against it are served by a filtered scan.
    pub fn station_defaults() -> Self {
        let mut registry = Self::new();
        for name in ["news", "animations", "blocks", "conductors"] {
            registry.register(
                CollectionSpec::new(name, format!("onair-{}", name)).with_owner_index(OWNER_INDEX),
            );
        }
        registry.register(CollectionSpec::new("habillage", "onair-habillage"));
        registry
    }

    /// Add or replace a collection.
    pub fn register(&mut self, spec: CollectionSpec) {
        self.collections.insert(spec.name.clone(), spec);
    }

    pub fn with(mut self, spec: CollectionSpec) -> Self {
        self.register(spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&CollectionSpec> {
        self.collections.get(name)
    }

    /// Look up a collection, failing with `UnknownCollection`.
    pub fn resolve(&self, name: &str) -> OnAirResult<&CollectionSpec> {
        self.collections.get(name).ok_or_else(|| {
            ValidationError::UnknownCollection {
                collection: name.to_string(),
            }
            .into()
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OnAirError;

    #[test]
    fn test_station_defaults() {
        let registry = CollectionRegistry::station_defaults();
        assert_eq!(registry.len(), 5);
        let news = registry.resolve("news").expect("news is registered");
        assert_eq!(news.table, "onair-news");
        assert_eq!(news.owner_index.as_deref(), Some(OWNER_INDEX));
        assert_eq!(news.default_status, "draft");
        assert!(registry.get("habillage").expect("habillage").owner_index.is_none());
    }

    #[test]
    fn test_unknown_collection() {
        let registry = CollectionRegistry::station_defaults();
        let err = registry.resolve("weather").unwrap_err();
        assert!(matches!(
            err,
            OnAirError::Validation(ValidationError::UnknownCollection { .. })
        ));
    }

    #[test]
    fn test_register_replaces() {
        let registry = CollectionRegistry::new()
            .with(CollectionSpec::new("news", "a"))
            .with(CollectionSpec::new("news", "b").with_default_status("active"));
        assert_eq!(registry.len(), 1);
        let news = registry.resolve("news").expect("news");
        assert_eq!(news.table, "b");
        assert_eq!(news.default_status, "active");
    }
}
