//! Item records and write intents.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identity::{new_item_id, EpochMillis};

/// Status assigned to items written without one.
pub const DEFAULT_STATUS: &str = "draft";

/// A record belonging to exactly one collection.
///
/// `(id, created_at)` is the primary key within the collection. `updated_at`
/// doubles as the optimistic-concurrency version and is rewritten by every
/// successful write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    pub created_at: EpochMillis,
    pub updated_at: EpochMillis,
    pub owner_id: String,
    pub status: String,
    /// Collection-specific attributes (title, duration, scheduled date, ...).
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Item {
    /// Create an item with the given key, owner and status and no extra fields.
    pub fn new(
        id: impl Into<String>,
        created_at: EpochMillis,
        owner_id: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            created_at,
            updated_at: created_at,
            owner_id: owner_id.into(),
            status: status.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style setter for a collection-specific field.
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Look up a collection-specific field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Primary key of this item.
    pub fn key(&self) -> ItemKey {
        ItemKey {
            id: self.id.clone(),
            created_at: self.created_at,
        }
    }

    /// Resolve an attribute by its stored name, covering both the fixed
    /// attributes and the open field map. Used for filter evaluation.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.clone())),
            "createdAt" => Some(Value::from(self.created_at)),
            "updatedAt" => Some(Value::from(self.updated_at)),
            "ownerId" => Some(Value::String(self.owner_id.clone())),
            "status" => Some(Value::String(self.status.clone())),
            other => self.fields.get(other).cloned(),
        }
    }

    /// Fill in defaults before a write.
    ///
    /// An empty id gets a generated one, a non-positive `created_at` becomes
    /// `now`, an empty owner becomes `caller`, and an empty status becomes
    /// `default_status`. `updated_at` is left alone; the store assigns it.
    pub fn prepare(mut self, now: EpochMillis, caller: &str, default_status: &str) -> Self {
        if self.id.trim().is_empty() {
            self.id = new_item_id();
        }
        if self.created_at <= 0 {
            self.created_at = now;
        }
        if self.owner_id.is_empty() {
            self.owner_id = caller.to_string();
        }
        if self.status.is_empty() {
            self.status = default_status.to_string();
        }
        if self.updated_at < self.created_at {
            self.updated_at = self.created_at;
        }
        self
    }
}

/// Primary key of an item within its collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemKey {
    pub id: String,
    pub created_at: EpochMillis,
}

impl ItemKey {
    pub fn new(id: impl Into<String>, created_at: EpochMillis) -> Self {
        Self {
            id: id.into(),
            created_at,
        }
    }
}

/// An item plus the version the writer believes is current.
///
/// `expected_updated_at == None` means "create": the write only succeeds when
/// no item with the same key exists yet.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteIntent {
    pub item: Item,
    pub expected_updated_at: Option<EpochMillis>,
}

impl WriteIntent {
    /// Intent to create a new item.
    pub fn create(item: Item) -> Self {
        Self {
            item,
            expected_updated_at: None,
        }
    }

    /// Intent to replace an item last seen at `expected_updated_at`.
    pub fn replace(item: Item, expected_updated_at: EpochMillis) -> Self {
        Self {
            item,
            expected_updated_at: Some(expected_updated_at),
        }
    }

    pub fn is_create(&self) -> bool {
        self.expected_updated_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_item_serializes_camel_case_and_flattens_fields() {
        let item = Item::new("n1", 10, "alice", "active").with_field("title", json!("Morning news"));
        let value = serde_json::to_value(&item).expect("serialize item");
        assert_eq!(value["createdAt"], json!(10));
        assert_eq!(value["updatedAt"], json!(10));
        assert_eq!(value["ownerId"], json!("alice"));
        assert_eq!(value["title"], json!("Morning news"));

        let back: Item = serde_json::from_value(value).expect("deserialize item");
        assert_eq!(back, item);
    }

    #[test]
    fn test_prepare_fills_defaults() {
        let item = Item::new("", 0, "", "").prepare(500, "bob", DEFAULT_STATUS);
        assert!(!item.id.is_empty());
        assert_eq!(item.created_at, 500);
        assert_eq!(item.updated_at, 500);
        assert_eq!(item.owner_id, "bob");
        assert_eq!(item.status, "draft");
    }

    #[test]
    fn test_prepare_keeps_existing_values() {
        let item = Item::new("keep", 42, "carol", "ready").prepare(500, "bob", DEFAULT_STATUS);
        assert_eq!(item.id, "keep");
        assert_eq!(item.created_at, 42);
        assert_eq!(item.owner_id, "carol");
        assert_eq!(item.status, "ready");
    }

    #[test]
    fn test_attribute_lookup() {
        let item = Item::new("b1", 7, "dj", "scheduled").with_field("category", json!("sport"));
        assert_eq!(item.attribute("ownerId"), Some(json!("dj")));
        assert_eq!(item.attribute("status"), Some(json!("scheduled")));
        assert_eq!(item.attribute("category"), Some(json!("sport")));
        assert_eq!(item.attribute("missing"), None);
    }

    #[test]
    fn test_write_intent_constructors() {
        let item = Item::new("x", 1, "o", "s");
        assert!(WriteIntent::create(item.clone()).is_create());
        let replace = WriteIntent::replace(item, 100);
        assert!(!replace.is_create());
        assert_eq!(replace.expected_updated_at, Some(100));
    }
}
