//! Query shapes: predicates, pagination, filters and result pages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::EpochMillis;
use crate::item::Item;

/// Opaque pagination token handed out by the store.
///
/// The layer never inspects the bytes; it only renders them for cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor(Vec<u8>);

impl Cursor {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Hex rendering, stable for identical tokens.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

/// Inclusive `createdAt` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CreatedRange {
    pub from: Option<EpochMillis>,
    pub to: Option<EpochMillis>,
}

/// Requested predicates for a query. Absent predicates do not constrain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Predicates {
    pub id: Option<String>,
    pub owner_id: Option<String>,
    pub status: Option<String>,
    pub category: Option<String>,
    pub created_range: Option<CreatedRange>,
}

impl Predicates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_created_range(mut self, from: Option<EpochMillis>, to: Option<EpochMillis>) -> Self {
        self.created_range = Some(CreatedRange { from, to });
        self
    }

    pub fn has_range(&self) -> bool {
        self.created_range.is_some()
    }

    /// True when the item satisfies every present predicate.
    pub fn matches(&self, item: &Item) -> bool {
        self.as_filters().iter().all(|f| f.matches(item))
    }

    /// Every present predicate as an equality/range filter.
    pub fn as_filters(&self) -> Vec<FilterCondition> {
        let mut filters = Vec::new();
        if let Some(id) = &self.id {
            filters.push(FilterCondition::eq("id", Value::String(id.clone())));
        }
        if let Some(owner) = &self.owner_id {
            filters.push(FilterCondition::eq("ownerId", Value::String(owner.clone())));
        }
        if let Some(status) = &self.status {
            filters.push(FilterCondition::eq("status", Value::String(status.clone())));
        }
        if let Some(category) = &self.category {
            filters.push(FilterCondition::eq("category", Value::String(category.clone())));
        }
        filters.extend(range_filters(self.created_range));
        filters
    }
}

/// Range predicate expressed as filters on `createdAt`.
pub fn range_filters(range: Option<CreatedRange>) -> Vec<FilterCondition> {
    let mut filters = Vec::new();
    if let Some(range) = range {
        if let Some(from) = range.from {
            filters.push(FilterCondition::new("createdAt", FilterOperator::Gte, Value::from(from)));
        }
        if let Some(to) = range.to {
            filters.push(FilterCondition::new("createdAt", FilterOperator::Lte, Value::from(to)));
        }
    }
    filters
}

/// Requested page size and continuation token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pagination {
    /// `None` uses the configured default.
    pub page_size: Option<i64>,
    pub cursor: Option<Cursor>,
}

impl Pagination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page_size(size: i64) -> Self {
        Self {
            page_size: Some(size),
            cursor: None,
        }
    }

    pub fn with_cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }
}

/// Comparison applied by a server-side filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    /// Equal to
    Eq,
    /// Greater than or equal (numbers only)
    Gte,
    /// Less than or equal (numbers only)
    Lte,
}

/// A single filter condition evaluated by the store after reading an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterCondition {
    /// Stored attribute name (`status`, `ownerId`, `category`, ...)
    pub field: String,
    pub operator: FilterOperator,
    pub value: Value,
}

impl FilterCondition {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Create an equality filter.
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Eq, value)
    }

    pub fn matches(&self, item: &Item) -> bool {
        let Some(actual) = item.attribute(&self.field) else {
            return false;
        };
        match self.operator {
            FilterOperator::Eq => actual == self.value,
            FilterOperator::Gte => compare_numbers(&actual, &self.value).is_some_and(|o| o.is_ge()),
            FilterOperator::Lte => compare_numbers(&actual, &self.value).is_some_and(|o| o.is_le()),
        }
    }
}

fn compare_numbers(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    a.as_f64()?.partial_cmp(&b.as_f64()?)
}

/// One page of query results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub items: Vec<Item>,
    pub next_cursor: Option<Cursor>,
    pub count: usize,
    pub has_more: bool,
}

impl Page {
    pub fn new(items: Vec<Item>, next_cursor: Option<Cursor>) -> Self {
        let count = items.len();
        let has_more = next_cursor.is_some();
        Self {
            items,
            next_cursor,
            count,
            has_more,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
