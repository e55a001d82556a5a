//! Deterministic cache keys.
//!
//! Keys are namespaced by collection so that collection-wide invalidation is a
//! prefix match:
//!
//! ```text
//! news:page?owner="alice"&status="active"&size=20&cursor=0a1b
//! news:item:0191c7e2-...
//! ```
//!
//! Predicate values are JSON-quoted, so separators inside values cannot
//! collide with the key grammar. The page size is the effective size, which
//! makes an absent size and an explicit default produce the same key.

use std::fmt;

use onair_core::{Cursor, Predicates};

const PAGE_SEGMENT: &str = "page?";
const ITEM_SEGMENT: &str = "item:";

/// Key of one cached entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key of a query result page.
    pub fn page(
        collection: &str,
        predicates: &Predicates,
        page_size: usize,
        cursor: Option<&Cursor>,
    ) -> Self {
        let mut parts: Vec<String> = Vec::with_capacity(8);
        if let Some(id) = &predicates.id {
            parts.push(format!("id={}", quote(id)));
        }
        if let Some(owner) = &predicates.owner_id {
            parts.push(format!("owner={}", quote(owner)));
        }
        if let Some(status) = &predicates.status {
            parts.push(format!("status={}", quote(status)));
        }
        if let Some(category) = &predicates.category {
            parts.push(format!("category={}", quote(category)));
        }
        if let Some(range) = predicates.created_range {
            if let Some(from) = range.from {
                parts.push(format!("from={}", from));
            }
            if let Some(to) = range.to {
                parts.push(format!("to={}", to));
            }
            if range.from.is_none() && range.to.is_none() {
                parts.push("range=open".to_string());
            }
        }
        parts.push(format!("size={}", page_size));
        if let Some(cursor) = cursor {
            parts.push(format!("cursor={}", cursor.to_hex()));
        }
        Self(format!("{}:{}{}", collection, PAGE_SEGMENT, parts.join("&")))
    }

    /// Key of a single item.
    pub fn item(collection: &str, id: &str) -> Self {
        Self(format!("{}:{}{}", collection, ITEM_SEGMENT, id))
    }

    /// Prefix shared by every page key of a collection.
    pub fn page_prefix(collection: &str) -> String {
        format!("{}:{}", collection, PAGE_SEGMENT)
    }

    /// Prefix shared by every key of a collection.
    pub fn collection_prefix(collection: &str) -> String {
        format!("{}:", collection)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_page(&self) -> bool {
        self.0
            .split_once(':')
            .is_some_and(|(_, rest)| rest.starts_with(PAGE_SEGMENT))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn quote(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}
