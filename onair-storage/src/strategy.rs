//! Query strategy selection.
//!
//! Maps a collection, a predicate set and pagination onto the cheapest store
//! access path. The rules are evaluated in order and the first match wins:
//!
//! 1. `id` present and no range requested: direct key get.
//! 2. `owner_id` present and the collection has an owner index: index query,
//!    newest-first.
//! 3. `status` present: filtered scan.
//! 4. Otherwise: paginated scan.
//!
//! Predicates not served by the key or the index travel with the plan as
//! residual filters, so every plan returns only matching items.

use std::fmt;
use std::sync::Arc;

use onair_core::{
    CollectionRegistry, Cursor, FilterCondition, OnAirError, OnAirResult, Pagination,
    PaginationSettings, Predicates,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Store access path chosen for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    DirectKeyGet,
    ByOwnerIndex,
    ByStatusFilteredScan,
    UnfilteredPaginatedScan,
}

impl RetrievalStrategy {
    pub const ALL: [RetrievalStrategy; 4] = [
        RetrievalStrategy::DirectKeyGet,
        RetrievalStrategy::ByOwnerIndex,
        RetrievalStrategy::ByStatusFilteredScan,
        RetrievalStrategy::UnfilteredPaginatedScan,
    ];

    /// Stable position used by histogram arrays.
    pub fn index(self) -> usize {
        match self {
            RetrievalStrategy::DirectKeyGet => 0,
            RetrievalStrategy::ByOwnerIndex => 1,
            RetrievalStrategy::ByStatusFilteredScan => 2,
            RetrievalStrategy::UnfilteredPaginatedScan => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RetrievalStrategy::DirectKeyGet => "direct_key_get",
            RetrievalStrategy::ByOwnerIndex => "by_owner_index",
            RetrievalStrategy::ByStatusFilteredScan => "by_status_filtered_scan",
            RetrievalStrategy::UnfilteredPaginatedScan => "unfiltered_paginated_scan",
        }
    }

    /// True for strategies that read the whole table.
    pub fn is_scan(self) -> bool {
        matches!(
            self,
            RetrievalStrategy::ByStatusFilteredScan | RetrievalStrategy::UnfilteredPaginatedScan
        )
    }

    /// Static read-unit estimate used when the store reports no consumption.
    pub fn estimated_read_units(self) -> f64 {
        match self {
            RetrievalStrategy::DirectKeyGet => 0.5,
            RetrievalStrategy::ByOwnerIndex => 1.0,
            RetrievalStrategy::ByStatusFilteredScan => 4.0,
            RetrievalStrategy::UnfilteredPaginatedScan => 2.0,
        }
    }
}

impl fmt::Display for RetrievalStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// REQUEST PARAMETERS
// ============================================================================

/// Point read by primary id.
#[derive(Debug, Clone, PartialEq)]
pub struct GetRequest {
    pub table: String,
    pub id: String,
    /// Residual filters; an item that fails them reads as absent.
    pub filters: Vec<FilterCondition>,
}

/// Secondary index query, one partition, sorted on `createdAt`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexQueryRequest {
    pub table: String,
    pub index_name: String,
    /// Attribute the index is partitioned on.
    pub partition_attribute: String,
    pub partition_value: String,
    pub filters: Vec<FilterCondition>,
    /// Newest first when true.
    pub descending: bool,
    pub limit: usize,
    pub cursor: Option<Cursor>,
}

/// Table scan with optional filters, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    pub table: String,
    pub filters: Vec<FilterCondition>,
    pub limit: usize,
    pub cursor: Option<Cursor>,
}

/// Concrete store request for one strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestParams {
    Get(GetRequest),
    IndexQuery(IndexQueryRequest),
    Scan(ScanRequest),
}

/// A strategy plus the request that implements it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub collection: String,
    pub strategy: RetrievalStrategy,
    pub params: RequestParams,
    /// Effective page size after defaulting and clamping.
    pub limit: usize,
}

// ============================================================================
// SELECTOR
// ============================================================================

/// Pure planner from predicates to a [`QueryPlan`].
#[derive(Debug, Clone)]
pub struct QueryStrategySelector {
    registry: Arc<CollectionRegistry>,
    pagination: PaginationSettings,
}

impl QueryStrategySelector {
    pub fn new(registry: Arc<CollectionRegistry>, pagination: PaginationSettings) -> Self {
        Self {
            registry,
            pagination,
        }
    }

    pub fn registry(&self) -> &CollectionRegistry {
        &self.registry
    }

    /// Resolve the requested page size.
    ///
    /// Absent uses the default, non-positive is rejected, anything above the
    /// maximum is clamped.
    pub fn effective_page_size(&self, pagination: &Pagination) -> OnAirResult<usize> {
        match pagination.page_size {
            None => Ok(self.pagination.default_page_size),
            Some(size) if size <= 0 => Err(OnAirError::invalid_argument(
                "page_size",
                format!("must be positive, got {}", size),
            )),
            Some(size) => {
                let size = usize::try_from(size).unwrap_or(usize::MAX);
                Ok(size.min(self.pagination.max_page_size))
            }
        }
    }

    /// Choose the access path for a query.
    pub fn select(
        &self,
        collection: &str,
        predicates: &Predicates,
        pagination: &Pagination,
    ) -> OnAirResult<QueryPlan> {
        let limit = self.effective_page_size(pagination)?;
        let spec = self.registry.resolve(collection)?;
        let table = spec.table.clone();
        let cursor = pagination.cursor.clone();

        if let (Some(id), false) = (&predicates.id, predicates.has_range()) {
            let residual = Predicates {
                id: None,
                ..predicates.clone()
            };
            return Ok(QueryPlan {
                collection: collection.to_string(),
                strategy: RetrievalStrategy::DirectKeyGet,
                params: RequestParams::Get(GetRequest {
                    table,
                    id: id.clone(),
                    filters: residual.as_filters(),
                }),
                limit,
            });
        }

        if let (Some(owner), Some(index)) = (&predicates.owner_id, &spec.owner_index) {
            let residual = Predicates {
                owner_id: None,
                ..predicates.clone()
            };
            return Ok(QueryPlan {
                collection: collection.to_string(),
                strategy: RetrievalStrategy::ByOwnerIndex,
                params: RequestParams::IndexQuery(IndexQueryRequest {
                    table,
                    index_name: index.clone(),
                    partition_attribute: "ownerId".to_string(),
                    partition_value: owner.clone(),
                    filters: residual.as_filters(),
                    descending: true,
                    limit,
                    cursor,
                }),
                limit,
            });
        }

        Ok(scan_plan(collection, table, predicates.as_filters(), limit, cursor))
    }

    /// Re-plan an index query as a scan after the store reported the index
    /// missing. The partition condition becomes an ordinary filter.
    ///
    /// Returns `None` for plans that do not use an index.
    pub fn fallback_for(&self, plan: &QueryPlan) -> Option<QueryPlan> {
        let RequestParams::IndexQuery(request) = &plan.params else {
            return None;
        };
        let mut filters = Vec::with_capacity(request.filters.len() + 1);
        filters.push(FilterCondition::eq(
            request.partition_attribute.clone(),
            Value::String(request.partition_value.clone()),
        ));
        filters.extend(request.filters.iter().cloned());
        Some(scan_plan(
            &plan.collection,
            request.table.clone(),
            filters,
            plan.limit,
            request.cursor.clone(),
        ))
    }
}

fn scan_plan(
    collection: &str,
    table: String,
    filters: Vec<FilterCondition>,
    limit: usize,
    cursor: Option<Cursor>,
) -> QueryPlan {
    let strategy = if filters.iter().any(|f| f.field == "status") {
        RetrievalStrategy::ByStatusFilteredScan
    } else {
        RetrievalStrategy::UnfilteredPaginatedScan
    };
    QueryPlan {
        collection: collection.to_string(),
        strategy,
        params: RequestParams::Scan(ScanRequest {
            table,
            filters,
            limit,
            cursor,
        }),
        limit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onair_core::{ValidationError, OWNER_INDEX};
    use proptest::prelude::*;

    fn selector() -> QueryStrategySelector {
        QueryStrategySelector::new(
            Arc::new(CollectionRegistry::station_defaults()),
            PaginationSettings::default(),
        )
    }

    #[test]
    fn test_id_without_range_is_direct_get() {
        let plan = selector()
            .select("news", &Predicates::new().with_id("n1").with_status("active"), &Pagination::new())
            .expect("plan");
        assert_eq!(plan.strategy, RetrievalStrategy::DirectKeyGet);
        let RequestParams::Get(get) = plan.params else {
            panic!("expected get request");
        };
        assert_eq!(get.id, "n1");
        assert_eq!(get.filters.len(), 1);
        assert_eq!(get.filters[0].field, "status");
    }

    #[test]
    fn test_id_with_range_is_not_direct_get() {
        let predicates = Predicates::new().with_id("n1").with_created_range(Some(0), None);
        let plan = selector().select("news", &predicates, &Pagination::new()).expect("plan");
        assert_eq!(plan.strategy, RetrievalStrategy::UnfilteredPaginatedScan);
    }

    #[test]
    fn test_owner_with_index_queries_index_newest_first() {
        let predicates = Predicates::new().with_owner("alice").with_status("active");
        let plan = selector().select("news", &predicates, &Pagination::new()).expect("plan");
        assert_eq!(plan.strategy, RetrievalStrategy::ByOwnerIndex);
        let RequestParams::IndexQuery(query) = plan.params else {
            panic!("expected index query");
        };
        assert_eq!(query.index_name, OWNER_INDEX);
        assert_eq!(query.partition_value, "alice");
        assert!(query.descending);
        assert_eq!(query.filters, vec![FilterCondition::eq("status", Value::from("active"))]);
    }

    #[test]
    fn test_owner_without_index_and_status_is_filtered_scan() {
        let predicates = Predicates::new().with_owner("alice").with_status("active");
        let plan = selector().select("habillage", &predicates, &Pagination::new()).expect("plan");
        assert_eq!(plan.strategy, RetrievalStrategy::ByStatusFilteredScan);
    }

    #[test]
    fn test_owner_without_index_is_paginated_scan_with_owner_filter() {
        let predicates = Predicates::new().with_owner("alice");
        let plan = selector().select("habillage", &predicates, &Pagination::new()).expect("plan");
        assert_eq!(plan.strategy, RetrievalStrategy::UnfilteredPaginatedScan);
        let RequestParams::Scan(scan) = plan.params else {
            panic!("expected scan");
        };
        assert_eq!(scan.filters, vec![FilterCondition::eq("ownerId", Value::from("alice"))]);
    }

    #[test]
    fn test_no_predicates_is_paginated_scan() {
        let plan = selector().select("blocks", &Predicates::new(), &Pagination::new()).expect("plan");
        assert_eq!(plan.strategy, RetrievalStrategy::UnfilteredPaginatedScan);
        assert_eq!(plan.limit, 20);
    }

    #[test]
    fn test_page_size_clamped_and_validated() {
        let s = selector();
        let plan = s.select("news", &Predicates::new(), &Pagination::page_size(500)).expect("plan");
        assert_eq!(plan.limit, 100);

        for bad in [0, -5] {
            let err = s.select("news", &Predicates::new(), &Pagination::page_size(bad)).unwrap_err();
            assert!(matches!(
                err,
                OnAirError::Validation(ValidationError::InvalidArgument { .. })
            ));
        }
    }

    #[test]
    fn test_unknown_collection_rejected() {
        let err = selector().select("weather", &Predicates::new(), &Pagination::new()).unwrap_err();
        assert!(matches!(
            err,
            OnAirError::Validation(ValidationError::UnknownCollection { .. })
        ));
    }

    #[test]
    fn test_fallback_turns_partition_into_filter() {
        let s = selector();
        let predicates = Predicates::new().with_owner("alice").with_status("active");
        let plan = s.select("news", &predicates, &Pagination::page_size(5)).expect("plan");
        let fallback = s.fallback_for(&plan).expect("index plans have a fallback");
        assert_eq!(fallback.strategy, RetrievalStrategy::ByStatusFilteredScan);
        assert_eq!(fallback.limit, 5);
        let RequestParams::Scan(scan) = fallback.params else {
            panic!("expected scan");
        };
        assert!(scan.filters.contains(&FilterCondition::eq("ownerId", Value::from("alice"))));
        assert!(scan.filters.contains(&FilterCondition::eq("status", Value::from("active"))));

        let owner_only = s.select("news", &Predicates::new().with_owner("bob"), &Pagination::new()).expect("plan");
        assert_eq!(
            s.fallback_for(&owner_only).map(|p| p.strategy),
            Some(RetrievalStrategy::UnfilteredPaginatedScan)
        );

        let scan = s.select("news", &Predicates::new(), &Pagination::new()).expect("plan");
        assert!(s.fallback_for(&scan).is_none());
    }

    fn arb_predicates() -> impl Strategy<Value = Predicates> {
        (
            proptest::option::of("[a-z]{1,4}"),
            proptest::option::of("[a-z]{1,4}"),
            proptest::option::of("[a-z]{1,4}"),
            proptest::option::of("[a-z]{1,4}"),
            any::<bool>(),
        )
            .prop_map(|(id, owner_id, status, category, range)| Predicates {
                id,
                owner_id,
                status,
                category,
                created_range: range.then_some(onair_core::CreatedRange {
                    from: Some(0),
                    to: None,
                }),
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Selection is deterministic and follows the rule order.
        #[test]
        fn prop_selection_follows_rule_order(
            predicates in arb_predicates(),
            collection in prop::sample::select(vec!["news", "habillage"]),
        ) {
            let s = selector();
            let first = s.select(collection, &predicates, &Pagination::new()).expect("plan");
            let second = s.select(collection, &predicates, &Pagination::new()).expect("plan");
            prop_assert_eq!(&first, &second);

            let has_index = collection == "news";
            let expected = if predicates.id.is_some() && !predicates.has_range() {
                RetrievalStrategy::DirectKeyGet
            } else if predicates.owner_id.is_some() && has_index {
                RetrievalStrategy::ByOwnerIndex
            } else if predicates.status.is_some() {
                RetrievalStrategy::ByStatusFilteredScan
            } else {
                RetrievalStrategy::UnfilteredPaginatedScan
            };
            prop_assert_eq!(first.strategy, expected);
        }
    }
}
