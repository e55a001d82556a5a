//! Error types for OnAir operations

use crate::item::Item;
use thiserror::Error;

/// Errors raised at or behind the backing store boundary.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error(
        "Concurrent modification of {collection}/{id}: expected updatedAt {expected:?}, found {actual:?}"
    )]
    ConcurrentModification {
        collection: String,
        id: String,
        expected: Option<i64>,
        actual: Option<i64>,
    },

    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Index unavailable: {index}")]
    IndexUnavailable { index: String },

    #[error("Partial batch failure: {} written, {} failed ({failed_ids:?})", .succeeded.len(), .failed_ids.len())]
    PartialBatchFailure {
        succeeded: Vec<Item>,
        failed_ids: Vec<String>,
    },

    #[error("Store call cancelled")]
    Cancelled,

    #[error("Store call exceeded its deadline")]
    DeadlineExceeded,
}

/// Validation errors, always raised before any I/O.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid argument {field}: {reason}")]
    InvalidArgument { field: String, reason: String },

    #[error("Unknown collection: {collection}")]
    UnknownCollection { collection: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Master error type for all OnAir errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OnAirError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl OnAirError {
    /// Shorthand for an `InvalidArgument` validation error.
    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        OnAirError::Validation(ValidationError::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        })
    }

    /// Shorthand for a `StoreUnavailable` error.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        OnAirError::Store(StoreError::Unavailable {
            reason: reason.into(),
        })
    }

    /// True when a conditional write lost the race.
    pub fn is_concurrent_modification(&self) -> bool {
        matches!(
            self,
            OnAirError::Store(StoreError::ConcurrentModification { .. })
        )
    }

    /// True for cancellation or deadline expiry.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            OnAirError::Store(StoreError::Cancelled | StoreError::DeadlineExceeded)
        )
    }

    /// True when the store rejected an index lookup because the index is missing.
    pub fn is_index_unavailable(&self) -> bool {
        matches!(self, OnAirError::Store(StoreError::IndexUnavailable { .. }))
    }
}

/// Result type alias for OnAir operations.
pub type OnAirResult<T> = Result<T, OnAirError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrent_modification_display() {
        let err = StoreError::ConcurrentModification {
            collection: "news".to_string(),
            id: "x".to_string(),
            expected: Some(100),
            actual: Some(101),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("news/x"));
        assert!(msg.contains("100"));
        assert!(msg.contains("101"));
    }

    #[test]
    fn test_partial_batch_failure_display() {
        let err = StoreError::PartialBatchFailure {
            succeeded: vec![],
            failed_ids: vec!["a".to_string(), "b".to_string()],
        };
        let msg = format!("{}", err);
        assert!(msg.contains("0 written"));
        assert!(msg.contains("2 failed"));
    }

    #[test]
    fn test_invalid_argument_display() {
        let err = OnAirError::invalid_argument("page_size", "must be positive");
        let msg = format!("{}", err);
        assert!(msg.contains("page_size"));
        assert!(msg.contains("must be positive"));
    }

    #[test]
    fn test_error_classification() {
        let conflict = OnAirError::from(StoreError::ConcurrentModification {
            collection: "blocks".to_string(),
            id: "b1".to_string(),
            expected: None,
            actual: Some(5),
        });
        assert!(conflict.is_concurrent_modification());
        assert!(!conflict.is_cancellation());

        assert!(OnAirError::from(StoreError::Cancelled).is_cancellation());
        assert!(OnAirError::from(StoreError::DeadlineExceeded).is_cancellation());
        assert!(OnAirError::from(StoreError::IndexUnavailable {
            index: "userId-createdAt-index".to_string()
        })
        .is_index_unavailable());
        assert!(!OnAirError::unavailable("network").is_index_unavailable());
    }

    #[test]
    fn test_master_error_from_variants() {
        let store = OnAirError::from(StoreError::Cancelled);
        assert!(matches!(store, OnAirError::Store(_)));

        let validation = OnAirError::from(ValidationError::UnknownCollection {
            collection: "weather".to_string(),
        });
        assert!(matches!(validation, OnAirError::Validation(_)));

        let config = OnAirError::from(ConfigError::Parse {
            reason: "bad toml".to_string(),
        });
        assert!(matches!(config, OnAirError::Config(_)));
    }
}
