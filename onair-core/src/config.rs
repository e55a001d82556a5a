//! Configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ConfigError, OnAirError, OnAirResult};

/// Cache sizing and staleness bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Time-to-live for every cached entry, in milliseconds.
    pub ttl_ms: u64,
    /// Maximum number of resident entries before LRU eviction.
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_ms: 5 * 60 * 1000,
            max_entries: 100,
        }
    }
}

/// Store batch limits and chunk retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Keys per batch-get request.
    pub get_limit: usize,
    /// Items per batch-write request.
    pub write_limit: usize,
    /// Total attempts per failing write chunk (first try included).
    pub max_attempts: u32,
    /// Backoff before the first retry, in milliseconds. Doubles per retry.
    pub base_backoff_ms: u64,
    /// Upper bound on a single backoff, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            get_limit: 100,
            write_limit: 25,
            max_attempts: 3,
            base_backoff_ms: 200,
            max_backoff_ms: 2_000,
        }
    }
}

impl BatchSettings {
    /// Backoff to wait before retry number `retry` (1-based), capped.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.base_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }
}

/// Page size bounds for unfiltered and filtered reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationSettings {
    pub default_page_size: usize,
    pub max_page_size: usize,
}

impl Default for PaginationSettings {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 100,
        }
    }
}

/// Master configuration for the cached query layer.
///
/// Plain values only; nothing is read from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    pub cache: CacheSettings,
    pub batch: BatchSettings,
    pub pagination: PaginationSettings,
}

impl LayerConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document. Missing sections and keys keep their defaults.
    pub fn from_toml_str(source: &str) -> OnAirResult<Self> {
        let config: LayerConfig = toml::from_str(source).map_err(|e| {
            OnAirError::Config(ConfigError::Parse {
                reason: e.to_string(),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Set the cache TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.cache.ttl_ms = ttl.as_millis() as u64;
        self
    }

    /// Set the maximum number of cache entries.
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.cache.max_entries = max;
        self
    }

    /// Set both batch limits.
    pub fn with_batch_limits(mut self, get_limit: usize, write_limit: usize) -> Self {
        self.batch.get_limit = get_limit;
        self.batch.write_limit = write_limit;
        self
    }

    /// Set the chunk retry policy.
    pub fn with_retry(mut self, max_attempts: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        self.batch.max_attempts = max_attempts;
        self.batch.base_backoff_ms = base_backoff.as_millis() as u64;
        self.batch.max_backoff_ms = max_backoff.as_millis() as u64;
        self
    }

    /// Set the page size bounds.
    pub fn with_page_sizes(mut self, default_page_size: usize, max_page_size: usize) -> Self {
        self.pagination.default_page_size = default_page_size;
        self.pagination.max_page_size = max_page_size;
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.cache.ttl_ms)
    }

    /// Validate the configuration.
    /// Returns Ok(()) if valid, Err(OnAirError::Config) if invalid.
    pub fn validate(&self) -> OnAirResult<()> {
        positive("cache.ttl_ms", self.cache.ttl_ms)?;
        positive("cache.max_entries", self.cache.max_entries as u64)?;
        positive("batch.get_limit", self.batch.get_limit as u64)?;
        positive("batch.write_limit", self.batch.write_limit as u64)?;
        positive("batch.max_attempts", u64::from(self.batch.max_attempts))?;
        positive("pagination.default_page_size", self.pagination.default_page_size as u64)?;
        positive("pagination.max_page_size", self.pagination.max_page_size as u64)?;

        if self.batch.max_backoff_ms < self.batch.base_backoff_ms {
            return Err(invalid(
                "batch.max_backoff_ms",
                self.batch.max_backoff_ms,
                "max_backoff_ms must be at least base_backoff_ms",
            ));
        }

        if self.pagination.default_page_size > self.pagination.max_page_size {
            return Err(invalid(
                "pagination.default_page_size",
                self.pagination.default_page_size,
                "default_page_size must not exceed max_page_size",
            ));
        }

        Ok(())
    }
}

fn positive(field: &str, value: u64) -> OnAirResult<()> {
    if value == 0 {
        return Err(invalid(field, value, "must be greater than 0"));
    }
    Ok(())
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> OnAirError {
    OnAirError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LayerConfig::default();
        assert_eq!(config.ttl(), Duration::from_secs(300));
        assert_eq!(config.cache.max_entries, 100);
        assert_eq!(config.batch.get_limit, 100);
        assert_eq!(config.batch.write_limit, 25);
        assert_eq!(config.batch.max_attempts, 3);
        assert_eq!(config.pagination.default_page_size, 20);
        assert_eq!(config.pagination.max_page_size, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = LayerConfig::new()
            .with_ttl(Duration::from_secs(60))
            .with_max_entries(10)
            .with_batch_limits(50, 10)
            .with_retry(5, Duration::from_millis(10), Duration::from_millis(80))
            .with_page_sizes(5, 50);
        assert_eq!(config.cache.ttl_ms, 60_000);
        assert_eq!(config.cache.max_entries, 10);
        assert_eq!(config.batch.get_limit, 50);
        assert_eq!(config.batch.write_limit, 10);
        assert_eq!(config.batch.max_attempts, 5);
        assert_eq!(config.pagination.default_page_size, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let batch = BatchSettings::default();
        assert_eq!(batch.backoff_for(1), Duration::from_millis(200));
        assert_eq!(batch.backoff_for(2), Duration::from_millis(400));
        assert_eq!(batch.backoff_for(3), Duration::from_millis(800));
        assert_eq!(batch.backoff_for(10), Duration::from_millis(2_000));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = LayerConfig::new().with_max_entries(0);
        let err = config.validate().unwrap_err();
        assert!(format!("{}", err).contains("cache.max_entries"));

        let config = LayerConfig::new().with_batch_limits(100, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_incoherent_values() {
        let config = LayerConfig::new().with_page_sizes(200, 100);
        assert!(config.validate().is_err());

        let config =
            LayerConfig::new().with_retry(3, Duration::from_millis(500), Duration::from_millis(100));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = LayerConfig::from_toml_str(
            r#"
            [cache]
            ttl_ms = 2000
            max_entries = 2

            [batch]
            write_limit = 10
            "#,
        )
        .expect("valid toml");
        assert_eq!(config.cache.ttl_ms, 2_000);
        assert_eq!(config.cache.max_entries, 2);
        assert_eq!(config.batch.write_limit, 10);
        assert_eq!(config.batch.get_limit, 100);
        assert_eq!(config.pagination.default_page_size, 20);
    }

    #[test]
    fn test_from_toml_invalid() {
        let err = LayerConfig::from_toml_str("[cache]\nttl_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, OnAirError::Config(ConfigError::Parse { .. })));

        let err = LayerConfig::from_toml_str("[cache]\nttl_ms = 0").unwrap_err();
        assert!(matches!(err, OnAirError::Config(ConfigError::InvalidValue { .. })));
    }
}
