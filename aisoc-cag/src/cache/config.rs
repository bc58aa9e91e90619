//! Configuration for the cache store

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CagError, Result};

/// Configuration for the knowledge-cache store
///
/// - Default TTL: 1 hour, with 12.5% jitter so entries built together do not
///   all expire and rebuild together
/// - Prefix states are large, so the entry limit is small
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Default time-to-live for cache entries
    pub default_ttl: Duration,

    /// Maximum number of entries in the store
    pub max_entries: usize,

    /// Maximum total size of cached states and units in bytes
    pub max_size_bytes: usize,

    /// TTL jitter factor (0.0 - 1.0)
    pub ttl_jitter: f64,

    /// Enable automatic cleanup of expired entries
    pub enable_auto_cleanup: bool,

    /// Interval for automatic cleanup checks
    pub cleanup_interval: Duration,

    /// When true, least recently used entries are evicted first;
    /// otherwise the oldest entry goes
    pub enable_lru_eviction: bool,

    /// Enable hit/miss accounting
    pub enable_metrics: bool,

    /// Directory for durable entries; `None` keeps the store in memory
    pub persist_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            max_entries: 64,
            // 512 MB
            max_size_bytes: 512 * 1024 * 1024,
            ttl_jitter: 0.125,
            enable_auto_cleanup: true,
            // Cleanup every 5 minutes
            cleanup_interval: Duration::from_secs(300),
            enable_lru_eviction: true,
            enable_metrics: true,
            persist_dir: None,
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(CagError::ConfigError(
                "max_entries must be greater than 0".to_string(),
            ));
        }

        if self.max_size_bytes == 0 {
            return Err(CagError::ConfigError(
                "max_size_bytes must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.ttl_jitter) {
            return Err(CagError::ConfigError(
                "ttl_jitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.default_ttl.is_zero() {
            return Err(CagError::ConfigError(
                "default_ttl must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Calculate actual TTL with jitter applied
    pub fn ttl_with_jitter(&self) -> Duration {
        if self.ttl_jitter == 0.0 {
            return self.default_ttl;
        }

        let base_secs = self.default_ttl.as_secs_f64();
        let jitter_range = base_secs * self.ttl_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_secs = (base_secs + jitter).max(1.0);

        Duration::from_secs_f64(final_secs)
    }
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    default_ttl: Option<Duration>,
    max_entries: Option<usize>,
    max_size_bytes: Option<usize>,
    ttl_jitter: Option<f64>,
    enable_auto_cleanup: Option<bool>,
    cleanup_interval: Option<Duration>,
    enable_lru_eviction: Option<bool>,
    enable_metrics: Option<bool>,
    persist_dir: Option<PathBuf>,
}

impl CacheConfigBuilder {
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    pub fn max_size_bytes(mut self, size: usize) -> Self {
        self.max_size_bytes = Some(size);
        self
    }

    /// Set TTL jitter factor (0.0 - 1.0)
    pub fn ttl_jitter(mut self, jitter: f64) -> Self {
        self.ttl_jitter = Some(jitter);
        self
    }

    pub fn enable_auto_cleanup(mut self, enable: bool) -> Self {
        self.enable_auto_cleanup = Some(enable);
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    pub fn enable_lru_eviction(mut self, enable: bool) -> Self {
        self.enable_lru_eviction = Some(enable);
        self
    }

    pub fn enable_metrics(mut self, enable: bool) -> Self {
        self.enable_metrics = Some(enable);
        self
    }

    /// Persist entries under `dir`
    pub fn persist_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persist_dir = Some(dir.into());
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            default_ttl: self.default_ttl.unwrap_or(defaults.default_ttl),
            max_entries: self.max_entries.unwrap_or(defaults.max_entries),
            max_size_bytes: self.max_size_bytes.unwrap_or(defaults.max_size_bytes),
            ttl_jitter: self.ttl_jitter.unwrap_or(defaults.ttl_jitter),
            enable_auto_cleanup: self
                .enable_auto_cleanup
                .unwrap_or(defaults.enable_auto_cleanup),
            cleanup_interval: self.cleanup_interval.unwrap_or(defaults.cleanup_interval),
            enable_lru_eviction: self
                .enable_lru_eviction
                .unwrap_or(defaults.enable_lru_eviction),
            enable_metrics: self.enable_metrics.unwrap_or(defaults.enable_metrics),
            persist_dir: self.persist_dir.or(defaults.persist_dir),
        }
    }
}

/// Preset configurations
impl CacheConfig {
    /// Live dashboards over a fast-moving alert stream
    pub fn realtime() -> Self {
        Self {
            default_ttl: Duration::from_secs(300), // 5 minutes
            max_entries: 16,
            ttl_jitter: 0.15,
            cleanup_interval: Duration::from_secs(60),
            ..Default::default()
        }
    }

    /// Daily summaries, ~23 hours
    pub fn daily() -> Self {
        Self {
            default_ttl: Duration::from_secs(23 * 3600),
            max_entries: 128,
            max_size_bytes: 1024 * 1024 * 1024,
            ttl_jitter: 0.10,
            ..Default::default()
        }
    }

    /// Preset by name: `realtime`, `daily`, `small` or `default`
    pub fn preset(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "realtime" => Ok(Self::realtime()),
            "daily" => Ok(Self::daily()),
            "small" => Ok(Self::small()),
            "default" => Ok(Self::default()),
            other => Err(CagError::ConfigError(format!(
                "unknown cache preset '{}' (expected realtime, daily, small or default)",
                other
            ))),
        }
    }

    /// Memory-constrained hosts
    pub fn small() -> Self {
        Self {
            default_ttl: Duration::from_secs(1800), // 30 minutes
            max_entries: 4,
            max_size_bytes: 64 * 1024 * 1024,
            ttl_jitter: 0.15,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.default_ttl, Duration::from_secs(3600));
        assert_eq!(config.ttl_jitter, 0.125);
        assert!(config.enable_auto_cleanup);
        assert!(config.persist_dir.is_none());
    }

    #[test]
    fn test_config_validation() {
        assert!(CacheConfig::default().validate().is_ok());

        let mut invalid_config = CacheConfig::default();
        invalid_config.max_entries = 0;
        assert!(matches!(
            invalid_config.validate(),
            Err(CagError::ConfigError(_))
        ));

        let mut invalid_config = CacheConfig::default();
        invalid_config.ttl_jitter = 1.5;
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = CacheConfig::default();
        invalid_config.default_ttl = Duration::ZERO;
        assert!(invalid_config.validate().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::builder()
            .default_ttl(Duration::from_secs(600))
            .max_entries(8)
            .max_size_bytes(50_000_000)
            .persist_dir("/tmp/cag")
            .build();

        assert_eq!(config.default_ttl, Duration::from_secs(600));
        assert_eq!(config.max_entries, 8);
        assert_eq!(config.max_size_bytes, 50_000_000);
        assert_eq!(config.persist_dir, Some(PathBuf::from("/tmp/cag")));
    }

    #[test]
    fn test_ttl_with_jitter() {
        let config = CacheConfig {
            default_ttl: Duration::from_secs(3600),
            ttl_jitter: 0.1,
            ..Default::default()
        };

        for _ in 0..20 {
            let ttl = config.ttl_with_jitter();
            assert!(ttl.as_secs_f64() >= 3600.0 - 360.0);
            assert!(ttl.as_secs_f64() <= 3600.0 + 360.0);
        }

        let fixed = CacheConfig::builder().ttl_jitter(0.0).build();
        assert_eq!(fixed.ttl_with_jitter(), fixed.default_ttl);
    }

    #[test]
    fn test_preset_configs() {
        assert_eq!(CacheConfig::realtime().default_ttl, Duration::from_secs(300));
        assert_eq!(CacheConfig::daily().default_ttl, Duration::from_secs(23 * 3600));
        assert_eq!(CacheConfig::small().max_entries, 4);
        assert!(CacheConfig::small().validate().is_ok());
    }

    #[test]
    fn test_preset_by_name() {
        assert_eq!(CacheConfig::preset("Daily").unwrap().max_entries, 128);
        assert_eq!(CacheConfig::preset(" small ").unwrap().max_entries, 4);
        assert_eq!(
            CacheConfig::preset("default").unwrap().default_ttl,
            Duration::from_secs(3600)
        );
        assert!(matches!(
            CacheConfig::preset("weekly"),
            Err(CagError::ConfigError(_))
        ));
    }
}
