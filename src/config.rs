// src/config.rs

//! Configuration types for the governance layer.
//!
//! Every component has its own builder-style config with a `validate`
//! method; [`GovernorConfig`] bundles them and can be read from JSON using
//! the camelCase option names (`capacity`, `refillRatePerSecond`,
//! `cacheMaxEntries`, `cacheDefaultTTLms`, ...) or from `GOVERNOR_*`
//! environment variables.

// dependencies
use crate::errors::{GovernorError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

const DEFAULT_CAPACITY: u64 = 100;
const DEFAULT_REFILL_RATE: f64 = 10.0;
const DEFAULT_MAX_BUCKETS: usize = 10_000;
const DEFAULT_BUCKET_IDLE_TTL_MS: u64 = 10 * 60 * 1000;
const DEFAULT_CACHE_MAX_ENTRIES: usize = 1000;
const DEFAULT_CACHE_TTL_MS: u64 = 5 * 60 * 1000;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 10 * 60 * 1000;
const DEFAULT_RETAINED_PER_NAME: usize = 1000;
const DEFAULT_MAX_TOTAL_SAMPLES: usize = 10_000;

// milliseconds in `duration`, saturating at `u64::MAX`
pub(crate) fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Configuration for token-bucket admission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimiterConfig {
    pub(crate) capacity: u64,
    pub(crate) refill_rate_per_second: f64,
    pub(crate) max_buckets: usize,
    #[serde(rename = "bucketIdleTtlMs")]
    pub(crate) idle_bucket_ttl_ms: u64,
}

impl RateLimiterConfig {
    /// Create a new configuration with capacity and refill settings
    pub fn new(capacity: u64, refill_rate_per_second: f64) -> Self {
        Self {
            capacity,
            refill_rate_per_second,
            ..Self::default()
        }
    }

    /// Builder-style: set bucket capacity
    pub fn capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Builder-style: set tokens added per second
    pub fn refill_rate(mut self, refill_rate_per_second: f64) -> Self {
        self.refill_rate_per_second = refill_rate_per_second;
        self
    }

    /// Builder-style: cap the number of tracked clients
    pub fn max_buckets(mut self, max_buckets: usize) -> Self {
        self.max_buckets = max_buckets;
        self
    }

    /// Builder-style: idle time after which a bucket may be pruned
    pub fn idle_bucket_ttl(mut self, ttl: Duration) -> Self {
        self.idle_bucket_ttl_ms = saturating_millis(ttl);
        self
    }

    pub fn idle_bucket_ttl_duration(&self) -> Duration {
        Duration::from_millis(self.idle_bucket_ttl_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(GovernorError::InvalidCapacity);
        }
        if !self.refill_rate_per_second.is_finite() || self.refill_rate_per_second <= 0.0 {
            return Err(GovernorError::InvalidRefillRate);
        }
        if self.max_buckets == 0 {
            return Err(GovernorError::InvalidBucketBound);
        }
        if self.idle_bucket_ttl_ms == 0 {
            return Err(GovernorError::InvalidTtl);
        }
        Ok(())
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            refill_rate_per_second: DEFAULT_REFILL_RATE,
            max_buckets: DEFAULT_MAX_BUCKETS,
            idle_bucket_ttl_ms: DEFAULT_BUCKET_IDLE_TTL_MS,
        }
    }
}

/// Configuration for the response cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(rename = "cacheMaxEntries")]
    pub(crate) max_entries: usize,
    #[serde(rename = "cacheDefaultTTLms")]
    pub(crate) default_ttl_ms: u64,
    #[serde(rename = "cacheSweepIntervalMs")]
    pub(crate) sweep_interval_ms: u64,
}

impl CacheConfig {
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            max_entries,
            default_ttl_ms: saturating_millis(default_ttl),
            ..Self::default()
        }
    }

    /// Builder-style: set the entry bound
    pub fn max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Builder-style: set the TTL used by `set_default`
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl_ms = saturating_millis(ttl);
        self
    }

    /// Builder-style: set the background sweep period
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = saturating_millis(interval);
        self
    }

    pub fn default_ttl_duration(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn sweep_interval_duration(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(GovernorError::InvalidCacheSize);
        }
        if self.default_ttl_ms == 0 {
            return Err(GovernorError::InvalidTtl);
        }
        if self.sweep_interval_ms == 0 {
            return Err(GovernorError::InvalidSweepInterval);
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            default_ttl_ms: DEFAULT_CACHE_TTL_MS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
        }
    }
}

/// Configuration for sample retention in the performance monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    #[serde(rename = "metricsRetainedSamplesPerName")]
    pub(crate) retained_samples_per_name: usize,
    #[serde(rename = "metricsMaxTotalSamples")]
    pub(crate) max_total_samples: usize,
}

impl MetricsConfig {
    pub fn new(retained_samples_per_name: usize, max_total_samples: usize) -> Self {
        Self {
            retained_samples_per_name,
            max_total_samples,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.retained_samples_per_name == 0 || self.max_total_samples == 0 {
            return Err(GovernorError::InvalidRetention);
        }
        Ok(())
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            retained_samples_per_name: DEFAULT_RETAINED_PER_NAME,
            max_total_samples: DEFAULT_MAX_TOTAL_SAMPLES,
        }
    }
}

/// Complete governance configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GovernorConfig {
    #[serde(flatten)]
    pub rate_limiter: RateLimiterConfig,
    #[serde(flatten)]
    pub cache: CacheConfig,
    #[serde(flatten)]
    pub metrics: MetricsConfig,
}

impl GovernorConfig {
    /// Parse and validate a JSON options object. Missing options keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load overrides from `GOVERNOR_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source. Values that fail to
    /// parse are ignored and the default is kept.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            name: &str,
        ) -> Option<T> {
            lookup(name).and_then(|v| v.trim().parse().ok())
        }

        let mut config = Self::default();
        let rl = &mut config.rate_limiter;
        if let Some(v) = parsed(&lookup, "GOVERNOR_CAPACITY") {
            rl.capacity = v;
        }
        if let Some(v) = parsed(&lookup, "GOVERNOR_REFILL_RATE_PER_SECOND") {
            rl.refill_rate_per_second = v;
        }
        if let Some(v) = parsed(&lookup, "GOVERNOR_MAX_BUCKETS") {
            rl.max_buckets = v;
        }
        if let Some(v) = parsed(&lookup, "GOVERNOR_BUCKET_IDLE_TTL_MS") {
            rl.idle_bucket_ttl_ms = v;
        }

        let cache = &mut config.cache;
        if let Some(v) = parsed(&lookup, "GOVERNOR_CACHE_MAX_ENTRIES") {
            cache.max_entries = v;
        }
        if let Some(v) = parsed(&lookup, "GOVERNOR_CACHE_DEFAULT_TTL_MS") {
            cache.default_ttl_ms = v;
        }
        if let Some(v) = parsed(&lookup, "GOVERNOR_CACHE_SWEEP_INTERVAL_MS") {
            cache.sweep_interval_ms = v;
        }

        let metrics = &mut config.metrics;
        if let Some(v) = parsed(&lookup, "GOVERNOR_METRICS_RETAINED_SAMPLES_PER_NAME") {
            metrics.retained_samples_per_name = v;
        }
        if let Some(v) = parsed(&lookup, "GOVERNOR_METRICS_MAX_TOTAL_SAMPLES") {
            metrics.max_total_samples = v;
        }

        config
    }

    /// Validate every component configuration
    pub fn validate(&self) -> Result<()> {
        self.rate_limiter.validate()?;
        self.cache.validate()?;
        self.metrics.validate()?;
        Ok(())
    }

    pub(crate) fn log_summary(&self) {
        info!(
            capacity = self.rate_limiter.capacity,
            refill_rate_per_second = self.rate_limiter.refill_rate_per_second,
            max_buckets = self.rate_limiter.max_buckets,
            cache_max_entries = self.cache.max_entries,
            cache_default_ttl_ms = self.cache.default_ttl_ms,
            cache_sweep_interval_ms = self.cache.sweep_interval_ms,
            retained_samples_per_name = self.metrics.retained_samples_per_name,
            max_total_samples = self.metrics.max_total_samples,
            "governor configuration loaded"
        );
    }
}
