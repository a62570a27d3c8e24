// src/governor.rs

//! The governance pipeline.
//!
//! Every request passes through admission, then (for safe methods) the
//! response cache, then the measured handler, and finally cache population:
//!
//! ```text
//! admit ──denied──▶ Rejected (429)
//!   │
//!   ├─ safe method ─▶ cache hit ──▶ FromCache
//!   │                  │ miss
//!   │                  ▼
//!   │                measure(handler) ──ok──▶ cache.set ──▶ Fresh
//!   │                                  └err──▶ Err(E)
//!   │
//!   └─ write ───────▶ measure(handler) ──ok──▶ invalidate related reads ──▶ Fresh
//!                                        └err──▶ Err(E)
//! ```

// dependencies
use crate::cache::{CacheStats, ResponseCache, cache_key, normalize_path};
use crate::clock::{Clock, MonotonicClock};
use crate::config::{GovernorConfig, saturating_millis};
use crate::errors::{GovernorError, Result};
use crate::metrics::{PerformanceMonitor, PerformanceReport, SortBy, ThresholdObserver};
use crate::rate_limiter::{RateLimitDecision, RateLimiter};
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Seconds a rejected caller is told to wait
pub const RETRY_AFTER_SECS: u64 = 1;

/// HTTP method of a governed request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Options,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    /// Side-effect-free methods; only these are served from or written to the cache.
    pub fn is_safe(&self) -> bool {
        matches!(self, Method::Get | Method::Head | Method::Options)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = GovernorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "OPTIONS" => Ok(Method::Options),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            _ => Err(GovernorError::UnsupportedMethod(s.to_string())),
        }
    }
}

/// What the surrounding HTTP layer tells the pipeline about a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestParts {
    pub method: Method,
    pub path: String,
    /// Caller identity: source address or authenticated user id
    pub client_id: String,
    pub query: Vec<(String, String)>,
    /// Metrics name; defaults to `"{METHOD} {path}"`
    pub operation: Option<String>,
    /// Overrides the cache's default TTL for this request
    pub cache_ttl: Option<Duration>,
}

impl RequestParts {
    pub fn new(method: Method, path: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            client_id: client_id.into(),
            query: Vec::new(),
            operation: None,
            cache_ttl: None,
        }
    }

    /// Builder-style: add a query parameter
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Builder-style: name the operation for metrics
    pub fn operation(mut self, name: impl Into<String>) -> Self {
        self.operation = Some(name.into());
        self
    }

    /// Builder-style: per-request cache TTL
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn cache_key(&self) -> String {
        cache_key(
            self.method.as_str(),
            &self.path,
            &self.client_id,
            self.query.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        )
    }

    pub fn operation_name(&self) -> String {
        match &self.operation {
            Some(name) => name.clone(),
            None => format!("{} {}", self.method, normalize_path(&self.path)),
        }
    }
}

/// `X-RateLimit-Limit` / `X-RateLimit-Remaining` values for the response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
}

impl RateLimitHeaders {
    pub fn to_pairs(&self) -> [(&'static str, String); 2] {
        [
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
        ]
    }
}

impl From<&RateLimitDecision> for RateLimitHeaders {
    fn from(decision: &RateLimitDecision) -> Self {
        Self {
            limit: decision.limit,
            remaining: decision.remaining,
        }
    }
}

/// The 429 response for a denied request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub retry_after_secs: u64,
}

impl Rejection {
    pub const STATUS: u16 = 429;

    pub fn status(&self) -> u16 {
        Self::STATUS
    }

    pub fn body(&self) -> Value {
        json!({
            "status": "error",
            "message": "Too many requests",
            "retryAfter": self.retry_after_secs,
        })
    }

    pub fn retry_after_header(&self) -> (&'static str, String) {
        ("Retry-After", self.retry_after_secs.to_string())
    }
}

impl Default for Rejection {
    fn default() -> Self {
        Self {
            retry_after_secs: RETRY_AFTER_SECS,
        }
    }
}

/// How a request was answered
#[derive(Debug, Clone, PartialEq)]
pub enum Served<T> {
    Rejected(Rejection),
    FromCache(T),
    Fresh(T),
}

/// Pipeline output: the answer plus the rate-limit headers to attach to it
#[derive(Debug, Clone, PartialEq)]
pub struct Governed<T> {
    pub served: Served<T>,
    pub rate_limit: RateLimitHeaders,
}

impl<T> Governed<T> {
    pub fn is_rejected(&self) -> bool {
        matches!(self.served, Served::Rejected(_))
    }

    /// The handler's (or the cache's) value, if the request was not rejected
    pub fn into_value(self) -> Option<T> {
        match self.served {
            Served::FromCache(value) | Served::Fresh(value) => Some(value),
            Served::Rejected(_) => None,
        }
    }
}

/// Rate limiter, response cache and performance monitor composed as middleware.
/// Cloning is cheap; clones share the same state.
#[derive(Debug, Clone)]
pub struct Governor<C = MonotonicClock>
where
    C: Clock + Clone,
{
    limiter: Arc<RateLimiter<String, C>>,
    cache: Arc<ResponseCache<Value, C>>,
    monitor: Arc<PerformanceMonitor<C>>,
    // bumped before every write invalidation; readers that saw it move drop their entry
    write_epoch: Arc<AtomicU64>,
}

impl Governor<MonotonicClock> {
    pub fn new(config: GovernorConfig) -> Result<Self> {
        Self::with_clock(config, MonotonicClock::new())
    }
}

impl<C> Governor<C>
where
    C: Clock + Clone,
{
    /// Build all three components on a shared clock
    pub fn with_clock(config: GovernorConfig, clock: C) -> Result<Self> {
        config.validate()?;
        config.log_summary();
        Ok(Self {
            limiter: Arc::new(RateLimiter::with_config(
                config.rate_limiter,
                clock.clone(),
            )?),
            cache: Arc::new(ResponseCache::with_config(config.cache, clock.clone())?),
            monitor: Arc::new(PerformanceMonitor::with_config(config.metrics, clock)?),
            write_epoch: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Compose pre-built components, e.g. ones shared with other pipelines
    pub fn from_parts(
        limiter: Arc<RateLimiter<String, C>>,
        cache: Arc<ResponseCache<Value, C>>,
        monitor: Arc<PerformanceMonitor<C>>,
    ) -> Self {
        Self {
            limiter,
            cache,
            monitor,
            write_epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter<String, C>> {
        &self.limiter
    }

    pub fn cache(&self) -> &Arc<ResponseCache<Value, C>> {
        &self.cache
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor<C>> {
        &self.monitor
    }

    /// Run `handler` under admission control, caching and measurement.
    ///
    /// Handler errors come back unchanged as `Err`. Cache faults never
    /// surface: an unserializable result is simply not cached, and an
    /// unreadable cached payload is dropped and treated as a miss.
    /// If this future is dropped mid-handler the sample is recorded as a
    /// cancelled failure and nothing is cached. A read that overlaps a
    /// successful write through this governor does not leave its result
    /// in the cache.
    pub async fn handle<T, E, F, Fut>(
        &self,
        request: &RequestParts,
        handler: F,
    ) -> std::result::Result<Governed<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let decision = self.limiter.admit(request.client_id.clone());
        let rate_limit = RateLimitHeaders::from(&decision);
        if !decision.allowed {
            warn!(
                client = %request.client_id,
                method = %request.method,
                path = %request.path,
                "rate limit exceeded"
            );
            return Ok(Governed {
                served: Served::Rejected(Rejection::default()),
                rate_limit,
            });
        }

        let operation = request.operation_name();

        if !request.method.is_safe() {
            let value = self.monitor.measure(&operation, handler()).await?;
            self.invalidate_related(&request.path);
            return Ok(Governed {
                served: Served::Fresh(value),
                rate_limit,
            });
        }

        let key = request.cache_key();
        if let Some(payload) = self.cache.get(&key) {
            match serde_json::from_value::<T>(payload) {
                Ok(value) => {
                    debug!(key = %key, "served from cache");
                    return Ok(Governed {
                        served: Served::FromCache(value),
                        rate_limit,
                    });
                }
                Err(error) => {
                    warn!(%error, key = %key, "cached payload unreadable, dropping entry");
                    self.cache.delete(&key);
                }
            }
        }

        let epoch = self.write_epoch.load(Ordering::Acquire);
        let value = self.monitor.measure(&operation, handler()).await?;

        match serde_json::to_value(&value) {
            Ok(payload) => {
                let ttl = request.cache_ttl.unwrap_or(self.cache.default_ttl());
                self.cache.set(key.clone(), payload, ttl);
                // a write landed while the handler ran; its invalidation may
                // have missed this entry
                if self.write_epoch.load(Ordering::Acquire) != epoch {
                    self.cache.delete(&key);
                    debug!(key = %key, "write overlapped read, dropped fresh entry");
                }
            }
            Err(error) => warn!(%error, key = %key, "response not cacheable, skipping cache write"),
        }

        Ok(Governed {
            served: Served::Fresh(value),
            rate_limit,
        })
    }

    // drop cached reads of the written resource, its sub-resources and its parent collection
    fn invalidate_related(&self, path: &str) -> usize {
        self.write_epoch.fetch_add(1, Ordering::AcqRel);

        let regex = match related_keys_regex(path) {
            Ok(regex) => regex,
            Err(error) => {
                warn!(%error, path, "skipping cache invalidation");
                return 0;
            }
        };
        let removed = self.cache.invalidate_regex(&regex);
        if removed > 0 {
            debug!(path, removed, "invalidated cached reads after write");
        }
        removed
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) -> usize {
        self.cache.clear()
    }

    pub fn invalidate_cache_pattern(&self, pattern: &str) -> Result<usize> {
        let removed = self.cache.invalidate_pattern(pattern)?;
        info!(pattern, removed, "cache pattern invalidated");
        Ok(removed)
    }

    pub fn performance_report(&self, limit: usize, sort_by: SortBy) -> PerformanceReport {
        self.monitor.report(limit, sort_by)
    }

    pub fn set_performance_threshold(&self, name: impl Into<String>, threshold: Duration) {
        let name = name.into();
        info!(operation = %name, threshold_ms = saturating_millis(threshold), "performance threshold set");
        self.monitor.set_threshold(name, threshold);
    }

    pub fn subscribe_thresholds<O>(&self, observer: O)
    where
        O: ThresholdObserver + 'static,
    {
        self.monitor.subscribe(observer);
    }
}

impl<C> Governor<C>
where
    C: Clock + Clone + 'static,
{
    /// Start the cache sweeper and the idle-bucket pruner on the current
    /// tokio runtime. Both run every cache sweep interval and stop when the
    /// returned handle is dropped.
    pub fn spawn_background_tasks(&self) -> BackgroundTasks {
        let sweeper = self.cache.spawn_sweeper();

        let limiter = Arc::downgrade(&self.limiter);
        let period = self.cache.sweep_interval();
        let pruner = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                if let Err(error) = limiter.prune_idle_buckets() {
                    warn!(%error, "bucket pruning skipped");
                }
            }
        });

        info!(interval_ms = saturating_millis(period), "governor background tasks started");
        BackgroundTasks {
            handles: vec![sweeper, pruner],
        }
    }
}

// Matches keys of any method and caller for `path`, anything below it and its
// parent. The path is matched literally.
fn related_keys_regex(path: &str) -> std::result::Result<Regex, regex::Error> {
    let path = normalize_path(path);
    let mut targets = vec![
        regex::escape(&path),
        format!("{}/.*", regex::escape(&path)),
    ];
    if let Some((parent, _)) = path.rsplit_once('/') {
        let parent = if parent.is_empty() { "/" } else { parent };
        if parent != path {
            targets.push(regex::escape(parent));
        }
    }
    Regex::new(&format!("^[^:]+:(?:{}):[0-9a-f]{{64}}$", targets.join("|")))
}

/// Handles to the periodic maintenance tasks; aborts them on drop.
#[derive(Debug)]
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
