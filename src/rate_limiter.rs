// src/rate_limiter.rs

// token-bucket admission control, one bucket per client key

// dependencies
use crate::clock::{Clock, MonotonicClock, saturating_nanos};
use crate::config::RateLimiterConfig;
use crate::errors::Result;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, warn};

const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

/// Per-client bucket state.
#[derive(Debug, Clone, Copy, PartialEq)]
struct TokenBucket {
    tokens: f64,
    last_refill_nanos: u64,
}

impl TokenBucket {
    fn full(capacity: f64, now_nanos: u64) -> Self {
        Self {
            tokens: capacity,
            last_refill_nanos: now_nanos,
        }
    }

    // add the tokens earned since the last refill, capped at capacity
    fn refill(&mut self, now_nanos: u64, capacity: f64, refill_rate: f64) {
        let elapsed_nanos = now_nanos.saturating_sub(self.last_refill_nanos);
        let earned = elapsed_nanos as f64 / NANOS_PER_SECOND * refill_rate;
        self.tokens = (self.tokens + earned).min(capacity);
        self.last_refill_nanos = self.last_refill_nanos.max(now_nanos);
    }
}

/// Per-key token-bucket rate limiter.
/// T is the type used to identify clients (e.g., String, IpAddr, u64).
/// C is the clock type, defaulting to MonotonicClock.
/// Each bucket transition runs under its DashMap shard lock, so a single
/// key is linearized while different keys proceed in parallel.
#[derive(Debug)]
pub struct RateLimiter<T, C = MonotonicClock>
where
    T: Hash + Eq + Clone,
    C: Clock,
{
    capacity: f64,
    refill_rate: f64,
    max_buckets: usize,
    idle_ttl_nanos: u64,
    client_state: Arc<DashMap<T, TokenBucket>>,
    clock: C,
}

// methods for the RateLimiter type
impl<T, C> RateLimiter<T, C>
where
    T: Hash + Eq + Clone,
    C: Clock,
{
    // method to create a new rate limiter from a config object
    pub fn with_config(config: RateLimiterConfig, clock: C) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            capacity: config.capacity as f64,
            refill_rate: config.refill_rate_per_second,
            max_buckets: config.max_buckets,
            idle_ttl_nanos: saturating_nanos(config.idle_bucket_ttl_duration()),
            client_state: Arc::new(DashMap::new()),
            clock,
        })
    }

    // accessor method to return the bucket capacity
    pub fn capacity(&self) -> u64 {
        self.capacity as u64
    }

    // accessor method to return the refill rate in tokens per second
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Number of clients currently holding a bucket
    pub fn tracked_clients(&self) -> usize {
        self.client_state.len()
    }

    /// Forget a client's bucket; its next request starts from a full bucket.
    pub fn reset(&self, client_id: &T) -> bool {
        self.client_state.remove(client_id).is_some()
    }

    /// Refill the client's bucket and try to take one token.
    ///
    /// New clients start with a full bucket. Only a clock failure produces
    /// an error; denial is reported through `RateLimitDecision::allowed`.
    pub fn check_request(&self, client_id: T) -> Result<RateLimitDecision> {
        let now_nanos = self.clock.now()?;

        if !self.client_state.contains_key(&client_id)
            && self.client_state.len() >= self.max_buckets
        {
            self.evict_oldest_bucket();
        }

        let mut bucket = self
            .client_state
            .entry(client_id)
            .or_insert_with(|| TokenBucket::full(self.capacity, now_nanos));
        bucket.refill(now_nanos, self.capacity, self.refill_rate);

        let decision = if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateLimitDecision {
                allowed: true,
                remaining: bucket.tokens.floor() as u64,
                limit: self.capacity(),
                retry_after_seconds: None,
            }
        } else {
            RateLimitDecision {
                allowed: false,
                remaining: bucket.tokens.floor() as u64,
                limit: self.capacity(),
                retry_after_seconds: Some((1.0 - bucket.tokens) / self.refill_rate),
            }
        };

        Ok(decision)
    }

    /// Infallible admission check used on the request path.
    /// A clock failure admits the request and logs a warning.
    pub fn admit(&self, client_id: T) -> RateLimitDecision {
        match self.check_request(client_id) {
            Ok(decision) => decision,
            Err(error) => {
                warn!(%error, "rate limiter clock unavailable, admitting request");
                RateLimitDecision {
                    allowed: true,
                    remaining: self.capacity(),
                    limit: self.capacity(),
                    retry_after_seconds: None,
                }
            }
        }
    }

    // drop the bucket that was refilled longest ago to make room for a new client
    fn evict_oldest_bucket(&self) {
        let oldest = self
            .client_state
            .iter()
            .min_by_key(|entry| entry.value().last_refill_nanos)
            .map(|entry| entry.key().clone());

        if let Some(key) = oldest {
            self.client_state.remove(&key);
            debug!(max_buckets = self.max_buckets, "evicted oldest rate-limit bucket");
        }
    }

    /// Remove clients whose bucket has not been touched for `max_stale_nanos`
    /// and would have refilled to capacity by now. A bucket still owed tokens
    /// is kept, since dropping it would hand the client a full bucket early.
    /// Returns how many buckets were dropped.
    pub fn cleanup_stale_clients(&self, max_stale_nanos: u64) -> Result<usize> {
        let current_time_nanos = self.clock.now()?;
        let before = self.client_state.len();
        self.client_state.retain(|_, bucket| {
            let idle_nanos = current_time_nanos.saturating_sub(bucket.last_refill_nanos);
            idle_nanos < max_stale_nanos || !self.is_refilled(bucket, current_time_nanos)
        });
        Ok(before.saturating_sub(self.client_state.len()))
    }

    // whether the bucket holds a full capacity of tokens at `now_nanos`
    fn is_refilled(&self, bucket: &TokenBucket, now_nanos: u64) -> bool {
        let mut projected = *bucket;
        projected.refill(now_nanos, self.capacity, self.refill_rate);
        projected.tokens >= self.capacity
    }

    /// Remove buckets idle for longer than the configured idle TTL
    pub fn prune_idle_buckets(&self) -> Result<usize> {
        let removed = self.cleanup_stale_clients(self.idle_ttl_nanos)?;
        if removed > 0 {
            debug!(removed, "pruned idle rate-limit buckets");
        }
        Ok(removed)
    }
}

/// Result of an admission check with metadata for HTTP responses
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    /// Whether the request should be allowed
    pub allowed: bool,
    /// Whole tokens left in the bucket after this decision
    pub remaining: u64,
    /// Bucket capacity, reported as `X-RateLimit-Limit`
    pub limit: u64,
    /// Seconds until one token is available (when denied)
    pub retry_after_seconds: Option<f64>,
}
