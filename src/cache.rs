// src/cache.rs

//! Bounded response cache with per-entry TTL.
//!
//! Entries live in a single `parking_lot` mutex alongside an age index, so
//! lookups are O(1) and evicting the oldest entry is O(log n). No method
//! awaits while the lock is held. A background sweeper removes expired
//! entries that are never requested again.

// dependencies
use crate::clock::{Clock, MonotonicClock, saturating_nanos};
use crate::config::{CacheConfig, saturating_millis};
use crate::errors::{GovernorError, Result};
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Deterministic cache key for a request.
///
/// Renders as `"{METHOD}:{path}:{digest}"`. The digest is a SHA-256 over the
/// method, normalized path, caller identity and the sorted query parameters;
/// the readable prefix keeps keys addressable by glob patterns such as
/// `"GET:/api/employees*"`.
pub fn cache_key<'a, I>(method: &str, path: &str, identity: &str, query: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let method = method.to_ascii_uppercase();
    let path = normalize_path(path);

    let mut params: Vec<(&str, &str)> = query.into_iter().collect();
    params.sort_unstable();

    let mut hasher = Sha256::new();
    for field in [method.as_str(), path.as_str(), identity] {
        hash_field(&mut hasher, field);
    }
    for (name, value) in params {
        hash_field(&mut hasher, name);
        hash_field(&mut hasher, value);
    }

    format!("{}:{}:{}", method, path, hex::encode(hasher.finalize()))
}

// length-prefix every field so ("ab", "c") and ("a", "bc") hash differently
fn hash_field(hasher: &mut Sha256, field: &str) {
    hasher.update((field.len() as u64).to_le_bytes());
    hasher.update(field.as_bytes());
}

/// Collapse repeated slashes and drop a trailing slash.
pub(crate) fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

/// Compile a glob (`*` any run, `?` one char) into an anchored regex.
pub(crate) fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    let mut buf = [0u8; 4];
    for ch in pattern.chars() {
        match ch {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(other.encode_utf8(&mut buf))),
        }
    }
    source.push('$');

    Regex::new(&source).map_err(|source| GovernorError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    inserted_at_nanos: u64,
    ttl_nanos: u64,
    seq: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now_nanos: u64) -> bool {
        now_nanos.saturating_sub(self.inserted_at_nanos) >= self.ttl_nanos
    }

    fn age_key(&self) -> (u64, u64) {
        (self.inserted_at_nanos, self.seq)
    }
}

#[derive(Debug)]
struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    // (inserted_at, insertion sequence) -> key, oldest first
    by_age: BTreeMap<(u64, u64), String>,
    next_seq: u64,
}

impl<V> CacheState<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            by_age: BTreeMap::new(),
            next_seq: 0,
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.by_age.remove(&entry.age_key());
        Some(entry)
    }

    fn pop_oldest(&mut self) -> Option<String> {
        let (_, key) = self.by_age.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }

    fn remove_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&str, &CacheEntry<V>) -> bool,
    {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|(key, entry)| predicate(key.as_str(), *entry))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Snapshot of cache occupancy and activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    #[serde(rename = "defaultTTL")]
    pub default_ttl_ms: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

/// Bounded key → value store with TTL expiry and oldest-first eviction.
#[derive(Debug)]
pub struct ResponseCache<V, C = MonotonicClock>
where
    C: Clock,
{
    state: Mutex<CacheState<V>>,
    max_entries: usize,
    default_ttl: Duration,
    sweep_interval: Duration,
    counters: CacheCounters,
    clock: C,
}

impl<V, C> ResponseCache<V, C>
where
    V: Clone,
    C: Clock,
{
    pub fn with_config(config: CacheConfig, clock: C) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(CacheState::new()),
            max_entries: config.max_entries,
            default_ttl: config.default_ttl_duration(),
            sweep_interval: config.sweep_interval_duration(),
            counters: CacheCounters::default(),
            clock,
        })
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a live entry. A stale entry is removed and reported as a miss,
    /// as is any lookup made while the clock is failing.
    pub fn get(&self, key: &str) -> Option<V> {
        let now_nanos = match self.clock.now() {
            Ok(now) => now,
            Err(error) => {
                warn!(%error, key, "cache clock unavailable, treating lookup as miss");
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let mut state = self.state.lock();
        let expired = match state.entries.get(key) {
            Some(entry) if !entry.is_expired(now_nanos) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            state.remove(key);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or overwrite `key`. When the store is full and `key` is new,
    /// the entry with the oldest insertion time is evicted first.
    /// Never fails: a clock fault drops the write with a warning.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        if ttl.is_zero() {
            debug!(key = %key, "skipping cache write with zero ttl");
            return;
        }
        let now_nanos = match self.clock.now() {
            Ok(now) => now,
            Err(error) => {
                warn!(%error, key = %key, "cache clock unavailable, entry not stored");
                return;
            }
        };

        let mut state = self.state.lock();
        if state.remove(&key).is_none() && state.entries.len() >= self.max_entries {
            if let Some(evicted) = state.pop_oldest() {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(evicted = %evicted, "cache full, evicted oldest entry");
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let entry = CacheEntry {
            value,
            inserted_at_nanos: now_nanos,
            ttl_nanos: saturating_nanos(ttl),
            seq,
        };
        state.by_age.insert(entry.age_key(), key.clone());
        state.entries.insert(key, entry);
    }

    /// Insert with the configured default TTL
    pub fn set_default(&self, key: impl Into<String>, value: V) {
        self.set(key, value, self.default_ttl);
    }

    pub fn delete(&self, key: &str) -> bool {
        self.state.lock().remove(key).is_some()
    }

    /// Remove every key matching a glob pattern, returning how many were removed
    pub fn invalidate_pattern(&self, pattern: &str) -> Result<usize> {
        let regex = glob_to_regex(pattern)?;
        let removed = self.invalidate_regex(&regex);
        debug!(pattern, removed, "invalidated cache entries");
        Ok(removed)
    }

    /// Remove every key matched by `regex`
    pub fn invalidate_regex(&self, regex: &Regex) -> usize {
        self.state
            .lock()
            .remove_where(|key, _| regex.is_match(key))
    }

    /// Remove everything, returning how many entries were dropped
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let removed = state.entries.len();
        *state = CacheState::new();
        info!(removed, "cache cleared");
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            max_size: self.max_entries,
            default_ttl_ms: saturating_millis(self.default_ttl),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
        }
    }

    /// Drop all expired entries. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let now_nanos = match self.clock.now() {
            Ok(now) => now,
            Err(error) => {
                warn!(%error, "cache clock unavailable, skipping sweep");
                return 0;
            }
        };

        let removed = self
            .state
            .lock()
            .remove_where(|_, entry| entry.is_expired(now_nanos));
        self.counters
            .expirations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }
}

impl<V, C> ResponseCache<V, C>
where
    V: Clone + Send + 'static,
    C: Clock + 'static,
{
    /// Sweep expired entries every `sweep_interval` on the tokio runtime.
    /// The task holds only a weak reference and ends once the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let removed = cache.sweep_expired();
                if removed > 0 {
                    debug!(removed, remaining = cache.len(), "cache sweep finished");
                }
            }
        })
    }
}
