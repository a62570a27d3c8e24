// src/metrics.rs

//! Rolling latency aggregation with threshold alerts.
//!
//! [`PerformanceMonitor::measure`] wraps a unit of work, times it with the
//! monitor's clock and records one [`MetricSample`] per invocation, whether
//! the work succeeds, fails, panics or is cancelled. Statistics per operation
//! are recomputed from a bounded window of recent samples, so percentiles are
//! approximate once an operation outlives its window.
//!
//! Recomputing on every write sorts the window: O(n log n) with
//! n <= `retained_samples_per_name`.

// dependencies
use crate::clock::{Clock, MonotonicClock};
use crate::config::MetricsConfig;
use crate::errors::Result;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const NANOS_PER_MILLI: f64 = 1_000_000.0;

/// Outcome of a measured operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleStatus {
    Success,
    Failure,
}

/// One timed invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub name: String,
    pub duration_ms: f64,
    /// Clock reading when the operation started, in nanoseconds
    pub timestamp_nanos: u64,
    pub status: SampleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Statistics over the retained window of one operation. Durations in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStats {
    pub count: usize,
    pub failures: usize,
    pub total_duration_ms: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl AggregateStats {
    fn from_window(window: &VecDeque<MetricSample>) -> Self {
        let mut durations: Vec<f64> = window.iter().map(|s| s.duration_ms).collect();
        if durations.is_empty() {
            return Self::default();
        }
        durations.sort_by(f64::total_cmp);

        let count = durations.len();
        let total: f64 = durations.iter().sum();
        Self {
            count,
            failures: window
                .iter()
                .filter(|s| s.status == SampleStatus::Failure)
                .count(),
            total_duration_ms: total,
            min: durations[0],
            max: durations[count - 1],
            avg: total / count as f64,
            p50: nearest_rank(&durations, 50.0),
            p95: nearest_rank(&durations, 95.0),
            p99: nearest_rank(&durations, 99.0),
        }
    }
}

// nearest-rank percentile over an ascending, non-empty slice
fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    let rank = (percentile / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Signal raised when an operation runs longer than its registered threshold
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdExceeded {
    pub name: String,
    pub duration_ms: f64,
    pub threshold_ms: f64,
}

/// Receives threshold breaches. Implemented for plain closures.
pub trait ThresholdObserver: Send + Sync {
    fn on_threshold_exceeded(&self, event: &ThresholdExceeded);
}

impl<F> ThresholdObserver for F
where
    F: Fn(&ThresholdExceeded) + Send + Sync,
{
    fn on_threshold_exceeded(&self, event: &ThresholdExceeded) {
        self(event)
    }
}

/// Report ordering for per-operation aggregates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortBy {
    #[default]
    Count,
    #[serde(alias = "avg")]
    AverageDuration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationReport {
    pub name: String,
    #[serde(flatten)]
    pub stats: AggregateStats,
}

/// Snapshot for operational tooling
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    /// Samples currently retained across all operations
    pub total_samples: usize,
    pub total_operations: usize,
    pub total_failures: usize,
    pub operations: Vec<OperationReport>,
    /// Slowest retained samples, slowest first
    pub slowest: Vec<MetricSample>,
}

#[derive(Debug, Default)]
struct MonitorState {
    windows: HashMap<String, VecDeque<MetricSample>>,
    aggregates: HashMap<String, AggregateStats>,
    recent: VecDeque<MetricSample>,
}

/// Times operations and keeps rolling statistics per operation name.
pub struct PerformanceMonitor<C = MonotonicClock>
where
    C: Clock,
{
    state: Mutex<MonitorState>,
    thresholds: RwLock<HashMap<String, Duration>>,
    observers: RwLock<Vec<Arc<dyn ThresholdObserver>>>,
    retained_per_name: usize,
    max_total_samples: usize,
    clock: C,
}

impl<C: Clock> fmt::Debug for PerformanceMonitor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("retained_per_name", &self.retained_per_name)
            .field("max_total_samples", &self.max_total_samples)
            .field("observers", &self.observers.read().len())
            .finish_non_exhaustive()
    }
}

impl<C: Clock> PerformanceMonitor<C> {
    pub fn with_config(config: MetricsConfig, clock: C) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(MonitorState::default()),
            thresholds: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            retained_per_name: config.retained_samples_per_name,
            max_total_samples: config.max_total_samples,
            clock,
        })
    }

    /// Await `operation` and record how long it took.
    ///
    /// The result is returned untouched. If the returned future is dropped
    /// before completion the sample is still recorded, as a failure marked
    /// `{"cancelled": true}`.
    pub async fn measure<F, T, E>(&self, name: &str, operation: F) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
    {
        self.measure_with_metadata(name, None, operation).await
    }

    /// Like [`measure`](Self::measure), attaching `metadata` to the sample
    pub async fn measure_with_metadata<F, T, E>(
        &self,
        name: &str,
        metadata: Option<Value>,
        operation: F,
    ) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
    {
        let mut guard = MeasureGuard::start(self, name, metadata);
        let outcome = operation.await;
        guard.finish(status_of(&outcome), None);
        outcome
    }

    /// Synchronous variant of [`measure`](Self::measure)
    pub fn measure_sync<F, T, E>(&self, name: &str, operation: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> std::result::Result<T, E>,
    {
        let mut guard = MeasureGuard::start(self, name, None);
        let outcome = operation();
        guard.finish(status_of(&outcome), None);
        outcome
    }

    /// Alert when `name` runs longer than `threshold`
    pub fn set_threshold(&self, name: impl Into<String>, threshold: Duration) {
        self.thresholds.write().insert(name.into(), threshold);
    }

    pub fn clear_threshold(&self, name: &str) -> bool {
        self.thresholds.write().remove(name).is_some()
    }

    pub fn threshold(&self, name: &str) -> Option<Duration> {
        self.thresholds.read().get(name).copied()
    }

    /// Register an observer for threshold breaches
    pub fn subscribe<O>(&self, observer: O)
    where
        O: ThresholdObserver + 'static,
    {
        self.observers.write().push(Arc::new(observer));
    }

    /// Aggregates for one operation, or for all of them when `name` is `None`
    pub fn get_aggregates(&self, name: Option<&str>) -> BTreeMap<String, AggregateStats> {
        let state = self.state.lock();
        match name {
            Some(name) => state
                .aggregates
                .get_key_value(name)
                .map(|(k, v)| (k.clone(), v.clone()))
                .into_iter()
                .collect(),
            None => state
                .aggregates
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn aggregate(&self, name: &str) -> Option<AggregateStats> {
        self.state.lock().aggregates.get(name).cloned()
    }

    /// Retained samples for `name`, oldest first
    pub fn samples(&self, name: &str) -> Vec<MetricSample> {
        self.state
            .lock()
            .windows
            .get(name)
            .map(|window| window.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Per-operation aggregates sorted by `sort_by` (descending) plus the
    /// slowest individual samples, each list capped at `limit`.
    pub fn report(&self, limit: usize, sort_by: SortBy) -> PerformanceReport {
        let state = self.state.lock();

        let mut operations: Vec<OperationReport> = state
            .aggregates
            .iter()
            .map(|(name, stats)| OperationReport {
                name: name.clone(),
                stats: stats.clone(),
            })
            .collect();
        operations.sort_by(|a, b| {
            let ordering = match sort_by {
                SortBy::Count => b.stats.count.cmp(&a.stats.count),
                SortBy::AverageDuration => b.stats.avg.total_cmp(&a.stats.avg),
            };
            ordering.then_with(|| a.name.cmp(&b.name))
        });
        let total_failures = operations.iter().map(|op| op.stats.failures).sum();
        let total_operations = operations.len();
        operations.truncate(limit);

        let mut slowest: Vec<MetricSample> = state.recent.iter().cloned().collect();
        slowest.sort_by(|a, b| b.duration_ms.total_cmp(&a.duration_ms));
        slowest.truncate(limit);

        PerformanceReport {
            total_samples: state.recent.len(),
            total_operations,
            total_failures,
            operations,
            slowest,
        }
    }

    /// Drop every sample and aggregate. Thresholds and observers are kept.
    pub fn reset(&self) {
        *self.state.lock() = MonitorState::default();
    }

    fn record(&self, sample: MetricSample) {
        let name = sample.name.clone();
        let duration_ms = sample.duration_ms;

        {
            let mut state = self.state.lock();

            let window = state.windows.entry(name.clone()).or_default();
            window.push_back(sample.clone());
            while window.len() > self.retained_per_name {
                window.pop_front();
            }
            let stats = AggregateStats::from_window(window);
            state.aggregates.insert(name.clone(), stats);

            state.recent.push_back(sample);
            while state.recent.len() > self.max_total_samples {
                state.recent.pop_front();
            }
        }

        let Some(threshold) = self.threshold(&name) else {
            return;
        };
        let threshold_ms = threshold.as_nanos() as f64 / NANOS_PER_MILLI;
        if duration_ms > threshold_ms {
            let event = ThresholdExceeded {
                name,
                duration_ms,
                threshold_ms,
            };
            warn!(
                operation = %event.name,
                duration_ms = event.duration_ms,
                threshold_ms = event.threshold_ms,
                "performance threshold exceeded"
            );
            let observers: Vec<Arc<dyn ThresholdObserver>> = self.observers.read().clone();
            for observer in observers {
                observer.on_threshold_exceeded(&event);
            }
        }
    }
}

fn status_of<T, E>(outcome: &std::result::Result<T, E>) -> SampleStatus {
    if outcome.is_ok() {
        SampleStatus::Success
    } else {
        SampleStatus::Failure
    }
}

// merge a boolean flag into caller metadata
fn flag_metadata(metadata: Option<Value>, flag: &str) -> Value {
    let mut map = match metadata {
        Some(Value::Object(map)) => map,
        Some(other) => {
            let mut map = Map::new();
            map.insert("metadata".to_string(), other);
            map
        }
        None => Map::new(),
    };
    map.insert(flag.to_string(), Value::Bool(true));
    Value::Object(map)
}

// Pairs the start and stop of one measurement. Dropping an unfinished guard
// records a failure, which covers panics and cancelled futures.
struct MeasureGuard<'a, C: Clock> {
    monitor: &'a PerformanceMonitor<C>,
    name: String,
    started_nanos: Option<u64>,
    metadata: Option<Value>,
    finished: bool,
}

impl<'a, C: Clock> MeasureGuard<'a, C> {
    fn start(monitor: &'a PerformanceMonitor<C>, name: &str, metadata: Option<Value>) -> Self {
        let started_nanos = match monitor.clock.now() {
            Ok(now) => Some(now),
            Err(error) => {
                warn!(%error, operation = name, "clock unavailable, operation will not be measured");
                None
            }
        };
        Self {
            monitor,
            name: name.to_string(),
            started_nanos,
            metadata,
            finished: false,
        }
    }

    fn finish(&mut self, status: SampleStatus, flag: Option<&str>) {
        self.finished = true;
        let Some(started_nanos) = self.started_nanos else {
            return;
        };
        let ended_nanos = match self.monitor.clock.now() {
            Ok(now) => now,
            Err(error) => {
                warn!(%error, operation = %self.name, "clock unavailable, sample dropped");
                return;
            }
        };

        let metadata = match flag {
            Some(flag) => Some(flag_metadata(self.metadata.take(), flag)),
            None => self.metadata.take(),
        };
        let sample = MetricSample {
            name: std::mem::take(&mut self.name),
            duration_ms: ended_nanos.saturating_sub(started_nanos) as f64 / NANOS_PER_MILLI,
            timestamp_nanos: started_nanos,
            status,
            metadata,
        };
        debug!(
            operation = %sample.name,
            duration_ms = sample.duration_ms,
            status = ?sample.status,
            "operation measured"
        );
        self.monitor.record(sample);
    }
}

impl<C: Clock> Drop for MeasureGuard<'_, C> {
    fn drop(&mut self) {
        if !self.finished {
            let flag = if std::thread::panicking() {
                "panicked"
            } else {
                "cancelled"
            };
            self.finish(SampleStatus::Failure, Some(flag));
        }
    }
}
