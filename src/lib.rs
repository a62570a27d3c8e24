// src/lib.rs

//! # Request Governor
//!
//! In-process request governance for HTTP services: per-client token-bucket
//! admission, a bounded TTL response cache, and rolling latency statistics
//! with threshold alerts, composed into a single middleware pipeline.
//!
//! All state is in memory and lives for the lifetime of the process.
//!
//! ## Quick Example
//!
//! ```rust
//! use request_governor::{Governor, GovernorConfig, Method, RequestParts, Served};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let governor = Governor::new(GovernorConfig::default()).unwrap();
//! let request = RequestParts::new(Method::Get, "/api/employees", "10.0.0.7");
//!
//! let outcome = governor
//!     .handle(&request, || async { Ok::<_, std::io::Error>(vec!["ada".to_string()]) })
//!     .await
//!     .unwrap();
//!
//! match outcome.served {
//!     Served::Rejected(rejection) => println!("429: {}", rejection.body()),
//!     Served::FromCache(body) | Served::Fresh(body) => println!("200: {:?}", body),
//! }
//! # }
//! ```

// private modules
mod cache;
mod clock;
mod config;
mod errors;
mod governor;
mod metrics;
mod rate_limiter;

// public API exports
pub use cache::{CacheStats, ResponseCache, cache_key};
pub use clock::{Clock, ClockError, MonotonicClock, SystemClock};
pub use config::{CacheConfig, GovernorConfig, MetricsConfig, RateLimiterConfig};
pub use errors::{GovernorError, Result};
pub use governor::{
    BackgroundTasks, Governed, Governor, Method, RETRY_AFTER_SECS, RateLimitHeaders, Rejection,
    RequestParts, Served,
};
pub use metrics::{
    AggregateStats, MetricSample, OperationReport, PerformanceMonitor, PerformanceReport,
    SampleStatus, SortBy, ThresholdExceeded, ThresholdObserver,
};
pub use rate_limiter::{RateLimitDecision, RateLimiter};
