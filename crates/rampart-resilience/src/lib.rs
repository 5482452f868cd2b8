//! # Rampart Resilience
//!
//! Stateful policy components for outbound HTTP calls:
//! - Circuit breaker with count or rate tripping and a per-target registry
//! - Rate limiter with token bucket, fixed window and sliding window algorithms
//! - Retry policy with exponential backoff and jitter
//! - HTTP-semantics response cache with memory and disk backends
//!
//! Every component reads time through an injected [`rampart_core::Clock`] and
//! keeps its state behind short internal critical sections, so one instance
//! can be shared by any number of concurrent callers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use cache::{
    CacheBackend, CacheBackendKind, CacheConfig, CacheEntry, CacheError, CacheLookup, CacheStats,
    DiskCacheBackend, MemoryCacheBackend, ResponseCache,
};
pub use circuit_breaker::{
    BreakerPermit, CallVerdict, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitBreakerStats, CircuitState, FailureKind, TripMode,
};
pub use rate_limiter::{
    LimitScope, LimiterStatus, RateLimitConfig, RateLimitStrategy, RateLimiter, RatePermit,
};
pub use retry::{
    JitterRange, RetryConfig, RetryDecision, RetryPolicy, RetryPolicyBuilder, RetryReason,
    RetryReport,
};
