//! Test helper utilities for integration tests

use crate::transports::ScriptedTransport;
use once_cell::sync::Lazy;
use rampart_client::{Client, ClientBuilder};
use rampart_core::ManualClock;
use rampart_resilience::{CacheConfig, CircuitBreakerConfig, JitterRange, RetryConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Base URL every scripted client resolves paths against
pub const BASE_URL: &str = "https://api.example.com";

/// Breaker target for [`BASE_URL`]
pub const TARGET: &str = "https://api.example.com:443";

/// Initialize tracing for tests (only once)
static TRACING: Lazy<()> = Lazy::new(|| {
    if std::env::var("TEST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
});

/// Initialize tracing for tests
pub fn init_tracing() {
    Lazy::force(&TRACING);
}

/// Fresh manual clock
pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new())
}

/// Retry policy with deterministic delays of `factor * 2^(n-2)`
pub fn fixed_retry(max_attempts: u32, factor: Duration) -> RetryConfig {
    RetryConfig {
        max_attempts,
        backoff_factor: factor,
        jitter: JitterRange::NONE,
        ..RetryConfig::default()
    }
}

/// Breaker with a count threshold and no retry-affecting extras
pub fn breaker(failure_threshold: u32, reset_timeout: Duration) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold,
        reset_timeout,
        ..CircuitBreakerConfig::default()
    }
}

/// Enabled in-memory cache
pub fn memory_cache() -> CacheConfig {
    CacheConfig {
        enabled: true,
        ..CacheConfig::default()
    }
}

/// Builder wired to `transport` and `clock`, with retries disabled
pub fn builder(transport: &ScriptedTransport, clock: &Arc<ManualClock>) -> ClientBuilder {
    init_tracing();
    Client::builder()
        .base_url(BASE_URL)
        .transport(transport.clone())
        .clock(clock.clone())
        .retry(fixed_retry(1, Duration::from_millis(100)))
}

/// Build `builder` or fail the test
pub async fn build(builder: ClientBuilder) -> Client {
    builder.build().await.expect("client builds")
}
