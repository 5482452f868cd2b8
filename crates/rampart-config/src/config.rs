//! Client configuration model.

use rampart_resilience::{CacheConfig, CircuitBreakerConfig, RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use validator::Validate;

/// Transport timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Establishing a connection
    #[serde(with = "humantime_serde")]
    pub connect: Duration,
    /// Waiting for response data
    #[serde(with = "humantime_serde")]
    pub read: Duration,
    /// Sending request data
    #[serde(with = "humantime_serde")]
    pub write: Duration,
    /// Idle pooled connections are kept this long
    #[serde(with = "humantime_serde")]
    pub pool: Duration,
    /// Bound on a whole logical call, retries and waits included
    #[serde(with = "humantime_serde")]
    pub total: Option<Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            read: Duration::from_secs(30),
            write: Duration::from_secs(30),
            pool: Duration::from_secs(10),
            total: None,
        }
    }
}

impl TimeoutConfig {
    /// Upper bound on one attempt
    #[must_use]
    pub fn attempt_timeout(&self) -> Duration {
        self.connect + self.write + self.read
    }
}

/// Complete client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL relative request paths are joined to
    pub base_url: Option<String>,
    /// Headers sent with every request
    pub headers: BTreeMap<String, String>,
    /// `User-Agent` header
    pub user_agent: String,
    /// Generate an idempotency key per call for non-idempotent methods
    pub generate_idempotency_keys: bool,
    /// Transport timeouts
    #[validate(nested)]
    pub timeout: TimeoutConfig,
    /// Retry policy
    #[validate(nested)]
    pub retry: RetryConfig,
    /// Circuit breaker
    #[validate(nested)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Rate limiter
    #[validate(nested)]
    pub rate_limit: RateLimitConfig,
    /// Response cache
    #[validate(nested)]
    pub cache: CacheConfig,
}

impl ClientConfig {
    /// Default user agent.
    pub const DEFAULT_USER_AGENT: &'static str = concat!("rampart/", env!("CARGO_PKG_VERSION"));
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            headers: BTreeMap::new(),
            user_agent: Self::DEFAULT_USER_AGENT.to_string(),
            generate_idempotency_keys: false,
            timeout: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.retry_statuses, vec![408, 429, 500, 502, 503, 504]);
        assert_eq!(config.retry.backoff_factor, Duration::from_millis(500));
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.reset_timeout, Duration::from_secs(30));
        assert_eq!(config.rate_limit.burst_size, 10);
        assert!(!config.cache.enabled);
        assert_eq!(config.timeout.connect, Duration::from_secs(5));
        assert!(config.user_agent.starts_with("rampart/"));
    }

    #[test]
    fn test_humantime_durations_serialize() {
        let json = serde_json::to_value(TimeoutConfig::default()).unwrap();
        assert_eq!(json["connect"], "5s");
        assert_eq!(json["total"], serde_json::Value::Null);

        let parsed: TimeoutConfig =
            serde_json::from_str(r#"{"read": "1m 30s", "total": "2m"}"#).unwrap();
        assert_eq!(parsed.read, Duration::from_secs(90));
        assert_eq!(parsed.total, Some(Duration::from_secs(120)));
        assert_eq!(parsed.connect, Duration::from_secs(5));
    }
}
