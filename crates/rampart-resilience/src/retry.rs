//! Retry policy with exponential backoff.
//!
//! The delay before attempt `n` (n ≥ 2) is
//! `min(backoff_max, backoff_factor * 2^(n-2))` scaled by a jitter factor
//! drawn uniformly from the configured range. A server `Retry-After` can
//! only lengthen that delay.

use rampart_core::{
    Clock, FailureCause, NotRetryableReason, Outcome, RequestDescriptor, RetryOverride,
    RetryTermination,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use validator::{Validate, ValidationError};

/// Range the jitter factor is drawn from
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JitterRange {
    /// Lower bound, inclusive
    pub min: f64,
    /// Upper bound, inclusive
    pub max: f64,
}

impl JitterRange {
    /// Uniform over `[0, 1]`
    pub const FULL: Self = Self { min: 0.0, max: 1.0 };
    /// Always 1: the computed backoff unchanged
    pub const NONE: Self = Self { min: 1.0, max: 1.0 };

    /// Draw a factor
    #[must_use]
    pub fn sample(&self) -> f64 {
        if self.max <= self.min {
            self.min
        } else {
            rand::thread_rng().gen_range(self.min..=self.max)
        }
    }
}

impl Default for JitterRange {
    fn default() -> Self {
        Self::FULL
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_jitter"))]
pub struct RetryConfig {
    /// Total attempts including the first
    #[validate(range(min = 1, max = 100))]
    pub max_attempts: u32,
    /// Response statuses that are retried
    pub retry_statuses: Vec<u16>,
    /// Base of the exponential backoff
    #[serde(with = "humantime_serde")]
    pub backoff_factor: Duration,
    /// Ceiling of the computed backoff
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
    /// Jitter factor range
    pub jitter: JitterRange,
    /// Retry non-idempotent methods without an idempotency key
    pub retry_non_idempotent: bool,
    /// Honour `Retry-After` on retryable responses
    pub respect_retry_after: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_statuses: vec![408, 429, 500, 502, 503, 504],
            backoff_factor: Duration::from_millis(500),
            backoff_max: Duration::from_secs(60),
            jitter: JitterRange::FULL,
            retry_non_idempotent: false,
            respect_retry_after: true,
        }
    }
}

fn validate_jitter(config: &RetryConfig) -> Result<(), ValidationError> {
    let JitterRange { min, max } = config.jitter;
    if !(0.0..=1.0).contains(&min) || !(0.0..=1.0).contains(&max) || min > max {
        return Err(ValidationError::new("jitter_range"));
    }
    if config.backoff_max < config.backoff_factor {
        return Err(ValidationError::new("backoff_max_below_factor"));
    }
    Ok(())
}

/// Why another attempt is made
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// The target answered with a retryable status
    Status(u16),
    /// The transport failed in the named phase
    Transport(&'static str),
    /// Some other retryable failure
    Other,
}

/// A scheduled retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// Number of the attempt about to be made
    pub attempt: u32,
    /// Delay before it
    pub delay: Duration,
    /// Why it is made
    pub reason: RetryReason,
}

/// Result of a retried call
#[derive(Debug, Clone)]
pub struct RetryReport {
    /// Final outcome, failures stamped with attempts and termination
    pub outcome: Outcome,
    /// Attempts that reached the attempt function
    pub attempts: u32,
    /// Time from first attempt to final outcome
    pub elapsed: Duration,
    /// Retries that were scheduled
    pub decisions: Vec<RetryDecision>,
}

impl RetryReport {
    /// Why the loop stopped, if it did not succeed
    #[must_use]
    pub fn termination(&self) -> Option<RetryTermination> {
        match &self.outcome {
            Outcome::RetryableFailure(f) | Outcome::FatalFailure(f) => f.termination,
            Outcome::CircuitRejected(_) => Some(RetryTermination::NotRetryable(
                NotRetryableReason::CircuitRejected,
            )),
            Outcome::Success(_) => None,
        }
    }
}

/// Retry policy implementation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a new retry policy with the given configuration
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Policy with a per-call override applied
    #[must_use]
    pub fn with_override(&self, overrides: &RetryOverride) -> Self {
        let mut config = self.config.clone();
        if let Some(max_attempts) = overrides.max_attempts {
            config.max_attempts = max_attempts.max(1);
        }
        if let Some(factor) = overrides.backoff_factor {
            config.backoff_factor = factor;
        }
        if let Some(max) = overrides.backoff_max {
            config.backoff_max = max;
        }
        Self::new(config)
    }

    /// Backoff before jitter for attempt `attempt` (1-based)
    #[must_use]
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(31);
        self.config
            .backoff_factor
            .checked_mul(1_u32 << exponent)
            .map_or(self.config.backoff_max, |d| d.min(self.config.backoff_max))
    }

    /// Delay before attempt `attempt`, jittered and floored by `retry_after`
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let factor = self.config.jitter.sample().clamp(0.0, 1.0);
        let computed = Duration::from_nanos(
            (self.backoff_ceiling(attempt).as_nanos() as f64 * factor).round() as u64,
        );
        match retry_after {
            Some(server) if self.config.respect_retry_after => computed.max(server),
            _ => computed,
        }
    }

    /// Whether another attempt may follow a retryable failure of `request`
    #[must_use]
    pub fn is_method_eligible(&self, request: &RequestDescriptor) -> bool {
        request.is_retry_eligible() || self.config.retry_non_idempotent
    }

    /// Run `attempt_fn` until success, a non-retryable outcome, or the budget
    /// runs out. `attempt_fn` receives the 1-based attempt number.
    pub async fn execute<F, Fut>(
        &self,
        request: &RequestDescriptor,
        clock: &dyn Clock,
        deadline: Option<Instant>,
        mut attempt_fn: F,
    ) -> RetryReport
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Outcome>,
    {
        let started = clock.now();
        let eligible = self.is_method_eligible(request);
        let mut decisions = Vec::new();
        let mut attempt = 1;

        loop {
            let outcome = attempt_fn(attempt).await;

            let termination = match &outcome {
                Outcome::Success(_) => {
                    if attempt > 1 {
                        debug!(attempt = attempt, "Retry succeeded");
                    }
                    None
                }
                Outcome::CircuitRejected(_) => Some(RetryTermination::NotRetryable(
                    NotRetryableReason::CircuitRejected,
                )),
                Outcome::FatalFailure(_) => Some(RetryTermination::NotRetryable(
                    NotRetryableReason::FatalOutcome,
                )),
                Outcome::RetryableFailure(failure) => {
                    if !eligible {
                        debug!(method = %request.method(), "Not retrying non-idempotent request");
                        Some(RetryTermination::NotRetryable(
                            NotRetryableReason::MethodNotEligible,
                        ))
                    } else if attempt >= self.config.max_attempts {
                        Some(RetryTermination::Exhausted)
                    } else {
                        let delay = self.delay_for_attempt(attempt + 1, failure.retry_after);
                        if deadline.is_some_and(|d| clock.now() + delay >= d) {
                            Some(RetryTermination::NotRetryable(
                                NotRetryableReason::DeadlineExceeded,
                            ))
                        } else {
                            let reason = match &failure.cause {
                                FailureCause::Status(response) => {
                                    RetryReason::Status(response.status().as_u16())
                                }
                                FailureCause::Transport(err) => RetryReason::Transport(err.phase()),
                                _ => RetryReason::Other,
                            };
                            warn!(
                                attempt = attempt + 1,
                                max_attempts = self.config.max_attempts,
                                delay_ms = delay.as_millis() as u64,
                                reason = ?reason,
                                url = %request.url(),
                                "Retrying after failure"
                            );
                            decisions.push(RetryDecision {
                                attempt: attempt + 1,
                                delay,
                                reason,
                            });
                            clock.sleep(delay).await;
                            attempt += 1;
                            continue;
                        }
                    }
                }
            };

            let attempts = if matches!(outcome, Outcome::CircuitRejected(_)) {
                attempt - 1
            } else {
                attempt
            };
            let outcome = match termination {
                Some(termination) => outcome.with_retry_context(attempts, termination),
                None => outcome,
            };
            return RetryReport {
                outcome,
                attempts,
                elapsed: clock.now().saturating_duration_since(started),
                decisions,
            };
        }
    }
}

/// Builder for retry policy
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    config: RetryConfig,
}

impl RetryPolicyBuilder {
    /// Create a new builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set max attempts
    #[must_use]
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n;
        self
    }

    /// Set backoff factor
    #[must_use]
    pub fn backoff_factor(mut self, factor: Duration) -> Self {
        self.config.backoff_factor = factor;
        self
    }

    /// Set backoff ceiling
    #[must_use]
    pub fn backoff_max(mut self, max: Duration) -> Self {
        self.config.backoff_max = max;
        self
    }

    /// Set jitter range
    #[must_use]
    pub fn jitter(mut self, min: f64, max: f64) -> Self {
        self.config.jitter = JitterRange {
            min: min.clamp(0.0, 1.0),
            max: max.clamp(0.0, 1.0),
        };
        self
    }

    /// Set statuses to retry on
    #[must_use]
    pub fn retry_statuses(mut self, codes: Vec<u16>) -> Self {
        self.config.retry_statuses = codes;
        self
    }

    /// Allow retrying non-idempotent methods
    #[must_use]
    pub fn retry_non_idempotent(mut self, allow: bool) -> Self {
        self.config.retry_non_idempotent = allow;
        self
    }

    /// Build the policy
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy::new(self.config)
    }
}
