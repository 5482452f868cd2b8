//! Circuit breaker pattern implementation.
//!
//! The circuit breaker stops calls to a failing target and periodically
//! lets a bounded number of probes through to test recovery. Every decision
//! (admit, reject, count, transition) happens inside one short critical
//! section, so two concurrent callers can never both observe "open and
//! eligible" and both become probes beyond the half-open limit.
//!
//! The Open → HalfOpen transition is lazy: it is evaluated from the stored
//! `opened_at` instant and the injected clock on the next admission check.

use dashmap::DashMap;
use parking_lot::Mutex;
use rampart_core::{Clock, FailureCause, Outcome, Rejection, RejectionReason, SharedClock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use validator::Validate;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, testing if the target recovered
    HalfOpen,
}

/// How the closed state decides to trip
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripMode {
    /// Trip when failures within `sampling_duration` reach `failure_threshold`
    #[default]
    Count,
    /// Trip when the failure ratio within `sampling_duration` reaches
    /// `failure_rate_threshold`, once `minimum_calls` were observed
    Rate,
}

/// Failure categories that can be excluded from breaker accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Connection could not be established
    Connect,
    /// Reading the response failed
    Read,
    /// Writing the request failed
    Write,
    /// No pooled connection was available
    Pool,
    /// Any transport timeout
    Timeout,
    /// A specific response status
    Status(u16),
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Whether calls are gated at all
    pub enabled: bool,
    /// Count or rate tripping
    pub mode: TripMode,
    /// Failures within the sampling window that open the circuit (count mode)
    #[validate(range(min = 1))]
    pub failure_threshold: u32,
    /// Failure ratio that opens the circuit (rate mode)
    #[validate(range(min = 0.0, max = 1.0))]
    pub failure_rate_threshold: f64,
    /// Calls required in the window before the ratio is considered (rate mode)
    #[validate(range(min = 1))]
    pub minimum_calls: u32,
    /// Trailing window over which calls are counted
    #[serde(with = "humantime_serde")]
    pub sampling_duration: Duration,
    /// Consecutive half-open successes that close the circuit
    #[validate(range(min = 1))]
    pub success_threshold: u32,
    /// Time spent open before a probe is allowed
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
    /// Concurrent probes allowed while half-open
    #[validate(range(min = 1))]
    pub half_open_max_calls: u32,
    /// Response statuses counted as failures
    pub included_status_codes: Vec<u16>,
    /// Failures that never count, even when otherwise matching
    pub excluded_failures: Vec<FailureKind>,
    /// One breaker per target instead of one for the whole client
    pub per_host: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: TripMode::Count,
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            minimum_calls: 10,
            sampling_duration: Duration::from_secs(60),
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
            included_status_codes: vec![500, 502, 503, 504],
            excluded_failures: Vec::new(),
            per_host: false,
        }
    }
}

impl CircuitBreakerConfig {
    /// Decide how an outcome counts toward breaker health
    #[must_use]
    pub fn verdict(&self, outcome: &Outcome) -> CallVerdict {
        match outcome {
            Outcome::Success(response) => self.status_verdict(response.status().as_u16()),
            Outcome::RetryableFailure(failure) | Outcome::FatalFailure(failure) => {
                match &failure.cause {
                    FailureCause::Transport(err) => {
                        let phase = match err {
                            rampart_core::TransportError::Connect { .. } => FailureKind::Connect,
                            rampart_core::TransportError::Read { .. } => FailureKind::Read,
                            rampart_core::TransportError::Write { .. } => FailureKind::Write,
                            rampart_core::TransportError::Pool { .. } => FailureKind::Pool,
                        };
                        let excluded = self.excluded_failures.contains(&phase)
                            || (err.is_timeout()
                                && self.excluded_failures.contains(&FailureKind::Timeout));
                        if excluded {
                            CallVerdict::Ignored
                        } else {
                            CallVerdict::Failure
                        }
                    }
                    FailureCause::Status(response) => {
                        self.status_verdict(response.status().as_u16())
                    }
                    _ => CallVerdict::Ignored,
                }
            }
            Outcome::CircuitRejected(_) => CallVerdict::Ignored,
        }
    }

    fn status_verdict(&self, status: u16) -> CallVerdict {
        if !self.included_status_codes.contains(&status) {
            CallVerdict::Success
        } else if self.excluded_failures.contains(&FailureKind::Status(status)) {
            CallVerdict::Ignored
        } else {
            CallVerdict::Failure
        }
    }
}

/// How a completed call counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallVerdict {
    /// Healthy response
    Success,
    /// Counts toward opening
    Failure,
    /// Does not affect breaker health
    Ignored,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    forced_open: bool,
    generation: u64,
    window: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    half_open_successes: u32,
    rejected: u64,
}

/// Circuit breaker for a single target
#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(
        target: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            target: target.into(),
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                forced_open: false,
                generation: 0,
                window: VecDeque::new(),
                opened_at: None,
                half_open_in_flight: 0,
                half_open_successes: 0,
                rejected: 0,
            }),
        }
    }

    /// Target this breaker guards
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, without evaluating the reset timeout
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Ask to make a call.
    ///
    /// On success the returned permit must be settled with
    /// [`BreakerPermit::record`]. Dropping it unsettled releases a half-open
    /// slot without counting anything.
    ///
    /// # Errors
    /// Returns a [`Rejection`] when the circuit is open or every half-open
    /// probe slot is taken
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, Rejection> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Ok(self.permit(&inner, false)),
            CircuitState::Open => {
                if inner.forced_open {
                    return Err(self.reject(&mut inner, RejectionReason::ForcedOpen, None));
                }
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.config.reset_timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen, now);
                    inner.half_open_in_flight = 1;
                    Ok(self.permit(&inner, true))
                } else {
                    let retry_in = self.config.reset_timeout - elapsed;
                    Err(self.reject(&mut inner, RejectionReason::Open, Some(retry_in)))
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_calls {
                    inner.half_open_in_flight += 1;
                    Ok(self.permit(&inner, true))
                } else {
                    // Overflow re-opens; permits still in flight settle on a stale generation.
                    self.transition(&mut inner, CircuitState::Open, now);
                    let retry_in = Some(self.config.reset_timeout);
                    Err(self.reject(&mut inner, RejectionReason::HalfOpenSaturated, retry_in))
                }
            }
        }
    }

    fn permit(self: &Arc<Self>, inner: &BreakerInner, probe: bool) -> BreakerPermit {
        BreakerPermit {
            breaker: Arc::clone(self),
            generation: inner.generation,
            probe,
            settled: false,
        }
    }

    fn reject(
        &self,
        inner: &mut BreakerInner,
        reason: RejectionReason,
        retry_in: Option<Duration>,
    ) -> Rejection {
        inner.rejected += 1;
        debug!(circuit = %self.target, reason = %reason, "Circuit breaker rejected call");
        Rejection {
            target: self.target.clone(),
            reason,
            retry_in,
            attempts: 0,
        }
    }

    /// Record a successful call made outside a permit
    pub fn record_success(&self) {
        let generation = self.inner.lock().generation;
        self.settle(generation, false, Some(CallVerdict::Success));
    }

    /// Record a failed call made outside a permit
    pub fn record_failure(&self) {
        let generation = self.inner.lock().generation;
        self.settle(generation, false, Some(CallVerdict::Failure));
    }

    fn settle(&self, generation: u64, probe: bool, verdict: Option<CallVerdict>) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        // A transition happened since admission; the call no longer speaks
        // for the current state.
        if inner.generation != generation {
            return;
        }
        if probe && inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }

        match (inner.state, verdict) {
            (_, None | Some(CallVerdict::Ignored)) | (CircuitState::Open, _) => {}
            (CircuitState::Closed, Some(verdict)) => {
                let failed = verdict == CallVerdict::Failure;
                inner.window.push_back((now, failed));
                self.prune(&mut inner, now);
                if failed && self.should_trip(&inner) {
                    let failures = inner.window.iter().filter(|(_, f)| *f).count();
                    debug!(
                        circuit = %self.target,
                        failures = failures,
                        calls = inner.window.len(),
                        "Circuit breaker failure threshold reached"
                    );
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            (CircuitState::HalfOpen, Some(CallVerdict::Success)) => {
                inner.half_open_successes += 1;
                debug!(
                    circuit = %self.target,
                    successes = inner.half_open_successes,
                    threshold = self.config.success_threshold,
                    "Circuit breaker half-open success"
                );
                if inner.half_open_successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed, now);
                }
            }
            (CircuitState::HalfOpen, Some(_)) => {
                debug!(circuit = %self.target, "Circuit breaker half-open failure, reopening");
                self.transition(&mut inner, CircuitState::Open, now);
            }
        }
    }

    fn prune(&self, inner: &mut BreakerInner, now: Instant) {
        while let Some((at, _)) = inner.window.front() {
            if now.saturating_duration_since(*at) > self.config.sampling_duration {
                inner.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn should_trip(&self, inner: &BreakerInner) -> bool {
        let failures = inner.window.iter().filter(|(_, failed)| *failed).count() as u32;
        match self.config.mode {
            TripMode::Count => failures >= self.config.failure_threshold,
            TripMode::Rate => {
                let calls = inner.window.len() as u32;
                calls >= self.config.minimum_calls
                    && f64::from(failures) / f64::from(calls) >= self.config.failure_rate_threshold
            }
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.half_open_in_flight = 0;
        inner.half_open_successes = 0;

        match to {
            CircuitState::Open => {
                inner.opened_at = Some(now);
                warn!(circuit = %self.target, from = ?from, "Circuit breaker opened");
            }
            CircuitState::HalfOpen => {
                info!(circuit = %self.target, "Circuit breaker half-open, testing");
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.forced_open = false;
                inner.window.clear();
                info!(circuit = %self.target, from = ?from, "Circuit breaker closed");
            }
        }
    }

    /// Force the circuit open until closed or reset
    pub fn force_open(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Open, now);
        inner.forced_open = true;
    }

    /// Force the circuit closed, clearing the failure window
    pub fn force_close(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed, now);
    }

    /// Return to a pristine closed state, clearing statistics
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed, now);
        inner.rejected = 0;
    }

    /// Get current statistics
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let now = self.clock.now();
        let inner = self.inner.lock();
        let horizon = self.config.sampling_duration;
        let live = inner
            .window
            .iter()
            .filter(|(at, _)| now.saturating_duration_since(*at) <= horizon);
        let (mut request_count, mut failure_count) = (0_u32, 0_u32);
        for (_, failed) in live {
            request_count += 1;
            failure_count += u32::from(*failed);
        }

        CircuitBreakerStats {
            state: inner.state,
            failure_count,
            request_count,
            half_open_successes: inner.half_open_successes,
            half_open_in_flight: inner.half_open_in_flight,
            rejected: inner.rejected,
            open_for: inner
                .opened_at
                .filter(|_| inner.state == CircuitState::Open)
                .map(|at| now.saturating_duration_since(at)),
        }
    }
}

/// Admission granted by a breaker.
///
/// Settle with [`record`](Self::record). A permit dropped unsettled (for
/// example because the caller was cancelled) frees its half-open slot at
/// once and counts neither as success nor failure.
#[must_use = "an unsettled permit counts nothing"]
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    probe: bool,
    settled: bool,
}

impl BreakerPermit {
    /// Whether this call is a half-open probe
    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Settle the permit with the call's verdict
    pub fn record(mut self, verdict: CallVerdict) {
        self.settled = true;
        self.breaker
            .settle(self.generation, self.probe, Some(verdict));
    }

    /// Settle the permit from an outcome, using the breaker's classification
    pub fn record_outcome(self, outcome: &Outcome) {
        let verdict = self.breaker.config.verdict(outcome);
        self.record(verdict);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.settle(self.generation, self.probe, None);
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerStats {
    /// Current state
    pub state: CircuitState,
    /// Failures in the sampling window
    pub failure_count: u32,
    /// Calls in the sampling window
    pub request_count: u32,
    /// Successes in the current half-open period
    pub half_open_successes: u32,
    /// Probes currently in flight
    pub half_open_in_flight: u32,
    /// Calls rejected since creation or reset
    pub rejected: u64,
    /// Time spent open so far
    pub open_for: Option<Duration>,
}

impl CircuitBreakerStats {
    /// Calculate failure rate
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            f64::from(self.failure_count) / f64::from(self.request_count)
        }
    }
}

/// Name of the breaker used when `per_host` is off.
pub const GLOBAL_TARGET: &str = "global";

/// Breakers of one client, created lazily per target.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    clock: SharedClock,
    global: Arc<CircuitBreaker>,
    per_host: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry
    #[must_use]
    pub fn new(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        let global = Arc::new(CircuitBreaker::new(
            GLOBAL_TARGET,
            config.clone(),
            Arc::clone(&clock),
        ));
        Self {
            config,
            clock,
            global,
            per_host: DashMap::new(),
        }
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Breaker responsible for `target`, created on first use
    #[must_use]
    pub fn get(&self, target: &str) -> Arc<CircuitBreaker> {
        if !self.config.per_host {
            return Arc::clone(&self.global);
        }
        if let Some(existing) = self.per_host.get(target) {
            return Arc::clone(existing.value());
        }
        let breaker = self.per_host.entry(target.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                target,
                self.config.clone(),
                Arc::clone(&self.clock),
            ))
        });
        Arc::clone(breaker.value())
    }

    /// Existing breaker for `target`, without creating one
    #[must_use]
    pub fn find(&self, target: &str) -> Option<Arc<CircuitBreaker>> {
        if self.config.per_host {
            self.per_host.get(target).map(|b| Arc::clone(b.value()))
        } else {
            Some(Arc::clone(&self.global))
        }
    }

    /// Every breaker created so far
    #[must_use]
    pub fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        if self.config.per_host {
            self.per_host.iter().map(|b| Arc::clone(b.value())).collect()
        } else {
            vec![Arc::clone(&self.global)]
        }
    }

    /// Reset every breaker
    pub fn reset_all(&self) {
        for breaker in self.all() {
            breaker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core::{Failure, ManualClock, Response, StatusCode, TransportError};

    fn breaker(config: CircuitBreakerConfig) -> (Arc<CircuitBreaker>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let cb = Arc::new(CircuitBreaker::new(
            "https://api.example.com:443",
            config,
            clock.clone(),
        ));
        (cb, clock)
    }

    fn fail(cb: &Arc<CircuitBreaker>) {
        cb.try_acquire().unwrap().record(CallVerdict::Failure);
    }

    fn succeed(cb: &Arc<CircuitBreaker>) {
        cb.try_acquire().unwrap().record(CallVerdict::Success);
    }

    fn open_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(10),
            half_open_max_calls: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_circuit_breaker_initial_state() {
        let (cb, _) = breaker(CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_opens_exactly_at_threshold() {
        let (cb, _) = breaker(open_config());

        fail(&cb);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());

        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
        let rejection = cb.try_acquire().unwrap_err();
        assert_eq!(rejection.reason, RejectionReason::Open);
        assert_eq!(rejection.retry_in, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_failures_outside_window_do_not_count() {
        let (cb, clock) = breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            sampling_duration: Duration::from_secs(5),
            ..Default::default()
        });

        fail(&cb);
        clock.advance(Duration::from_secs(6));
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_only_after_reset_timeout() {
        let (cb, clock) = breaker(open_config());
        for _ in 0..3 {
            fail(&cb);
        }

        clock.advance(Duration::from_secs(10) - Duration::from_millis(1));
        assert!(cb.try_acquire().is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_millis(1));
        let probe = cb.try_acquire().unwrap();
        assert!(probe.is_probe());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        probe.record(CallVerdict::Success);
    }

    #[test]
    fn test_half_open_successes_close_circuit() {
        let (cb, clock) = breaker(open_config());
        for _ in 0..3 {
            fail(&cb);
        }
        clock.advance(Duration::from_secs(10));

        let first = cb.try_acquire().unwrap();
        let second = cb.try_acquire().unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        first.record(CallVerdict::Success);
        second.record(CallVerdict::Success);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_overflow_reopens() {
        let (cb, clock) = breaker(open_config());
        for _ in 0..3 {
            fail(&cb);
        }
        clock.advance(Duration::from_secs(10));

        let first = cb.try_acquire().unwrap();
        let second = cb.try_acquire().unwrap();
        let third = cb.try_acquire().unwrap_err();
        assert_eq!(third.reason, RejectionReason::HalfOpenSaturated);
        assert_eq!(third.retry_in, Some(Duration::from_secs(10)));
        assert_eq!(cb.state(), CircuitState::Open);

        // Both were admitted under the previous half-open period.
        first.record(CallVerdict::Success);
        second.record(CallVerdict::Success);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.try_acquire().unwrap_err().reason, RejectionReason::Open);
    }

    #[test]
    fn test_half_open_overflow_with_default_config() {
        let config = CircuitBreakerConfig::default();
        let max_calls = config.half_open_max_calls;
        let (cb, clock) = breaker(config);
        for _ in 0..5 {
            fail(&cb);
        }
        clock.advance(Duration::from_secs(30));

        let held: Vec<_> = (0..max_calls).map(|_| cb.try_acquire().unwrap()).collect();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let overflow = cb.try_acquire().unwrap_err();
        assert_eq!(overflow.reason, RejectionReason::HalfOpenSaturated);
        assert_eq!(cb.state(), CircuitState::Open);
        drop(held);
        assert_eq!(cb.stats().half_open_in_flight, 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (cb, clock) = breaker(open_config());
        for _ in 0..3 {
            fail(&cb);
        }
        clock.advance(Duration::from_secs(10));

        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(
            cb.try_acquire().unwrap_err().retry_in,
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_dropped_half_open_permit_releases_slot() {
        let (cb, clock) = breaker(CircuitBreakerConfig {
            half_open_max_calls: 1,
            ..open_config()
        });
        for _ in 0..3 {
            fail(&cb);
        }
        clock.advance(Duration::from_secs(10));

        let probe = cb.try_acquire().unwrap();
        assert_eq!(cb.stats().half_open_in_flight, 1);
        drop(probe);

        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::HalfOpen);
        assert_eq!(stats.half_open_in_flight, 0);
        assert_eq!(stats.half_open_successes, 0);
        succeed(&cb);
        succeed(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_rate_mode_requires_minimum_calls() {
        let (cb, _) = breaker(CircuitBreakerConfig {
            mode: TripMode::Rate,
            failure_rate_threshold: 0.5,
            minimum_calls: 4,
            ..Default::default()
        });

        fail(&cb);
        fail(&cb);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);

        succeed(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_force_open_and_close() {
        let (cb, clock) = breaker(open_config());
        cb.force_open();
        clock.advance(Duration::from_secs(3600));
        assert_eq!(
            cb.try_acquire().unwrap_err().reason,
            RejectionReason::ForcedOpen
        );

        cb.force_close();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_circuit_breaker_stats() {
        let (cb, _) = breaker(CircuitBreakerConfig {
            failure_threshold: 5,
            ..Default::default()
        });

        succeed(&cb);
        fail(&cb);
        fail(&cb);

        let stats = cb.stats();
        assert_eq!(stats.request_count, 3);
        assert_eq!(stats.failure_count, 2);
        assert!((stats.failure_rate() - 0.666).abs() < 0.01);

        cb.reset();
        assert_eq!(cb.stats().request_count, 0);
    }

    #[test]
    fn test_verdict_classification() {
        let config = CircuitBreakerConfig {
            excluded_failures: vec![FailureKind::Status(503), FailureKind::Timeout],
            ..Default::default()
        };
        let status = |code: u16| {
            Outcome::RetryableFailure(Failure::new(FailureCause::Status(Response::with_status(
                StatusCode::from_u16(code).unwrap(),
            ))))
        };

        assert_eq!(config.verdict(&status(500)), CallVerdict::Failure);
        assert_eq!(config.verdict(&status(503)), CallVerdict::Ignored);
        assert_eq!(config.verdict(&status(404)), CallVerdict::Success);
        assert_eq!(
            config.verdict(&Outcome::Success(Response::with_status(StatusCode::OK))),
            CallVerdict::Success
        );
        let connect = Outcome::RetryableFailure(Failure::new(FailureCause::Transport(
            TransportError::connect("refused"),
        )));
        assert_eq!(config.verdict(&connect), CallVerdict::Failure);
        let timeout = Outcome::RetryableFailure(Failure::new(FailureCause::Transport(
            TransportError::read_timeout(Duration::from_secs(1)),
        )));
        assert_eq!(config.verdict(&timeout), CallVerdict::Ignored);
    }

    #[test]
    fn test_concurrent_half_open_admission_is_capped() {
        let (cb, clock) = breaker(open_config());
        for _ in 0..3 {
            fail(&cb);
        }
        clock.advance(Duration::from_secs(10));

        let barrier = std::sync::Barrier::new(16);
        let admitted: Vec<BreakerPermit> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        cb.try_acquire().ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .collect()
        });

        assert_eq!(admitted.len(), 2);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_registry_scopes() {
        let clock: SharedClock = Arc::new(ManualClock::new());
        let global = CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), clock.clone());
        assert!(Arc::ptr_eq(&global.get("http://a:80"), &global.get("http://b:80")));
        assert_eq!(global.get("http://a:80").target(), GLOBAL_TARGET);

        let per_host = CircuitBreakerRegistry::new(
            CircuitBreakerConfig {
                per_host: true,
                ..Default::default()
            },
            clock,
        );
        assert!(per_host.find("http://a:80").is_none());
        let a = per_host.get("http://a:80");
        assert!(!Arc::ptr_eq(&a, &per_host.get("http://b:80")));
        assert!(Arc::ptr_eq(&a, &per_host.get("http://a:80")));
        assert_eq!(per_host.all().len(), 2);
    }
}
