//! Client-side admission control.
//!
//! Each configured [`LimitScope`] keeps its own state per scope key (one
//! global bucket, one per host, one per endpoint). A request is admitted only
//! when every applicable scope admits it. Callers that cannot be admitted at
//! once queue for up to `queue_timeout`, bounded by `queue_size` per scope.
//!
//! All algorithms refill lazily from the injected clock on each acquisition;
//! there is no background task.

use dashmap::DashMap;
use parking_lot::Mutex;
use rampart_core::{
    Clock, LimitReason, LimitRejection, RequestDescriptor, Response, ServerRateLimit, SharedClock,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use validator::{Validate, ValidationError};

/// Admission algorithm
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    /// Bucket of `burst_size` tokens refilled at `max_requests / time_window`
    #[default]
    TokenBucket,
    /// At most `max_requests` per aligned `time_window`
    FixedWindow,
    /// At most `max_requests` in any trailing `time_window`
    SlidingWindow,
}

/// Granularity at which state is kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    /// One limiter for every request of the client
    Global,
    /// One limiter per host
    PerHost,
    /// One limiter per method and path
    PerEndpoint,
}

impl LimitScope {
    /// Key of the limiter that governs `request` in this scope
    #[must_use]
    pub fn key_for(&self, request: &RequestDescriptor) -> String {
        match self {
            Self::Global => "global".to_string(),
            Self::PerHost => format!("host:{}", request.host()),
            Self::PerEndpoint => format!("endpoint:{}", request.endpoint()),
        }
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_scopes"))]
pub struct RateLimitConfig {
    /// Whether calls are limited at all
    pub enabled: bool,
    /// Admission algorithm
    pub strategy: RateLimitStrategy,
    /// Requests allowed per `time_window`
    #[validate(range(min = 1))]
    pub max_requests: u32,
    /// Window length, also the token bucket refill period
    #[serde(with = "humantime_serde")]
    pub time_window: Duration,
    /// Token bucket capacity
    #[validate(range(min = 1))]
    pub burst_size: u32,
    /// Callers allowed to wait per scope key
    pub queue_size: usize,
    /// Longest a caller waits for admission
    #[serde(with = "humantime_serde")]
    pub queue_timeout: Duration,
    /// Delay admissions after a 429/503 carrying `Retry-After`
    pub respect_retry_after: bool,
    /// Scopes that must all admit a request
    pub scopes: Vec<LimitScope>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: RateLimitStrategy::TokenBucket,
            max_requests: 100,
            time_window: Duration::from_secs(60),
            burst_size: 10,
            queue_size: 50,
            queue_timeout: Duration::from_secs(30),
            respect_retry_after: true,
            scopes: vec![LimitScope::Global],
        }
    }
}

fn validate_scopes(config: &RateLimitConfig) -> Result<(), ValidationError> {
    if config.scopes.is_empty() {
        return Err(ValidationError::new("empty_scopes"));
    }
    if config.time_window.is_zero() {
        return Err(ValidationError::new("zero_time_window"));
    }
    Ok(())
}

impl RateLimitConfig {
    /// Time between token refills
    #[must_use]
    pub fn refill_interval(&self) -> Duration {
        self.time_window / self.max_requests.max(1)
    }
}

#[derive(Debug)]
enum Window {
    TokenBucket { tokens: f64, last_refill: Instant },
    FixedWindow { started: Instant, count: u32 },
    SlidingWindow { admitted: VecDeque<Instant> },
}

#[derive(Debug)]
struct ScopeState {
    window: Window,
    not_before: Option<Instant>,
    queued: usize,
}

impl ScopeState {
    fn new(config: &RateLimitConfig, now: Instant) -> Self {
        let window = match config.strategy {
            RateLimitStrategy::TokenBucket => Window::TokenBucket {
                tokens: f64::from(config.burst_size),
                last_refill: now,
            },
            RateLimitStrategy::FixedWindow => Window::FixedWindow {
                started: now,
                count: 0,
            },
            RateLimitStrategy::SlidingWindow => Window::SlidingWindow {
                admitted: VecDeque::new(),
            },
        };
        Self {
            window,
            not_before: None,
            queued: 0,
        }
    }

    /// Bring the window up to `now`
    fn advance(&mut self, config: &RateLimitConfig, now: Instant) {
        match &mut self.window {
            Window::TokenBucket {
                tokens,
                last_refill,
            } => {
                let elapsed = now.saturating_duration_since(*last_refill);
                let earned =
                    elapsed.as_nanos() as f64 / config.refill_interval().as_nanos().max(1) as f64;
                *tokens = (*tokens + earned).min(f64::from(config.burst_size));
                *last_refill = now;
            }
            Window::FixedWindow { started, count } => {
                let elapsed = now.saturating_duration_since(*started);
                if elapsed >= config.time_window {
                    let windows = elapsed.as_nanos() / config.time_window.as_nanos().max(1);
                    let skip = u32::try_from(windows).unwrap_or(u32::MAX);
                    *started += config.time_window.saturating_mul(skip);
                    *count = 0;
                }
            }
            Window::SlidingWindow { admitted } => {
                while admitted
                    .front()
                    .is_some_and(|t| now.saturating_duration_since(*t) >= config.time_window)
                {
                    admitted.pop_front();
                }
            }
        }
    }

    /// Take one unit of capacity, or report how long until one frees up
    fn try_admit(&mut self, config: &RateLimitConfig, now: Instant) -> Result<(), Duration> {
        if let Some(not_before) = self.not_before {
            if now < not_before {
                return Err(not_before - now);
            }
            self.not_before = None;
        }
        self.advance(config, now);
        match &mut self.window {
            Window::TokenBucket { tokens, .. } => {
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    Ok(())
                } else {
                    let deficit = 1.0 - *tokens;
                    let nanos =
                        (config.refill_interval().as_nanos() as f64 * deficit).ceil() as u64;
                    Err(Duration::from_nanos(nanos.max(1)))
                }
            }
            Window::FixedWindow { started, count } => {
                if *count < config.max_requests {
                    *count += 1;
                    Ok(())
                } else {
                    Err((*started + config.time_window).saturating_duration_since(now))
                }
            }
            Window::SlidingWindow { admitted } => {
                if admitted.len() < config.max_requests as usize {
                    admitted.push_back(now);
                    Ok(())
                } else {
                    let oldest = admitted.front().copied().unwrap_or(now);
                    Err((oldest + config.time_window).saturating_duration_since(now))
                }
            }
        }
    }

    /// Give back capacity taken at `admitted_at`
    fn refund(&mut self, config: &RateLimitConfig, admitted_at: Instant) {
        match &mut self.window {
            Window::TokenBucket { tokens, .. } => {
                *tokens = (*tokens + 1.0).min(f64::from(config.burst_size));
            }
            Window::FixedWindow { started, count } => {
                if admitted_at >= *started {
                    *count = count.saturating_sub(1);
                }
            }
            Window::SlidingWindow { admitted } => {
                if let Some(pos) = admitted.iter().rposition(|t| *t == admitted_at) {
                    admitted.remove(pos);
                }
            }
        }
    }

    fn remaining_and_reset(&mut self, config: &RateLimitConfig, now: Instant) -> (u32, Duration) {
        self.advance(config, now);
        let (remaining, reset_in) = match &self.window {
            Window::TokenBucket { tokens, .. } => {
                let missing = (f64::from(config.burst_size) - tokens).max(0.0);
                let (whole, refill_nanos) = (
                    tokens.floor().max(0.0) as u32,
                    (config.refill_interval().as_nanos() as f64 * missing).ceil() as u64,
                );
                (whole, Duration::from_nanos(refill_nanos))
            }
            Window::FixedWindow { started, count } => (
                config.max_requests.saturating_sub(*count),
                (*started + config.time_window).saturating_duration_since(now),
            ),
            Window::SlidingWindow { admitted } => (
                config
                    .max_requests
                    .saturating_sub(u32::try_from(admitted.len()).unwrap_or(u32::MAX)),
                admitted.front().map_or(Duration::ZERO, |t| {
                    (*t + config.time_window).saturating_duration_since(now)
                }),
            ),
        };
        match self.not_before {
            Some(not_before) if not_before > now => (0, reset_in.max(not_before - now)),
            _ => (remaining, reset_in),
        }
    }
}

/// Limiter state for one scope key.
#[derive(Debug)]
struct ScopedLimiter {
    key: String,
    state: Mutex<ScopeState>,
}

/// Capacity snapshot of one scope key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterStatus {
    /// Scope key
    pub scope: String,
    /// Configured requests per window
    pub limit: u32,
    /// Admissions available right now
    pub remaining: u32,
    /// Time until capacity is fully restored
    pub reset_in: Duration,
    /// Callers currently waiting
    pub queued: usize,
}

/// Capacity taken from every applicable scope.
///
/// Dropping a permit keeps the capacity consumed; call [`RatePermit::refund`]
/// when the request never reached the transport.
#[derive(Debug, Default)]
#[must_use = "dropping a permit consumes it"]
pub struct RatePermit {
    grants: Vec<(Arc<ScopedLimiter>, Instant)>,
    config: Option<Arc<RateLimitConfig>>,
}

impl RatePermit {
    /// Number of scopes that admitted the request
    #[must_use]
    pub fn scopes(&self) -> usize {
        self.grants.len()
    }

    /// Return the capacity to every scope
    pub fn refund(mut self) {
        refund_all(&mut self.grants, self.config.as_deref());
    }
}

fn refund_all(grants: &mut Vec<(Arc<ScopedLimiter>, Instant)>, config: Option<&RateLimitConfig>) {
    let Some(config) = config else {
        return;
    };
    for (scope, admitted_at) in grants.drain(..) {
        scope.state.lock().refund(config, admitted_at);
        debug!(scope = %scope.key, "Rate limit permit refunded");
    }
}

/// Grants collected so far; refunded if acquisition is abandoned.
struct PendingGrants<'a> {
    grants: Vec<(Arc<ScopedLimiter>, Instant)>,
    config: &'a RateLimitConfig,
}

impl Drop for PendingGrants<'_> {
    fn drop(&mut self) {
        refund_all(&mut self.grants, Some(self.config));
    }
}

/// Holds a queue slot; released on drop, including cancellation.
struct QueueSlot<'a>(&'a ScopedLimiter);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        state.queued = state.queued.saturating_sub(1);
    }
}

/// Rate limiter for one client.
#[derive(Debug)]
pub struct RateLimiter {
    config: Arc<RateLimitConfig>,
    clock: SharedClock,
    scopes: DashMap<String, Arc<ScopedLimiter>>,
    server_limits: DashMap<String, ServerRateLimit>,
}

impl RateLimiter {
    /// Create a limiter
    #[must_use]
    pub fn new(config: RateLimitConfig, clock: SharedClock) -> Self {
        Self {
            config: Arc::new(config),
            clock,
            scopes: DashMap::new(),
            server_limits: DashMap::new(),
        }
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn scope(&self, key: String) -> Arc<ScopedLimiter> {
        if let Some(existing) = self.scopes.get(&key) {
            return Arc::clone(existing.value());
        }
        let now = self.clock.now();
        let entry = self.scopes.entry(key.clone()).or_insert_with(|| {
            Arc::new(ScopedLimiter {
                state: Mutex::new(ScopeState::new(&self.config, now)),
                key,
            })
        });
        Arc::clone(entry.value())
    }

    fn scopes_for(&self, request: &RequestDescriptor) -> Vec<Arc<ScopedLimiter>> {
        self.config
            .scopes
            .iter()
            .map(|scope| self.scope(scope.key_for(request)))
            .collect()
    }

    /// Admit `request` under every configured scope, waiting up to
    /// `queue_timeout` in total.
    ///
    /// # Errors
    /// Returns a [`LimitRejection`] when a scope's queue is full or capacity
    /// did not free up in time. Capacity already taken from other scopes is
    /// refunded.
    pub async fn acquire(&self, request: &RequestDescriptor) -> Result<RatePermit, LimitRejection> {
        if !self.config.enabled {
            return Ok(RatePermit::default());
        }

        let started = self.clock.now();
        let deadline = started + self.config.queue_timeout;
        let mut pending = PendingGrants {
            grants: Vec::with_capacity(self.config.scopes.len()),
            config: &self.config,
        };

        for scope in self.scopes_for(request) {
            let admitted_at = self.acquire_scope(&scope, started, deadline).await?;
            pending.grants.push((scope, admitted_at));
        }

        debug!(url = %request.url(), scopes = pending.grants.len(), "Rate limit admitted");
        Ok(RatePermit {
            grants: std::mem::take(&mut pending.grants),
            config: Some(Arc::clone(&self.config)),
        })
    }

    async fn acquire_scope(
        &self,
        scope: &ScopedLimiter,
        started: Instant,
        deadline: Instant,
    ) -> Result<Instant, LimitRejection> {
        let mut slot = None;
        loop {
            let now = self.clock.now();
            let wait = {
                let mut state = scope.state.lock();
                match state.try_admit(&self.config, now) {
                    Ok(()) => return Ok(now),
                    Err(wait) => {
                        if slot.is_none() {
                            if state.queued >= self.config.queue_size {
                                warn!(
                                    scope = %scope.key,
                                    queued = state.queued,
                                    "Rate limit queue full"
                                );
                                return Err(self.rejection(scope, LimitReason::QueueFull, started));
                            }
                            state.queued += 1;
                            slot = Some(QueueSlot(scope));
                        }
                        wait
                    }
                }
            };

            let remaining = deadline.saturating_duration_since(now);
            if remaining.is_zero() {
                warn!(
                    scope = %scope.key,
                    waited_ms = now.saturating_duration_since(started).as_millis() as u64,
                    "Rate limit queue timeout"
                );
                return Err(self.rejection(scope, LimitReason::QueueTimeout, started));
            }
            debug!(
                scope = %scope.key,
                wait_ms = wait.as_millis() as u64,
                "Waiting for rate limit capacity"
            );
            self.clock.sleep(wait.min(remaining)).await;
        }
    }

    fn rejection(
        &self,
        scope: &ScopedLimiter,
        reason: LimitReason,
        started: Instant,
    ) -> LimitRejection {
        LimitRejection {
            scope: scope.key.clone(),
            reason,
            waited: self.clock.now().saturating_duration_since(started),
        }
    }

    /// Feed a response back into the limiter.
    ///
    /// Records `X-RateLimit-*` advisories for the host and, when
    /// `respect_retry_after` is set, holds back every applicable scope until
    /// a 429/503 `Retry-After` has passed.
    pub fn observe_response(&self, request: &RequestDescriptor, response: &Response) {
        let wall = self.clock.wall_time();
        if let Some(advisory) = response.server_rate_limit(wall) {
            self.server_limits.insert(request.host(), advisory);
        }

        if !self.config.enabled || !self.config.respect_retry_after {
            return;
        }
        let status = response.status().as_u16();
        if status != 429 && status != 503 {
            return;
        }
        let Some(delay) = response.retry_after(wall) else {
            return;
        };
        let until = self.clock.now() + delay;
        for scope in self.scopes_for(request) {
            let mut state = scope.state.lock();
            state.not_before = Some(state.not_before.map_or(until, |prev| prev.max(until)));
            debug!(
                scope = %scope.key,
                delay_ms = delay.as_millis() as u64,
                "Holding admissions for Retry-After"
            );
        }
    }

    /// Latest server advisory for `host`
    #[must_use]
    pub fn server_limit(&self, host: &str) -> Option<ServerRateLimit> {
        self.server_limits
            .get(&host.to_ascii_lowercase())
            .map(|entry| *entry.value())
    }

    /// Status of every scope that governs `request`
    #[must_use]
    pub fn status_for(&self, request: &RequestDescriptor) -> Vec<LimiterStatus> {
        self.scopes_for(request)
            .iter()
            .map(|scope| self.snapshot(scope))
            .collect()
    }

    /// Status of every scope key seen so far
    #[must_use]
    pub fn statuses(&self) -> Vec<LimiterStatus> {
        let mut all: Vec<_> = self
            .scopes
            .iter()
            .map(|entry| self.snapshot(entry.value()))
            .collect();
        all.sort_by(|a, b| a.scope.cmp(&b.scope));
        all
    }

    fn snapshot(&self, scope: &ScopedLimiter) -> LimiterStatus {
        let now = self.clock.now();
        let mut state = scope.state.lock();
        let (remaining, reset_in) = state.remaining_and_reset(&self.config, now);
        LimiterStatus {
            scope: scope.key.clone(),
            limit: self.config.max_requests,
            remaining,
            reset_in,
            queued: state.queued,
        }
    }
}
