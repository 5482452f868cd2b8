//! Terminal handler of the per-call chain.
//!
//! For one logical call the pipeline runs, in order:
//!
//! 1. auth decoration and idempotency key generation
//! 2. cache lookup (a fresh hit returns here, a stale hit turns the call
//!    into a conditional request)
//! 3. rate limiter admission
//! 4. the retry loop, where every attempt passes the circuit breaker gate,
//!    the per-attempt middleware chain and the transport
//! 5. fallback substitution for circuit rejections
//! 6. cache store, revalidation or invalidation
//!
//! No lock is held across any of the awaits above; each component keeps its
//! own short critical sections.

use async_trait::async_trait;
use rampart_config::TimeoutConfig;
use rampart_core::{
    AuthProvider, Clock, Endpoint, Failure, FailureCause, MiddlewareChain, Outcome, Rejection,
    RequestDescriptor, ResponseSource, SharedClock, StatusCode, Transport,
};
use rampart_resilience::{
    CacheEntry, CacheLookup, CircuitBreakerRegistry, RateLimiter, ResponseCache, RetryPolicy,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Supplies a substitute outcome when the circuit breaker rejects a call.
#[async_trait]
pub trait Fallback: Send + Sync {
    /// Outcome returned to the caller instead of the rejection
    async fn on_rejected(&self, request: &RequestDescriptor, rejection: &Rejection) -> Outcome;
}

/// Everything one client instance owns.
pub(crate) struct Pipeline {
    pub(crate) per_call: MiddlewareChain,
    pub(crate) per_attempt: MiddlewareChain,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) breakers: CircuitBreakerRegistry,
    pub(crate) limiter: RateLimiter,
    pub(crate) cache: Option<ResponseCache>,
    pub(crate) retry: RetryPolicy,
    pub(crate) auth: Option<Arc<dyn AuthProvider>>,
    pub(crate) fallback: Option<Arc<dyn Fallback>>,
    pub(crate) clock: SharedClock,
    pub(crate) timeouts: TimeoutConfig,
    pub(crate) generate_idempotency_keys: bool,
}

impl Pipeline {
    /// Run `request` through the per-call chain and the terminal handler
    pub(crate) async fn dispatch(&self, request: RequestDescriptor) -> Outcome {
        self.per_call.run(request, self).await
    }

    async fn run(&self, request: RequestDescriptor, deadline: Option<Instant>) -> Outcome {
        let mut request = match &self.auth {
            Some(auth) => match auth.apply(request).await {
                Ok(request) => request,
                Err(e) => return auth_failure(&e),
            },
            None => request,
        };
        if self.generate_idempotency_keys && !request.is_idempotent() {
            request.ensure_idempotency_key();
        }

        let directives = request.cache_directives();
        let mut stale: Option<CacheEntry> = None;
        match self
            .cache
            .as_ref()
            .filter(|cache| cache.applies_to(&request) && !directives.no_store)
        {
            Some(cache) => match cache.lookup(&request).await {
                CacheLookup::Fresh(entry) if !directives.no_cache => {
                    return Outcome::Success(entry.to_response(ResponseSource::Cache));
                }
                CacheLookup::Fresh(entry) | CacheLookup::Stale(entry)
                    if !directives.only_if_cached =>
                {
                    stale = Some(entry);
                }
                _ if directives.only_if_cached => return not_cached(),
                _ => {}
            },
            None if directives.only_if_cached => return not_cached(),
            None => {}
        }

        let outgoing = match &stale {
            Some(entry) => ResponseCache::conditional_request(&request, entry),
            None => request.clone(),
        };

        let permit = match self.limiter.acquire(&outgoing).await {
            Ok(permit) => permit,
            Err(rejection) => {
                let mut failure = Failure::new(FailureCause::RateLimited(rejection));
                failure.attempts = 0;
                return Outcome::FatalFailure(failure);
            }
        };

        let policy = match &outgoing.options().retry {
            Some(overrides) => self.retry.with_override(overrides),
            None => self.retry.clone(),
        };
        let refreshed = AtomicBool::new(false);
        let refreshed = &refreshed;
        let attempt_request = &outgoing;
        let report = policy
            .execute(&outgoing, self.clock.as_ref(), deadline, move |attempt| {
                self.attempt(attempt_request.for_attempt(), attempt, deadline, refreshed)
            })
            .await;

        if report.attempts == 0 {
            // The breaker refused before the transport was reached.
            permit.refund();
        } else {
            drop(permit);
        }

        let outcome = report.outcome;
        if let (Some(fallback), Outcome::CircuitRejected(rejection)) = (&self.fallback, &outcome) {
            debug!(circuit = %rejection.target, url = %request.url(), "Serving fallback");
            // Substitutes never touch the cache.
            return match fallback.on_rejected(&request, rejection).await {
                Outcome::Success(response) => {
                    Outcome::Success(response.with_source(ResponseSource::Fallback))
                }
                other => other,
            };
        }

        if let (Some(cache), Outcome::Success(response)) = (&self.cache, &outcome) {
            if !request.is_safe() {
                let removed = cache.invalidate_url(&request).await;
                if removed > 0 {
                    debug!(
                        url = %request.url(),
                        removed = removed,
                        "Invalidated cache after unsafe request"
                    );
                }
            } else if let Some(entry) = stale
                .as_ref()
                .filter(|_| response.status() == StatusCode::NOT_MODIFIED)
            {
                return Outcome::Success(cache.revalidated(&request, entry, response).await);
            } else if response.source() == ResponseSource::Network {
                cache.store(&request, response).await;
            }
        }
        outcome
    }

    async fn attempt(
        &self,
        request: RequestDescriptor,
        attempt: u32,
        deadline: Option<Instant>,
        refreshed: &AtomicBool,
    ) -> Outcome {
        let permit = if self.breakers.config().enabled {
            let breaker = self.breakers.get(&request.target());
            match breaker.try_acquire() {
                Ok(permit) => Some(permit),
                Err(rejection) => {
                    warn!(
                        circuit = %rejection.target,
                        reason = %rejection.reason,
                        attempt = attempt,
                        "Circuit breaker rejected attempt"
                    );
                    return Outcome::CircuitRejected(rejection);
                }
            }
        } else {
            None
        };

        let mut timeout = request
            .options()
            .timeout
            .unwrap_or_else(|| self.timeouts.attempt_timeout());
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(self.clock.now());
            if remaining.is_zero() {
                return cancelled("total timeout elapsed before attempt");
            }
            timeout = timeout.min(remaining);
        }

        let endpoint = TransportEndpoint {
            transport: self.transport.as_ref(),
            timeout,
            retry_statuses: &self.retry.config().retry_statuses,
            clock: self.clock.as_ref(),
        };
        let mut outcome = self.per_attempt.run(request.clone(), &endpoint).await;

        if let Some(auth) = &self.auth {
            let unauthorized = outcome.failure().and_then(Failure::status) == Some(401);
            if unauthorized && !refreshed.swap(true, Ordering::SeqCst) {
                outcome = self
                    .refresh_and_resend(auth.as_ref(), request.clone(), &endpoint)
                    .await
                    .unwrap_or(outcome);
            }
        }

        if let Some(permit) = permit {
            permit.record_outcome(&outcome);
        }
        if let Some(response) = outcome.response() {
            self.limiter.observe_response(&request, response);
        }
        debug!(
            attempt = attempt,
            url = %request.url(),
            outcome = outcome.label(),
            "Attempt finished"
        );
        outcome
    }

    /// Refresh credentials after a 401 and send once more. `None` keeps the
    /// original outcome.
    async fn refresh_and_resend(
        &self,
        auth: &dyn AuthProvider,
        request: RequestDescriptor,
        endpoint: &TransportEndpoint<'_>,
    ) -> Option<Outcome> {
        match auth.refresh().await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                warn!(error = %e, "Credential refresh failed");
                return None;
            }
        }
        debug!(url = %request.url(), "Credentials refreshed, resending");
        Some(match auth.apply(request).await {
            Ok(request) => self.per_attempt.run(request, endpoint).await,
            Err(e) => auth_failure(&e),
        })
    }
}

#[async_trait]
impl Endpoint for Pipeline {
    async fn call(&self, request: RequestDescriptor) -> Outcome {
        let Some(total) = self.timeouts.total else {
            return self.run(request, None).await;
        };
        let deadline = self.clock.now() + total;
        let url = request.url().clone();
        match tokio::time::timeout(total, self.run(request, Some(deadline))).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    url = %url,
                    total_ms = total.as_millis() as u64,
                    "Call cancelled at total deadline"
                );
                cancelled(&format!("total timeout of {}ms elapsed", total.as_millis()))
            }
        }
    }
}

/// Innermost handler of the per-attempt chain.
struct TransportEndpoint<'a> {
    transport: &'a dyn Transport,
    timeout: Duration,
    retry_statuses: &'a [u16],
    clock: &'a dyn Clock,
}

#[async_trait]
impl<'a> Endpoint for TransportEndpoint<'a> {
    async fn call(&self, request: RequestDescriptor) -> Outcome {
        let result = self.transport.send(&request, self.timeout).await;
        if let Err(err) = &result {
            debug!(
                transport = self.transport.name(),
                phase = err.phase(),
                timed_out = err.is_timeout(),
                error = %err,
                "Transport failed"
            );
        }
        Outcome::classify(result, self.retry_statuses, self.clock.wall_time())
    }
}

fn not_cached() -> Outcome {
    let mut failure = Failure::new(FailureCause::NotCached);
    failure.attempts = 0;
    Outcome::FatalFailure(failure)
}

fn cancelled(message: &str) -> Outcome {
    Outcome::FatalFailure(Failure::new(FailureCause::Cancelled(message.to_string())))
}

fn auth_failure(error: &rampart_core::Error) -> Outcome {
    let mut failure = Failure::new(FailureCause::Auth(error.to_string()));
    failure.attempts = 0;
    Outcome::FatalFailure(failure)
}
