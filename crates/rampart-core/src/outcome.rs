//! Classified result of one attempt or one logical call.
//!
//! The same [`Outcome`] drives the retry loop, breaker accounting and the
//! middleware chain. It is converted into a `Result` only at the public
//! client surface.

use crate::response::Response;
use crate::transport::TransportError;
use std::fmt;
use std::time::{Duration, SystemTime};

/// Classified outcome
#[derive(Debug, Clone)]
pub enum Outcome {
    /// A usable response (2xx, 3xx, or a status the policy does not treat as failure)
    Success(Response),
    /// A failure that another attempt may cure
    RetryableFailure(Failure),
    /// A failure that another attempt will not cure
    FatalFailure(Failure),
    /// The circuit breaker refused the call without contacting the target
    CircuitRejected(Rejection),
}

impl Outcome {
    /// Classify a raw transport result.
    ///
    /// Transport errors and statuses in `retry_statuses` are retryable, other
    /// 4xx/5xx statuses are fatal, everything else succeeds.
    #[must_use]
    pub fn classify(
        result: Result<Response, TransportError>,
        retry_statuses: &[u16],
        now: SystemTime,
    ) -> Self {
        match result {
            Err(err) => Self::RetryableFailure(Failure::new(FailureCause::Transport(err))),
            Ok(response) => {
                let status = response.status();
                if retry_statuses.contains(&status.as_u16()) {
                    let retry_after = response.retry_after(now);
                    Self::RetryableFailure(
                        Failure::new(FailureCause::Status(response)).with_retry_after(retry_after),
                    )
                } else if status.is_client_error() || status.is_server_error() {
                    let retry_after = response.retry_after(now);
                    Self::FatalFailure(
                        Failure::new(FailureCause::Status(response)).with_retry_after(retry_after),
                    )
                } else {
                    Self::Success(response)
                }
            }
        }
    }

    /// Whether this is a success
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// The response carried by this outcome, if any
    #[must_use]
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Success(response) => Some(response),
            Self::RetryableFailure(failure) | Self::FatalFailure(failure) => failure.response(),
            Self::CircuitRejected(_) => None,
        }
    }

    /// The failure carried by this outcome, if any
    #[must_use]
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::RetryableFailure(failure) | Self::FatalFailure(failure) => Some(failure),
            _ => None,
        }
    }

    /// Label for logs and metrics
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::RetryableFailure(_) => "retryable_failure",
            Self::FatalFailure(_) => "fatal_failure",
            Self::CircuitRejected(_) => "circuit_rejected",
        }
    }

    /// Stamp retry bookkeeping onto a failure outcome
    #[must_use]
    pub fn with_retry_context(self, attempts: u32, termination: RetryTermination) -> Self {
        match self {
            Self::RetryableFailure(failure) => {
                Self::RetryableFailure(failure.with_retry_context(attempts, termination))
            }
            Self::FatalFailure(failure) => {
                Self::FatalFailure(failure.with_retry_context(attempts, termination))
            }
            Self::CircuitRejected(mut rejection) => {
                rejection.attempts = attempts;
                Self::CircuitRejected(rejection)
            }
            other => other,
        }
    }
}

/// A failed call and what is known about it
#[derive(Debug, Clone)]
pub struct Failure {
    /// What went wrong
    pub cause: FailureCause,
    /// Server-suggested delay before the next attempt
    pub retry_after: Option<Duration>,
    /// Attempts made when the failure became final
    pub attempts: u32,
    /// Why the retry loop stopped, once it has
    pub termination: Option<RetryTermination>,
}

impl Failure {
    /// Failure with no retry bookkeeping yet
    #[must_use]
    pub fn new(cause: FailureCause) -> Self {
        Self {
            cause,
            retry_after: None,
            attempts: 1,
            termination: None,
        }
    }

    /// Attach a server-suggested delay
    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Attach retry bookkeeping
    #[must_use]
    pub fn with_retry_context(mut self, attempts: u32, termination: RetryTermination) -> Self {
        self.attempts = attempts;
        self.termination = Some(termination);
        self
    }

    /// Response behind a status failure
    #[must_use]
    pub fn response(&self) -> Option<&Response> {
        match &self.cause {
            FailureCause::Status(response) => Some(response),
            _ => None,
        }
    }

    /// Status code behind a status failure
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.response().map(|r| r.status().as_u16())
    }
}

/// Cause of a failure
#[derive(Debug, Clone)]
pub enum FailureCause {
    /// The transport failed before a response arrived
    Transport(TransportError),
    /// The target answered with a failing status
    Status(Response),
    /// The local rate limiter did not admit the call
    RateLimited(LimitRejection),
    /// The response body did not decode
    Validation(String),
    /// `only-if-cached` found nothing usable
    NotCached,
    /// The call's total deadline elapsed
    Cancelled(String),
    /// The auth provider could not decorate the request
    Auth(String),
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "{err}"),
            Self::Status(response) => write!(f, "status {}", response.status().as_u16()),
            Self::RateLimited(rejection) => {
                write!(f, "rate limited on {}: {}", rejection.scope, rejection.reason)
            }
            Self::Validation(message) => write!(f, "invalid response: {message}"),
            Self::NotCached => write!(f, "not cached"),
            Self::Cancelled(message) => write!(f, "cancelled: {message}"),
            Self::Auth(message) => write!(f, "auth failed: {message}"),
        }
    }
}

/// Local rate limiter refusal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitRejection {
    /// Scope key that refused
    pub scope: String,
    /// Why it refused
    pub reason: LimitReason,
    /// Time spent queued before refusal
    pub waited: Duration,
}

/// Why a limiter refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitReason {
    /// The wait queue was full
    QueueFull,
    /// No capacity within `queue_timeout`
    QueueTimeout,
}

impl fmt::Display for LimitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => write!(f, "queue full"),
            Self::QueueTimeout => write!(f, "queue timeout"),
        }
    }
}

/// Circuit breaker refusal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Target whose breaker refused
    pub target: String,
    /// Why it refused
    pub reason: RejectionReason,
    /// Time until the breaker will admit a probe, if known
    pub retry_in: Option<Duration>,
    /// Attempts made before the refusal
    pub attempts: u32,
}

/// Why a breaker refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    /// Open and the reset timeout has not elapsed
    Open,
    /// Held open by an operator
    ForcedOpen,
    /// Half-open and every probe slot is taken
    HalfOpenSaturated,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::ForcedOpen => write!(f, "forced open"),
            Self::HalfOpenSaturated => write!(f, "half-open probe limit reached"),
        }
    }
}

/// Why the retry loop stopped without success
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryTermination {
    /// Every allowed attempt failed retryably
    Exhausted,
    /// Policy forbade another attempt
    NotRetryable(NotRetryableReason),
}

/// Policy reason for not retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotRetryableReason {
    /// The outcome was fatal
    FatalOutcome,
    /// The breaker rejected the attempt
    CircuitRejected,
    /// Non-idempotent method without key or opt-in
    MethodNotEligible,
    /// The next delay would overrun the call deadline
    DeadlineExceeded,
}

impl fmt::Display for RetryTermination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => write!(f, "retries exhausted"),
            Self::NotRetryable(NotRetryableReason::FatalOutcome) => write!(f, "not retryable"),
            Self::NotRetryable(NotRetryableReason::CircuitRejected) => {
                write!(f, "not retried: circuit rejected")
            }
            Self::NotRetryable(NotRetryableReason::MethodNotEligible) => {
                write!(f, "not retried: method is not idempotent")
            }
            Self::NotRetryable(NotRetryableReason::DeadlineExceeded) => {
                write!(f, "not retried: deadline exceeded")
            }
        }
    }
}
