//! Error taxonomy surfaced to callers.

use crate::outcome::{
    FailureCause, LimitReason, Outcome, RejectionReason, RetryTermination,
};
use crate::response::Response;
use crate::transport::TransportError;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything known about the call that failed.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Request method
    pub method: Option<Method>,
    /// Request URL
    pub url: Option<Url>,
    /// Final response status, if a response arrived
    pub status: Option<StatusCode>,
    /// Final response headers
    pub headers: HeaderMap,
    /// Final response body
    pub body: Option<Bytes>,
    /// Attempts made
    pub attempts: u32,
    /// Time spent on the logical call
    pub elapsed: Duration,
    /// Why retrying stopped
    pub termination: Option<RetryTermination>,
}

impl ErrorContext {
    /// Context for a call on `method` `url`
    #[must_use]
    pub fn for_request(method: Method, url: Url) -> Self {
        Self {
            method: Some(method),
            url: Some(url),
            ..Self::default()
        }
    }

    /// Set the elapsed time
    #[must_use]
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    fn with_response(mut self, response: &Response) -> Self {
        self.status = Some(response.status());
        self.headers = response.headers().clone();
        self.body = Some(response.body().clone());
        self
    }
}

/// Origin of a rate limit error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitOrigin {
    /// The local limiter refused admission
    Local {
        /// Scope key that refused
        scope: String,
        /// Why it refused
        reason: LimitReason,
    },
    /// The server answered 429
    Server,
}

/// Errors returned by the pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// Connect/read/write/pool failure or timeout
    #[error("transport failure: {source}")]
    Transport {
        /// Underlying transport error
        source: TransportError,
        /// Call context
        context: Box<ErrorContext>,
    },

    /// Breaker open or half-open probe limit reached
    #[error("circuit {reason} for {target}")]
    CircuitRejected {
        /// Target whose breaker refused
        target: String,
        /// Why it refused
        reason: RejectionReason,
        /// Time until a probe is admitted, if known
        retry_in: Option<Duration>,
        /// Call context
        context: Box<ErrorContext>,
    },

    /// Local limiter refusal or server 429
    #[error("rate limit exceeded ({})", rate_limit_label(.origin))]
    RateLimitExceeded {
        /// Local or server
        origin: RateLimitOrigin,
        /// Server-suggested wait
        retry_after: Option<Duration>,
        /// Call context
        context: Box<ErrorContext>,
    },

    /// 5xx response
    #[error("server error {status}")]
    Server {
        /// Status code
        status: StatusCode,
        /// Call context
        context: Box<ErrorContext>,
    },

    /// 4xx response other than 429
    #[error("client error {status}")]
    Client {
        /// Status code
        status: StatusCode,
        /// Call context
        context: Box<ErrorContext>,
    },

    /// Body failed to encode, decode or validate
    #[error("validation error: {message}")]
    Validation {
        /// What failed
        message: String,
        /// Call context, when raised on a response
        context: Option<Box<ErrorContext>>,
    },

    /// Invalid configuration or policy composition
    #[error("configuration error: {message}")]
    Configuration {
        /// What is wrong
        message: String,
    },

    /// Cache backend or key pattern failed outside a call
    #[error("cache error: {message}")]
    Cache {
        /// What failed
        message: String,
    },

    /// `only-if-cached` request with no usable entry
    #[error("no cached response available")]
    NotCached {
        /// Call context
        context: Box<ErrorContext>,
    },

    /// Total deadline elapsed
    #[error("call cancelled: {message}")]
    Cancelled {
        /// Reason
        message: String,
        /// Call context
        context: Box<ErrorContext>,
    },

    /// Auth provider failed to decorate or refresh
    #[error("authentication provider error: {message}")]
    Authentication {
        /// Reason
        message: String,
        /// Call context
        context: Box<ErrorContext>,
    },
}

fn rate_limit_label(origin: &RateLimitOrigin) -> String {
    match origin {
        RateLimitOrigin::Local { scope, reason } => format!("local {scope}: {reason}"),
        RateLimitOrigin::Server => "server responded 429".to_string(),
    }
}

/// Coarse error kind for matching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// [`Error::Transport`]
    Transport,
    /// [`Error::CircuitRejected`]
    CircuitRejected,
    /// [`Error::RateLimitExceeded`]
    RateLimitExceeded,
    /// [`Error::Server`]
    Server,
    /// [`Error::Client`]
    Client,
    /// [`Error::Validation`]
    Validation,
    /// [`Error::Configuration`]
    Configuration,
    /// [`Error::Cache`]
    Cache,
    /// [`Error::NotCached`]
    NotCached,
    /// [`Error::Cancelled`]
    Cancelled,
    /// [`Error::Authentication`]
    Authentication,
}

impl Error {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a cache maintenance error
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    /// Create a validation error without call context
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            context: None,
        }
    }

    /// Convert a final outcome into a result
    ///
    /// # Errors
    /// Returns the error matching the failure kind for any non-success outcome
    pub fn from_outcome(outcome: Outcome, context: ErrorContext) -> Result<Response> {
        let (failure, mut context) = match outcome {
            Outcome::Success(response) => return Ok(response),
            Outcome::CircuitRejected(rejection) => {
                let mut context = context;
                context.attempts = rejection.attempts;
                context.termination = Some(RetryTermination::NotRetryable(
                    crate::outcome::NotRetryableReason::CircuitRejected,
                ));
                return Err(Self::CircuitRejected {
                    target: rejection.target,
                    reason: rejection.reason,
                    retry_in: rejection.retry_in,
                    context: Box::new(context),
                });
            }
            Outcome::RetryableFailure(failure) | Outcome::FatalFailure(failure) => {
                (failure, context)
            }
        };

        context.attempts = failure.attempts;
        context.termination = failure.termination;
        let retry_after = failure.retry_after;

        Err(match failure.cause {
            FailureCause::Transport(source) => Self::Transport {
                source,
                context: Box::new(context),
            },
            FailureCause::Status(response) => {
                let status = response.status();
                let context = Box::new(context.with_response(&response));
                if status == StatusCode::TOO_MANY_REQUESTS {
                    Self::RateLimitExceeded {
                        origin: RateLimitOrigin::Server,
                        retry_after,
                        context,
                    }
                } else if status.is_server_error() {
                    Self::Server { status, context }
                } else {
                    Self::Client { status, context }
                }
            }
            FailureCause::RateLimited(rejection) => Self::RateLimitExceeded {
                origin: RateLimitOrigin::Local {
                    scope: rejection.scope,
                    reason: rejection.reason,
                },
                retry_after,
                context: Box::new(context),
            },
            FailureCause::Validation(message) => Self::Validation {
                message,
                context: Some(Box::new(context)),
            },
            FailureCause::NotCached => Self::NotCached {
                context: Box::new(context),
            },
            FailureCause::Cancelled(message) => Self::Cancelled {
                message,
                context: Box::new(context),
            },
            FailureCause::Auth(message) => Self::Authentication {
                message,
                context: Box::new(context),
            },
        })
    }

    /// Coarse kind
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transport,
            Self::CircuitRejected { .. } => ErrorKind::CircuitRejected,
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Self::Server { .. } => ErrorKind::Server,
            Self::Client { .. } => ErrorKind::Client,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Cache { .. } => ErrorKind::Cache,
            Self::NotCached { .. } => ErrorKind::NotCached,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Authentication { .. } => ErrorKind::Authentication,
        }
    }

    /// Call context, absent for configuration and cache errors
    #[must_use]
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Transport { context, .. }
            | Self::CircuitRejected { context, .. }
            | Self::RateLimitExceeded { context, .. }
            | Self::Server { context, .. }
            | Self::Client { context, .. }
            | Self::NotCached { context }
            | Self::Cancelled { context, .. }
            | Self::Authentication { context, .. } => Some(&**context),
            Self::Validation { context, .. } => context.as_deref(),
            Self::Configuration { .. } | Self::Cache { .. } => None,
        }
    }

    /// Response status, if a response arrived
    #[must_use]
    pub fn status_code(&self) -> Option<StatusCode> {
        self.context().and_then(|c| c.status)
    }

    /// Attempts made
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.context().map_or(0, |c| c.attempts)
    }

    /// Why retrying stopped
    #[must_use]
    pub fn termination(&self) -> Option<RetryTermination> {
        self.context().and_then(|c| c.termination)
    }

    /// Whether the retry budget ran out
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.termination() == Some(RetryTermination::Exhausted)
    }

    /// Whether the caller may reasonably try again later
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::RateLimitExceeded { .. } | Self::Server { .. } => true,
            Self::CircuitRejected { .. } => true,
            _ => false,
        }
    }

    /// Suggested wait before trying again
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after, .. } => *retry_after,
            Self::CircuitRejected { retry_in, .. } => *retry_in,
            _ => None,
        }
    }

    /// 401
    #[must_use]
    pub fn is_authentication(&self) -> bool {
        self.status_code() == Some(StatusCode::UNAUTHORIZED)
    }

    /// 403
    #[must_use]
    pub fn is_forbidden(&self) -> bool {
        self.status_code() == Some(StatusCode::FORBIDDEN)
    }

    /// 404
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(StatusCode::NOT_FOUND)
    }
}
