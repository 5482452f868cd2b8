//! # Rampart Core
//!
//! Core types, traits, and error handling shared by every rampart crate:
//! - Request descriptors, responses and classified outcomes
//! - The middleware contract and its continuation
//! - Transport, auth and clock capabilities
//! - The error taxonomy surfaced to callers

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod clock;
pub mod codec;
pub mod error;
pub mod middleware;
pub mod outcome;
pub mod request;
pub mod response;
pub mod transport;

// Re-export commonly used types
pub use auth::{AuthProvider, BasicAuth, BearerAuth, TokenRefresher};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{Error, ErrorContext, ErrorKind, RateLimitOrigin, Result};
pub use middleware::{Endpoint, Middleware, MiddlewareChain, Next};
pub use outcome::{
    Failure, FailureCause, LimitReason, LimitRejection, NotRetryableReason, Outcome, Rejection,
    RejectionReason, RetryTermination,
};
pub use request::{
    CacheDirective, CacheDirectives, RequestDescriptor, RequestDescriptorBuilder, RequestOptions,
    RetryOverride,
};
pub use response::{Response, ResponseSource, ServerRateLimit};
pub use transport::{Transport, TransportError};

pub use bytes::Bytes;
pub use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
pub use url::Url;
