//! # Rampart
//!
//! Resilient HTTP client pipeline.
//!
//! Calls pass a per-call middleware chain, the response cache, the rate
//! limiter and a retry loop. Each attempt inside the loop is gated by a
//! circuit breaker and runs a per-attempt middleware chain before it reaches
//! the transport.
//!
//! ## Crates
//!
//! - [`core`]: request and response types, outcomes, errors, clocks, auth
//!   and the middleware chain
//! - [`resilience`]: circuit breaker, rate limiter, retry policy, HTTP cache
//! - [`config`]: client configuration and layered loading
//! - [`client`]: async and blocking clients, reqwest transport, pagination
//! - [`telemetry`]: tracing setup, logging and metrics middleware
//!
//! ## Example
//!
//! ```rust,no_run
//! use rampart::{Client, RetryConfig};
//!
//! #[tokio::main]
//! async fn main() -> rampart::Result<()> {
//!     let client = Client::builder()
//!         .base_url("https://api.example.com")
//!         .retry(RetryConfig::default())
//!         .build()
//!         .await?;
//!
//!     let orders: Vec<serde_json::Value> = client
//!         .paginate("/orders")
//!         .collect_all()
//!         .await?;
//!     println!("{} orders", orders.len());
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub use rampart_client as client;
pub use rampart_config as config;
pub use rampart_core as core;
pub use rampart_resilience as resilience;
pub use rampart_telemetry as telemetry;

#[cfg(feature = "blocking")]
pub use rampart_client::{BlockingClient, BlockingPaginator, BlockingRequestBuilder};
pub use rampart_client::{
    Client, ClientBuilder, Fallback, OffsetLimitPagination, PaginationStrategy, Paginator,
    RequestBuilder,
};
pub use rampart_config::{ClientConfig, ConfigLoader, TimeoutConfig};
pub use rampart_core::{
    CacheDirective, Error, ErrorKind, Middleware, Next, RequestDescriptor, Response,
    ResponseSource, Result, Transport,
};
pub use rampart_resilience::{
    CacheConfig, CircuitBreakerConfig, CircuitState, RateLimitConfig, RetryConfig,
};
pub use rampart_telemetry::{init_tracing, LoggingMiddleware, Metrics, TracingConfig};
