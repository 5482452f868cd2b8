//! # Rampart Client
//!
//! Resilient HTTP client assembled from the rampart components.
//!
//! Every call runs through a per-call middleware chain, then the dispatch
//! pipeline: auth, cache, rate limiter and the retry loop, whose attempts
//! each pass the circuit breaker, a per-attempt middleware chain and the
//! transport.
//!
//! ## Features
//!
//! - `rustls` (default): TLS through rustls
//! - `blocking`: [`BlockingClient`], a synchronous facade
//!
//! ## Example
//!
//! ```rust,no_run
//! use rampart_client::Client;
//! use rampart_resilience::RetryConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), rampart_core::Error> {
//!     let client = Client::builder()
//!         .base_url("https://api.example.com")
//!         .retry(RetryConfig::default())
//!         .build()
//!         .await?;
//!
//!     let user: serde_json::Value = client.get("/users/42").send_json().await?;
//!     println!("{user}");
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

#[cfg(feature = "blocking")]
pub mod blocking;
pub mod client;
mod dispatch;
pub mod pagination;
pub mod transport;

#[cfg(test)]
mod test_support;

#[cfg(feature = "blocking")]
pub use blocking::{BlockingClient, BlockingPaginator, BlockingRequestBuilder};
pub use client::{Client, ClientBuilder, RequestBuilder};
pub use dispatch::Fallback;
pub use pagination::{OffsetLimitPagination, PageParams, PaginationStrategy, Paginator};
pub use transport::ReqwestTransport;
