//! Blocking calling convention.
//!
//! [`BlockingClient`] wraps an async [`Client`] together with a private
//! current-thread runtime. It shares breaker, limiter and cache state with
//! the wrapped client, may be used from any number of threads at once, and
//! must not be called from inside an async context.

use crate::client::{Client, ClientBuilder, RequestBuilder};
use crate::pagination::{OffsetLimitPagination, PaginationStrategy, Paginator};
use rampart_config::ClientConfig;
use rampart_core::{CacheDirective, Error, Method, Response, Result, RetryOverride};
use rampart_resilience::{CacheStats, CircuitBreakerStats};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

/// Synchronous facade over [`Client`].
#[derive(Debug, Clone)]
pub struct BlockingClient {
    inner: Client,
    runtime: Arc<Runtime>,
}

fn runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::configuration(format!("Failed to create runtime: {e}")))
}

impl BlockingClient {
    /// Create a client from a complete configuration.
    ///
    /// # Errors
    /// Returns a configuration error if `config` is invalid
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::from_builder(Client::builder().config(config))
    }

    /// Build the async client from `builder` on a fresh runtime.
    ///
    /// # Errors
    /// Returns the error of [`ClientBuilder::build`]
    pub fn from_builder(builder: ClientBuilder) -> Result<Self> {
        let runtime = runtime()?;
        let inner = runtime.block_on(builder.build())?;
        Ok(Self {
            inner,
            runtime: Arc::new(runtime),
        })
    }

    /// The wrapped async client
    #[must_use]
    pub fn as_async(&self) -> &Client {
        &self.inner
    }

    /// Get the client configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        self.inner.config()
    }

    /// Start a request
    #[must_use]
    pub fn request(&self, method: Method, path: &str) -> BlockingRequestBuilder {
        BlockingRequestBuilder {
            inner: self.inner.request(method, path),
            runtime: Arc::clone(&self.runtime),
        }
    }

    /// Start a GET request
    #[must_use]
    pub fn get(&self, path: &str) -> BlockingRequestBuilder {
        self.request(Method::GET, path)
    }

    /// Start a POST request
    #[must_use]
    pub fn post(&self, path: &str) -> BlockingRequestBuilder {
        self.request(Method::POST, path)
    }

    /// Start a PUT request
    #[must_use]
    pub fn put(&self, path: &str) -> BlockingRequestBuilder {
        self.request(Method::PUT, path)
    }

    /// Start a PATCH request
    #[must_use]
    pub fn patch(&self, path: &str) -> BlockingRequestBuilder {
        self.request(Method::PATCH, path)
    }

    /// Start a DELETE request
    #[must_use]
    pub fn delete(&self, path: &str) -> BlockingRequestBuilder {
        self.request(Method::DELETE, path)
    }

    /// Start a HEAD request
    #[must_use]
    pub fn head(&self, path: &str) -> BlockingRequestBuilder {
        self.request(Method::HEAD, path)
    }

    /// Iterate an offset/limit paginated collection item by item
    #[must_use]
    pub fn paginate<T: DeserializeOwned>(&self, path: &str) -> BlockingPaginator<T> {
        self.paginate_with(path, OffsetLimitPagination::default())
    }

    /// Iterate a paginated collection with a custom strategy
    #[must_use]
    pub fn paginate_with<T: DeserializeOwned>(
        &self,
        path: &str,
        strategy: impl PaginationStrategy + 'static,
    ) -> BlockingPaginator<T> {
        BlockingPaginator {
            inner: self.inner.paginate_with(path, strategy),
            runtime: Arc::clone(&self.runtime),
            buffered: VecDeque::new(),
            done: false,
        }
    }

    /// Statistics of the breaker responsible for `target`
    #[must_use]
    pub fn circuit_stats(&self, target: &str) -> Option<CircuitBreakerStats> {
        self.inner.circuit_stats(target)
    }

    /// Reset every breaker
    pub fn reset_circuits(&self) {
        self.inner.reset_circuits();
    }

    /// Cache statistics, `None` when caching is disabled
    #[must_use]
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.runtime.block_on(self.inner.cache_stats())
    }

    /// Remove every cache record
    ///
    /// # Errors
    /// Returns an error if the cache backend fails
    pub fn clear_cache(&self) -> Result<()> {
        self.runtime.block_on(self.inner.clear_cache())
    }
}

/// Blocking counterpart of [`RequestBuilder`].
#[derive(Debug)]
pub struct BlockingRequestBuilder {
    inner: RequestBuilder,
    runtime: Arc<Runtime>,
}

impl BlockingRequestBuilder {
    fn map(mut self, f: impl FnOnce(RequestBuilder) -> RequestBuilder) -> Self {
        self.inner = f(self.inner);
        self
    }

    /// Append a header
    #[must_use]
    pub fn header(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.map(|b| b.header(name, value))
    }

    /// Append a query parameter
    #[must_use]
    pub fn query(self, key: impl Into<String>, value: impl ToString) -> Self {
        self.map(|b| b.query(key, value))
    }

    /// Set a raw body
    #[must_use]
    pub fn body(self, body: impl Into<bytes::Bytes>) -> Self {
        self.map(|b| b.body(body))
    }

    /// Encode `value` as a JSON body
    #[must_use]
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Self {
        self.map(|b| b.json(value))
    }

    /// Per-attempt timeout
    #[must_use]
    pub fn timeout(self, timeout: Duration) -> Self {
        self.map(|b| b.timeout(timeout))
    }

    /// Idempotency key
    #[must_use]
    pub fn idempotency_key(self, key: impl Into<String>) -> Self {
        self.map(|b| b.idempotency_key(key))
    }

    /// Add a cache directive
    #[must_use]
    pub fn cache(self, directive: CacheDirective) -> Self {
        self.map(|b| b.cache(directive))
    }

    /// Retry policy override
    #[must_use]
    pub fn retry(self, retry: RetryOverride) -> Self {
        self.map(|b| b.retry(retry))
    }

    /// Send the request, blocking the current thread
    ///
    /// # Errors
    /// Same as [`RequestBuilder::send`]
    pub fn send(self) -> Result<Response> {
        self.runtime.block_on(self.inner.send())
    }

    /// Send the request and decode a JSON response body
    ///
    /// # Errors
    /// Same as [`RequestBuilder::send_json`]
    pub fn send_json<T: DeserializeOwned>(self) -> Result<T> {
        self.runtime.block_on(self.inner.send_json())
    }
}

/// Item iterator over a paginated collection.
///
/// Yields one `Err` and then ends if a page fails.
#[derive(Debug)]
pub struct BlockingPaginator<T> {
    inner: Paginator<T>,
    runtime: Arc<Runtime>,
    buffered: VecDeque<T>,
    done: bool,
}

impl<T: DeserializeOwned> Iterator for BlockingPaginator<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffered.pop_front() {
                return Some(Ok(item));
            }
            if self.done {
                return None;
            }
            match self.runtime.block_on(self.inner.next_page()) {
                Ok(Some(page)) => self.buffered.extend(page),
                Ok(None) => self.done = true,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
