//! Async client.

use crate::dispatch::{Fallback, Pipeline};
use crate::pagination::{OffsetLimitPagination, PaginationStrategy, Paginator};
use crate::transport::ReqwestTransport;
use rampart_config::{ClientConfig, TimeoutConfig};
use rampart_core::request::RequestDescriptorBuilder;
use rampart_core::{
    AuthProvider, CacheDirective, Error, ErrorContext, HeaderMap, HeaderName, HeaderValue, Method,
    Middleware, MiddlewareChain, Outcome, RequestDescriptor, Response, Result, RetryOverride,
    ServerRateLimit, SharedClock, SystemClock, Transport, Url,
};
use rampart_resilience::{
    CacheBackend, CacheConfig, CacheStats, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitBreakerStats, LimiterStatus, RateLimitConfig, RateLimiter, ResponseCache, RetryConfig,
    RetryPolicy,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Resilient HTTP client.
///
/// Cloning is cheap; clones share the breaker, limiter and cache state.
///
/// # Example
///
/// ```rust,no_run
/// use rampart_client::Client;
///
/// #[tokio::main]
/// async fn main() -> Result<(), rampart_core::Error> {
///     let client = Client::builder()
///         .base_url("https://api.example.com/v1/")
///         .build()
///         .await?;
///
///     let response = client.get("items").query("page", 2).send().await?;
///     println!("{}", response.text()?);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    pipeline: Arc<Pipeline>,
    config: Arc<ClientConfig>,
    base_url: Option<Url>,
    default_headers: Arc<HeaderMap>,
}

impl Client {
    /// Create a new client builder.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Create a client from a complete configuration.
    ///
    /// # Errors
    /// Returns a configuration error if `config` is invalid
    pub async fn new(config: ClientConfig) -> Result<Self> {
        ClientBuilder::new().config(config).build().await
    }

    /// Get the client configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Resolve `path` against the base URL. Absolute URLs are used as-is.
    ///
    /// # Errors
    /// Returns a configuration error for a relative path without a base URL
    pub fn url(&self, path: &str) -> Result<Url> {
        if let Ok(url) = Url::parse(path) {
            return Ok(url);
        }
        let base = self.base_url.as_ref().ok_or_else(|| {
            Error::configuration(format!("relative URL '{path}' requires a base_url"))
        })?;
        base.join(path.trim_start_matches('/'))
            .map_err(|e| Error::configuration(format!("Invalid URL path '{path}': {e}")))
    }

    /// Start a request
    #[must_use]
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        RequestBuilder::new(self.clone(), method, path)
    }

    /// Start a GET request
    #[must_use]
    pub fn get(&self, path: &str) -> RequestBuilder {
        self.request(Method::GET, path)
    }

    /// Start a POST request
    #[must_use]
    pub fn post(&self, path: &str) -> RequestBuilder {
        self.request(Method::POST, path)
    }

    /// Start a PUT request
    #[must_use]
    pub fn put(&self, path: &str) -> RequestBuilder {
        self.request(Method::PUT, path)
    }

    /// Start a PATCH request
    #[must_use]
    pub fn patch(&self, path: &str) -> RequestBuilder {
        self.request(Method::PATCH, path)
    }

    /// Start a DELETE request
    #[must_use]
    pub fn delete(&self, path: &str) -> RequestBuilder {
        self.request(Method::DELETE, path)
    }

    /// Start a HEAD request
    #[must_use]
    pub fn head(&self, path: &str) -> RequestBuilder {
        self.request(Method::HEAD, path)
    }

    /// Start an OPTIONS request
    #[must_use]
    pub fn options(&self, path: &str) -> RequestBuilder {
        self.request(Method::OPTIONS, path)
    }

    /// Iterate an offset/limit paginated collection at `path`
    #[must_use]
    pub fn paginate<T: DeserializeOwned>(&self, path: &str) -> Paginator<T> {
        self.paginate_with(path, OffsetLimitPagination::default())
    }

    /// Iterate a paginated collection with a custom strategy
    #[must_use]
    pub fn paginate_with<T: DeserializeOwned>(
        &self,
        path: &str,
        strategy: impl PaginationStrategy + 'static,
    ) -> Paginator<T> {
        Paginator::new(self.clone(), path, Box::new(strategy))
    }

    /// Send a descriptor and convert the final outcome into a result.
    ///
    /// # Errors
    /// Returns the error matching the final failure kind, with attempt count,
    /// elapsed time and final response attached
    pub async fn execute(&self, request: RequestDescriptor) -> Result<Response> {
        let context = ErrorContext::for_request(request.method().clone(), request.url().clone());
        let started = self.pipeline.clock.now();
        let outcome = self.dispatch(request).await;
        let elapsed = self.pipeline.clock.now().saturating_duration_since(started);
        Error::from_outcome(outcome, context.with_elapsed(elapsed))
    }

    /// Send a descriptor and return the classified outcome unconverted.
    pub async fn dispatch(&self, mut request: RequestDescriptor) -> Outcome {
        for (name, value) in self.default_headers.iter() {
            if !request.headers().contains_key(name) {
                request.headers_mut().insert(name.clone(), value.clone());
            }
        }
        self.pipeline.dispatch(request).await
    }

    /// Statistics of the breaker responsible for `target`
    /// (`scheme://host:port`, or `"global"` without per-host breakers)
    #[must_use]
    pub fn circuit_stats(&self, target: &str) -> Option<CircuitBreakerStats> {
        self.pipeline.breakers.find(target).map(|b| b.stats())
    }

    /// Statistics of every breaker created so far, keyed by target
    #[must_use]
    pub fn circuit_breakers(&self) -> Vec<(String, CircuitBreakerStats)> {
        let mut all: Vec<_> = self
            .pipeline
            .breakers
            .all()
            .into_iter()
            .map(|b| (b.target().to_string(), b.stats()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Hold the breaker for `target` open until [`force_close`](Self::force_close)
    pub fn force_open(&self, target: &str) {
        info!(circuit = %target, "Circuit forced open");
        self.pipeline.breakers.get(target).force_open();
    }

    /// Close the breaker for `target`
    pub fn force_close(&self, target: &str) {
        info!(circuit = %target, "Circuit forced closed");
        self.pipeline.breakers.get(target).force_close();
    }

    /// Reset every breaker to closed with empty counters
    pub fn reset_circuits(&self) {
        self.pipeline.breakers.reset_all();
    }

    /// Capacity of every limiter scope seen so far
    #[must_use]
    pub fn rate_limit_status(&self) -> Vec<LimiterStatus> {
        self.pipeline.limiter.statuses()
    }

    /// Latest `X-RateLimit-*` advisory received from `host`
    #[must_use]
    pub fn server_rate_limit(&self, host: &str) -> Option<ServerRateLimit> {
        self.pipeline.limiter.server_limit(host)
    }

    /// Cache statistics, `None` when caching is disabled
    pub async fn cache_stats(&self) -> Option<CacheStats> {
        match &self.pipeline.cache {
            Some(cache) => Some(cache.stats().await),
            None => None,
        }
    }

    /// Remove the cache record stored under `key` (`"GET https://host/path"`)
    pub async fn invalidate_cache(&self, key: &str) -> bool {
        match &self.pipeline.cache {
            Some(cache) => cache.invalidate(key).await,
            None => false,
        }
    }

    /// Remove every cache record whose key matches the glob `pattern`
    ///
    /// # Errors
    /// Returns a cache error for an invalid pattern or a failing backend
    pub async fn invalidate_cache_pattern(&self, pattern: &str) -> Result<u64> {
        match &self.pipeline.cache {
            Some(cache) => cache
                .invalidate_pattern(pattern)
                .await
                .map_err(|e| Error::cache(format!("invalidation failed: {e}"))),
            None => Ok(0),
        }
    }

    /// Remove every cache record
    ///
    /// # Errors
    /// Returns an error if the cache backend fails
    pub async fn clear_cache(&self) -> Result<()> {
        match &self.pipeline.cache {
            Some(cache) => cache
                .clear()
                .await
                .map_err(|e| Error::cache(format!("clear failed: {e}"))),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.base_url.as_ref().map(Url::as_str))
            .field("transport", &self.pipeline.transport.name())
            .field("per_call", &self.pipeline.per_call)
            .field("per_attempt", &self.pipeline.per_attempt)
            .field("cache", &self.pipeline.cache.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for creating a [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    clock: Option<SharedClock>,
    cache_backend: Option<Arc<dyn CacheBackend>>,
    auth: Option<Arc<dyn AuthProvider>>,
    fallback: Option<Arc<dyn Fallback>>,
    per_call: Vec<Arc<dyn Middleware>>,
    per_attempt: Vec<Arc<dyn Middleware>>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("per_call", &self.per_call.len())
            .field("per_attempt", &self.per_attempt.len())
            .finish_non_exhaustive()
    }
}

impl ClientBuilder {
    /// Create a new client builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            transport: None,
            clock: None,
            cache_backend: None,
            auth: None,
            fallback: None,
            per_call: Vec::new(),
            per_attempt: Vec::new(),
        }
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the base URL.
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = Some(url.into());
        self
    }

    /// Add a header sent with every request.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.headers.insert(name.into(), value.into());
        self
    }

    /// Set the user agent.
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Set the transport timeouts.
    #[must_use]
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.config.timeout = timeouts;
        self
    }

    /// Bound every logical call, retries and waits included.
    #[must_use]
    pub fn total_timeout(mut self, total: Duration) -> Self {
        self.config.timeout.total = Some(total);
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Set the circuit breaker policy.
    #[must_use]
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = config;
        self
    }

    /// Set the rate limiter policy.
    #[must_use]
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.config.rate_limit = config;
        self
    }

    /// Set the cache policy.
    #[must_use]
    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.config.cache = config;
        self
    }

    /// Store cached responses in `backend` instead of the configured one.
    #[must_use]
    pub fn cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache_backend = Some(backend);
        self
    }

    /// Generate an idempotency key for non-idempotent calls that lack one.
    #[must_use]
    pub fn generate_idempotency_keys(mut self, enable: bool) -> Self {
        self.config.generate_idempotency_keys = enable;
        self
    }

    /// Send requests with `transport` instead of reqwest.
    #[must_use]
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Send requests with a shared transport.
    #[must_use]
    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Read time from `clock`.
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Decorate requests with credentials.
    #[must_use]
    pub fn auth(mut self, auth: impl AuthProvider + 'static) -> Self {
        self.auth = Some(Arc::new(auth));
        self
    }

    /// Answer circuit rejections with `fallback`.
    #[must_use]
    pub fn fallback(mut self, fallback: impl Fallback + 'static) -> Self {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    /// Add middleware that runs once per logical call, outside retries.
    #[must_use]
    pub fn per_call(mut self, middleware: impl Middleware + 'static) -> Self {
        self.per_call.push(Arc::new(middleware));
        self
    }

    /// Add middleware that runs around every transport attempt.
    #[must_use]
    pub fn per_attempt(mut self, middleware: impl Middleware + 'static) -> Self {
        self.per_attempt.push(Arc::new(middleware));
        self
    }

    /// Validate the configuration and build the client.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] for an invalid configuration or a
    /// cache backend that cannot be opened
    pub async fn build(self) -> Result<Client> {
        let config = self.config;
        config
            .validate_all()
            .map_err(|e| Error::configuration(e.to_string()))?;

        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(&config.timeout)?),
        };

        let base_url = match &config.base_url {
            Some(raw) => {
                let mut url = Url::parse(raw)
                    .map_err(|e| Error::configuration(format!("Invalid base_url '{raw}': {e}")))?;
                if !url.path().ends_with('/') {
                    let path = format!("{}/", url.path());
                    url.set_path(&path);
                }
                Some(url)
            }
            None => None,
        };

        let mut default_headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let header_name = HeaderName::try_from(name.as_str()).map_err(|e| {
                Error::configuration(format!("Invalid header name '{name}': {e}"))
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|e| {
                Error::configuration(format!("Invalid header value for '{name}': {e}"))
            })?;
            default_headers.insert(header_name, header_value);
        }
        if !default_headers.contains_key(http::header::USER_AGENT) {
            let user_agent = HeaderValue::from_str(&config.user_agent)
                .map_err(|e| Error::configuration(format!("Invalid user agent: {e}")))?;
            default_headers.insert(http::header::USER_AGENT, user_agent);
        }

        let cache = if config.cache.enabled {
            let cache = match self.cache_backend {
                Some(backend) => {
                    ResponseCache::new(config.cache.clone(), backend, Arc::clone(&clock))
                }
                None => ResponseCache::from_config(config.cache.clone(), Arc::clone(&clock))
                    .await
                    .map_err(|e| Error::configuration(format!("Failed to open cache: {e}")))?,
            };
            Some(cache)
        } else {
            None
        };

        let pipeline = Pipeline {
            per_call: MiddlewareChain::new(self.per_call),
            per_attempt: MiddlewareChain::new(self.per_attempt),
            transport,
            breakers: CircuitBreakerRegistry::new(
                config.circuit_breaker.clone(),
                Arc::clone(&clock),
            ),
            limiter: RateLimiter::new(config.rate_limit.clone(), Arc::clone(&clock)),
            cache,
            retry: RetryPolicy::new(config.retry.clone()),
            auth: self.auth,
            fallback: self.fallback,
            clock,
            timeouts: config.timeout.clone(),
            generate_idempotency_keys: config.generate_idempotency_keys,
        };

        debug!(
            base_url = ?config.base_url,
            transport = pipeline.transport.name(),
            per_call = pipeline.per_call.len(),
            per_attempt = pipeline.per_attempt.len(),
            cache = pipeline.cache.is_some(),
            rate_limit = config.rate_limit.enabled,
            circuit_breaker = config.circuit_breaker.enabled,
            "Client built"
        );

        Ok(Client {
            pipeline: Arc::new(pipeline),
            config: Arc::new(config),
            base_url,
            default_headers: Arc::new(default_headers),
        })
    }
}

/// Fluent builder for one call.
#[derive(Debug)]
pub struct RequestBuilder {
    client: Client,
    inner: std::result::Result<RequestDescriptorBuilder, Error>,
}

impl RequestBuilder {
    fn new(client: Client, method: Method, path: &str) -> Self {
        let inner = client
            .url(path)
            .map(|url| RequestDescriptor::builder(method, url.as_str()));
        Self { client, inner }
    }

    fn map(mut self, f: impl FnOnce(RequestDescriptorBuilder) -> RequestDescriptorBuilder) -> Self {
        self.inner = self.inner.map(f);
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

    /// Idempotency key, making a non-idempotent call retryable
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

    /// Opt in to retrying a non-idempotent call without a key
    #[must_use]
    pub fn retry_non_idempotent(self, allow: bool) -> Self {
        self.map(|b| b.retry_non_idempotent(allow))
    }

    /// Build the descriptor without sending it
    ///
    /// # Errors
    /// Returns the first error recorded while building
    pub fn build(self) -> Result<RequestDescriptor> {
        self.inner?.build()
    }

    /// Send the request
    ///
    /// # Errors
    /// Returns a configuration error for a malformed request, otherwise the
    /// error of the final outcome
    pub async fn send(self) -> Result<Response> {
        let client = self.client.clone();
        let request = self.build()?;
        client.execute(request).await
    }

    /// Send the request and decode a JSON response body
    ///
    /// # Errors
    /// As [`send`](Self::send), plus a validation error for a body that does
    /// not decode into `T`
    pub async fn send_json<T: DeserializeOwned>(self) -> Result<T> {
        self.send().await?.json()
    }
}
