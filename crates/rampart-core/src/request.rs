//! Request descriptor and per-call overrides.
//!
//! A [`RequestDescriptor`] is built once per logical call and is not shared
//! between calls. Retries derive a fresh copy through
//! [`RequestDescriptor::for_attempt`].

use crate::codec;
use crate::error::{Error, Result};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CACHE_CONTROL, PRAGMA};
use http::{HeaderMap, Method};
use serde::Serialize;
use std::time::Duration;
use url::Url;

/// Header carrying the idempotency key of a non-idempotent request.
pub const IDEMPOTENCY_KEY: &str = "idempotency-key";

/// Request-side cache directive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDirective {
    /// Revalidate even when a fresh entry exists
    NoCache,
    /// Neither read from nor write to the cache
    NoStore,
    /// Answer only from the cache, never from the network
    OnlyIfCached,
}

/// Set of request-side cache directives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheDirectives {
    /// `no-cache`
    pub no_cache: bool,
    /// `no-store`
    pub no_store: bool,
    /// `only-if-cached`
    pub only_if_cached: bool,
}

impl CacheDirectives {
    /// Add a directive
    pub fn insert(&mut self, directive: CacheDirective) {
        match directive {
            CacheDirective::NoCache => self.no_cache = true,
            CacheDirective::NoStore => self.no_store = true,
            CacheDirective::OnlyIfCached => self.only_if_cached = true,
        }
    }

    /// Read directives from request `Cache-Control` and `Pragma` headers
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut directives = Self::default();
        for value in headers.get_all(CACHE_CONTROL) {
            let Ok(value) = value.to_str() else { continue };
            for token in value.split(',') {
                let token = token.trim().to_ascii_lowercase();
                match token.as_str() {
                    "no-cache" | "max-age=0" => directives.no_cache = true,
                    "no-store" => directives.no_store = true,
                    "only-if-cached" => directives.only_if_cached = true,
                    _ => {}
                }
            }
        }
        if headers
            .get(PRAGMA)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("no-cache"))
        {
            directives.no_cache = true;
        }
        directives
    }

    /// Reject combinations no cache can honour
    ///
    /// # Errors
    /// Returns a configuration error for `only-if-cached` combined with
    /// `no-store` or `no-cache`
    pub fn validate(&self) -> Result<()> {
        if self.only_if_cached && self.no_store {
            return Err(Error::configuration(
                "cache directives conflict: only-if-cached with no-store",
            ));
        }
        if self.only_if_cached && self.no_cache {
            return Err(Error::configuration(
                "cache directives conflict: only-if-cached with no-cache",
            ));
        }
        Ok(())
    }

    fn union(self, other: Self) -> Self {
        Self {
            no_cache: self.no_cache || other.no_cache,
            no_store: self.no_store || other.no_store,
            only_if_cached: self.only_if_cached || other.only_if_cached,
        }
    }
}

/// Per-call override of the client's retry policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryOverride {
    /// Replace `max_attempts`
    pub max_attempts: Option<u32>,
    /// Replace `backoff_factor`
    pub backoff_factor: Option<Duration>,
    /// Replace `backoff_max`
    pub backoff_max: Option<Duration>,
}

impl RetryOverride {
    /// Override that performs a single attempt
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_attempts: Some(1),
            ..Self::default()
        }
    }
}

/// Per-call overrides carried by a descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Per-attempt transport timeout
    pub timeout: Option<Duration>,
    /// Retry policy override
    pub retry: Option<RetryOverride>,
    /// Cache directives
    pub cache: CacheDirectives,
    /// Idempotency key for non-idempotent methods
    pub idempotency_key: Option<String>,
    /// Allow retrying a non-idempotent method without a key
    pub retry_non_idempotent: bool,
}

/// One outbound HTTP request and its per-call policy overrides.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
    options: RequestOptions,
}

impl RequestDescriptor {
    /// Start building a descriptor
    #[must_use]
    pub fn builder(method: Method, url: impl Into<String>) -> RequestDescriptorBuilder {
        RequestDescriptorBuilder::new(method, url)
    }

    /// Build a body-less descriptor without overrides
    ///
    /// # Errors
    /// Returns a configuration error if `url` does not parse
    pub fn new(method: Method, url: &str) -> Result<Self> {
        Self::builder(method, url).build()
    }

    /// HTTP method
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Full URL including query
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Request headers
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable request headers
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Request body
    #[must_use]
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Per-call overrides
    #[must_use]
    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    /// Path component
    #[must_use]
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Query component
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.url.query()
    }

    /// Lower-cased host name
    #[must_use]
    pub fn host(&self) -> String {
        self.url.host_str().unwrap_or_default().to_ascii_lowercase()
    }

    /// `scheme://host:port`, the unit of circuit breaking
    #[must_use]
    pub fn target(&self) -> String {
        let port = self.url.port_or_known_default().unwrap_or_default();
        format!("{}://{}:{}", self.url.scheme(), self.host(), port)
    }

    /// `METHOD scheme://host:port/path`, the unit of per-endpoint limiting
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{} {}{}", self.method, self.target(), self.url.path())
    }

    /// GET or HEAD
    #[must_use]
    pub fn is_safe(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }

    /// Methods whose repetition has no additional effect
    #[must_use]
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self.method,
            Method::GET
                | Method::HEAD
                | Method::PUT
                | Method::DELETE
                | Method::OPTIONS
                | Method::TRACE
        )
    }

    /// Idempotency key from the overrides or an explicit header
    #[must_use]
    pub fn idempotency_key(&self) -> Option<&str> {
        self.options.idempotency_key.as_deref().or_else(|| {
            self.headers
                .get(IDEMPOTENCY_KEY)
                .and_then(|v| v.to_str().ok())
        })
    }

    /// Whether a failed attempt of this request may be repeated
    #[must_use]
    pub fn is_retry_eligible(&self) -> bool {
        self.is_idempotent()
            || self.idempotency_key().is_some()
            || self.options.retry_non_idempotent
    }

    /// Cache directives from overrides and request headers combined
    #[must_use]
    pub fn cache_directives(&self) -> CacheDirectives {
        self.options
            .cache
            .union(CacheDirectives::from_headers(&self.headers))
    }

    /// Generate an idempotency key if none is present
    pub fn ensure_idempotency_key(&mut self) {
        if self.idempotency_key().is_none() {
            self.options.idempotency_key = Some(uuid::Uuid::new_v4().to_string());
        }
    }

    /// Copy for one attempt, carrying the idempotency key as a header
    #[must_use]
    pub fn for_attempt(&self) -> Self {
        let mut attempt = self.clone();
        if !attempt.headers.contains_key(IDEMPOTENCY_KEY) {
            if let Some(value) = self
                .options
                .idempotency_key
                .as_deref()
                .and_then(|key| HeaderValue::from_str(key).ok())
            {
                attempt
                    .headers
                    .insert(HeaderName::from_static(IDEMPOTENCY_KEY), value);
            }
        }
        attempt
    }

    /// Return a copy with one header replaced
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Builder for [`RequestDescriptor`]
#[derive(Debug)]
pub struct RequestDescriptorBuilder {
    method: Method,
    url: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
    options: RequestOptions,
    error: Option<Error>,
}

impl RequestDescriptorBuilder {
    /// Create a builder for `method` on `url`
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            options: RequestOptions::default(),
            error: None,
        }
    }

    /// Append a header
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Append a query parameter
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Set a raw body
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Encode `value` as a JSON body
    #[must_use]
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match codec::encode_json(value) {
            Ok(body) => {
                self.body = Some(body);
                self.headers
                    .push(("content-type".to_string(), codec::JSON_CONTENT_TYPE.to_string()));
            }
            Err(err) => self.error = Some(err),
        }
        self
    }

    /// Per-attempt timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Retry policy override
    #[must_use]
    pub fn retry(mut self, retry: RetryOverride) -> Self {
        self.options.retry = Some(retry);
        self
    }

    /// Add a cache directive
    #[must_use]
    pub fn cache(mut self, directive: CacheDirective) -> Self {
        self.options.cache.insert(directive);
        self
    }

    /// Idempotency key
    #[must_use]
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.options.idempotency_key = Some(key.into());
        self
    }

    /// Opt in to retrying a non-idempotent method
    #[must_use]
    pub fn retry_non_idempotent(mut self, allow: bool) -> Self {
        self.options.retry_non_idempotent = allow;
        self
    }

    /// Build the descriptor
    ///
    /// # Errors
    /// Returns a configuration error for an unparsable URL, an invalid header
    /// or conflicting cache directives, and a validation error for a body
    /// that failed to encode
    pub fn build(self) -> Result<RequestDescriptor> {
        if let Some(err) = self.error {
            return Err(err);
        }

        let mut url = Url::parse(&self.url)
            .map_err(|e| Error::configuration(format!("invalid URL '{}': {e}", self.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::configuration(format!(
                "unsupported URL scheme '{}'",
                url.scheme()
            )));
        }
        if !self.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.query {
                pairs.append_pair(key, value);
            }
        }
        url.set_fragment(None);

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let header_name = HeaderName::try_from(name.as_str())
                .map_err(|e| Error::configuration(format!("invalid header name '{name}': {e}")))?;
            let header_value = HeaderValue::from_str(value).map_err(|e| {
                Error::configuration(format!("invalid value for header '{name}': {e}"))
            })?;
            headers.append(header_name, header_value);
        }

        let descriptor = RequestDescriptor {
            method: self.method,
            url,
            headers,
            body: self.body,
            options: self.options,
        };
        descriptor.cache_directives().validate()?;
        Ok(descriptor)
    }
}
