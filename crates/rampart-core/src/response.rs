//! Response type and header helpers.

use crate::codec;
use crate::error::Result;
use bytes::Bytes;
use chrono::DateTime;
use http::header::RETRY_AFTER;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use std::time::{Duration, SystemTime};
use validator::Validate;

/// Where a response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Returned by the transport
    Network,
    /// Served from a fresh cache entry
    Cache,
    /// Served from a cache entry after a 304 revalidation
    Revalidated,
    /// Produced by a configured fallback
    Fallback,
}

/// A complete HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    source: ResponseSource,
}

impl Response {
    /// Create a network response
    #[must_use]
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
            source: ResponseSource::Network,
        }
    }

    /// Response with a status and no headers or body
    #[must_use]
    pub fn with_status(status: StatusCode) -> Self {
        Self::new(status, HeaderMap::new(), Bytes::new())
    }

    /// Mark where the response came from
    #[must_use]
    pub fn with_source(mut self, source: ResponseSource) -> Self {
        self.source = source;
        self
    }

    /// Status code
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Headers
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable headers
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Body bytes
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Consume into the body
    #[must_use]
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Origin of the response
    #[must_use]
    pub fn source(&self) -> ResponseSource {
        self.source
    }

    /// 2xx
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Header value as a string, if present and valid
    #[must_use]
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Body as UTF-8 text
    ///
    /// # Errors
    /// Returns a validation error if the body is not UTF-8
    pub fn text(&self) -> Result<String> {
        codec::decode_text(&self.body)
    }

    /// Decode a JSON body
    ///
    /// # Errors
    /// Returns a validation error if the body does not decode into `T`
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        codec::decode_json(&self.body)
    }

    /// Decode a JSON body and run its field validation
    ///
    /// # Errors
    /// Returns a validation error if decoding or validation fails
    pub fn json_validated<T: DeserializeOwned + Validate>(&self) -> Result<T> {
        codec::decode_validated(&self.body)
    }

    /// Parsed `Retry-After` relative to `now`
    #[must_use]
    pub fn retry_after(&self, now: SystemTime) -> Option<Duration> {
        self.headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, now))
    }

    /// Server rate limit advisory from `X-RateLimit-*` headers
    #[must_use]
    pub fn server_rate_limit(&self, now: SystemTime) -> Option<ServerRateLimit> {
        ServerRateLimit::from_headers(&self.headers, now)
    }
}

/// Parse a `Retry-After` value: delta seconds or an HTTP date.
#[must_use]
pub fn parse_retry_after(value: &str, now: SystemTime) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = parse_http_date(value)?;
    Some(at.duration_since(now).unwrap_or(Duration::ZERO))
}

/// Parse an RFC 7231 IMF-fixdate such as `Sun, 06 Nov 1994 08:49:37 GMT`.
#[must_use]
pub fn parse_http_date(value: &str) -> Option<SystemTime> {
    let parsed = DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let secs = u64::try_from(parsed.timestamp()).ok()?;
    Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
}

/// Format `at` as an IMF-fixdate.
#[must_use]
pub fn format_http_date(at: SystemTime) -> String {
    let secs = at
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    DateTime::from_timestamp(i64::try_from(secs).unwrap_or_default(), 0)
        .map(|dt| dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
        .unwrap_or_default()
}

/// Advisory limits reported by the server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerRateLimit {
    /// `X-RateLimit-Limit`
    pub limit: Option<u64>,
    /// `X-RateLimit-Remaining`
    pub remaining: Option<u64>,
    /// Time until the server window resets
    pub reset_in: Option<Duration>,
}

impl ServerRateLimit {
    /// Values above this are treated as epoch seconds rather than deltas.
    const EPOCH_THRESHOLD: u64 = 1_000_000_000;

    /// Parse `X-RateLimit-*` headers, `None` when none are present
    #[must_use]
    pub fn from_headers(headers: &HeaderMap, now: SystemTime) -> Option<Self> {
        let number = |name: &str| -> Option<u64> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
        };
        let limit = number("x-ratelimit-limit");
        let remaining = number("x-ratelimit-remaining");
        let reset_in = number("x-ratelimit-reset").map(|reset| {
            if reset > Self::EPOCH_THRESHOLD {
                let at = SystemTime::UNIX_EPOCH + Duration::from_secs(reset);
                at.duration_since(now).unwrap_or(Duration::ZERO)
            } else {
                Duration::from_secs(reset)
            }
        });

        if limit.is_none() && remaining.is_none() && reset_in.is_none() {
            None
        } else {
            Some(Self {
                limit,
                remaining,
                reset_in,
            })
        }
    }
}
