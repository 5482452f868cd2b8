//! Response-side cache directives and freshness rules.

use rampart_core::response::parse_http_date;
use rampart_core::{HeaderMap, Method, Response};
use std::time::{Duration, SystemTime};

/// Parsed response `Cache-Control`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseDirectives {
    /// `no-store`
    pub no_store: bool,
    /// `no-cache`: storable, but every use must be revalidated
    pub no_cache: bool,
    /// `private`
    pub private: bool,
    /// `public`
    pub public: bool,
    /// `must-revalidate`
    pub must_revalidate: bool,
    /// `max-age`
    pub max_age: Option<Duration>,
    /// `s-maxage`
    pub s_maxage: Option<Duration>,
}

impl ResponseDirectives {
    /// Parse every `Cache-Control` header of a response
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut directives = Self::default();
        for value in headers.get_all(http::header::CACHE_CONTROL) {
            let Ok(value) = value.to_str() else { continue };
            for token in value.split(',') {
                let token = token.trim();
                let (name, arg) = match token.split_once('=') {
                    Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"'))),
                    None => (token, None),
                };
                let seconds = || arg.and_then(|a| a.parse::<u64>().ok()).map(Duration::from_secs);
                match name.to_ascii_lowercase().as_str() {
                    "no-store" => directives.no_store = true,
                    "no-cache" => directives.no_cache = true,
                    "private" => directives.private = true,
                    "public" => directives.public = true,
                    "must-revalidate" | "proxy-revalidate" => directives.must_revalidate = true,
                    "max-age" => directives.max_age = seconds(),
                    "s-maxage" => directives.s_maxage = seconds(),
                    _ => {}
                }
            }
        }
        directives
    }

    /// Whether any explicit freshness directive is present
    #[must_use]
    pub fn has_freshness(&self) -> bool {
        self.max_age.is_some() || self.s_maxage.is_some() || self.no_cache
    }
}

/// Header names listed by `Vary`, lower-cased. `None` for `Vary: *`.
#[must_use]
pub fn vary_headers(headers: &HeaderMap) -> Option<Vec<String>> {
    let mut names = Vec::new();
    for value in headers.get_all(http::header::VARY) {
        let Ok(value) = value.to_str() else { continue };
        for name in value.split(',') {
            let name = name.trim().to_ascii_lowercase();
            if name == "*" {
                return None;
            }
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
    }
    Some(names)
}

/// Whether a response to `method` may be stored at all
#[must_use]
pub fn is_storable(method: &Method, response: &Response, cacheable_statuses: &[u16]) -> bool {
    if *method != Method::GET && *method != Method::HEAD {
        return false;
    }
    if !cacheable_statuses.contains(&response.status().as_u16()) {
        return false;
    }
    let directives = ResponseDirectives::from_headers(response.headers());
    !directives.no_store && vary_headers(response.headers()).is_some()
}

/// How long a response stays fresh after it is stored.
///
/// `max-age` wins over `s-maxage`, which wins over `Expires`. `default_ttl`
/// is used only when none of those is present. `no-cache` yields zero so
/// every use revalidates. A response `Age` is subtracted.
#[must_use]
pub fn freshness_lifetime(headers: &HeaderMap, now: SystemTime, default_ttl: Duration) -> Duration {
    let directives = ResponseDirectives::from_headers(headers);
    if directives.no_cache {
        return Duration::ZERO;
    }

    let lifetime = directives
        .max_age
        .or(directives.s_maxage)
        .or_else(|| expires_lifetime(headers, now))
        .unwrap_or(default_ttl);

    let age = headers
        .get(http::header::AGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(Duration::ZERO, Duration::from_secs);

    lifetime.saturating_sub(age)
}

fn expires_lifetime(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let header = |name: http::header::HeaderName| headers.get(name).and_then(|v| v.to_str().ok());
    let expires = header(http::header::EXPIRES)?;
    // An unparseable Expires means already expired.
    let Some(expires) = parse_http_date(expires) else {
        return Some(Duration::ZERO);
    };
    let base = header(http::header::DATE)
        .and_then(parse_http_date)
        .unwrap_or(now);
    Some(expires.duration_since(base).unwrap_or(Duration::ZERO))
}
