//! Stored responses and the keys they are found under.
//!
//! One [`CacheRecord`] is kept per primary key (method plus normalised URL).
//! It holds up to [`MAX_VARIANTS`] entries that differ in the request header
//! values named by the response `Vary` header. Selecting headers are stored as
//! SHA-256 digests so credentials used for key scoping never reach a backend
//! in clear text.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use rampart_core::{
    HeaderMap, HeaderName, HeaderValue, RequestDescriptor, Response, ResponseSource, StatusCode,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime};
use url::Url;

/// Variants kept per primary key; the oldest is dropped beyond this.
pub const MAX_VARIANTS: usize = 8;

/// Primary cache key of a request: `METHOD normalised-url`.
///
/// The URL is normalised by the parser (lower-case scheme and host, default
/// port dropped), the fragment is removed and query pairs are sorted.
#[must_use]
pub fn primary_key(request: &RequestDescriptor) -> String {
    format!("{} {}", request.method(), normalize_url(request.url()))
}

/// Normalised form of `url` used in keys and invalidation patterns
#[must_use]
pub fn normalize_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    url.to_string()
}

fn digest(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Joined values of a request header, `None` if absent
fn request_header(request: &RequestDescriptor, name: &str) -> Option<String> {
    let values: Vec<&str> = request
        .headers()
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(", "))
    }
}

/// Request header values an entry was selected by
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarySelector {
    /// `(header name, digest of joined values)`; `None` when absent
    pub headers: Vec<(String, Option<String>)>,
}

impl VarySelector {
    /// Capture `names` from `request`
    #[must_use]
    pub fn capture(names: &[String], request: &RequestDescriptor) -> Self {
        Self {
            headers: names
                .iter()
                .map(|name| {
                    (
                        name.clone(),
                        request_header(request, name).map(|v| digest(&v)),
                    )
                })
                .collect(),
        }
    }

    /// Whether `request` carries the same selecting header values
    #[must_use]
    pub fn matches(&self, request: &RequestDescriptor) -> bool {
        self.headers.iter().all(|(name, expected)| {
            request_header(request, name).map(|v| digest(&v)).as_ref() == expected.as_ref()
        })
    }

    /// Names of the selecting headers
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.headers.iter().map(|(name, _)| name.as_str())
    }
}

/// A stored response and its freshness metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Response status
    pub status: u16,
    /// Response headers in order
    pub headers: Vec<(String, String)>,
    /// Response body
    #[serde(serialize_with = "encode_body", deserialize_with = "decode_body")]
    pub body: Bytes,
    /// Wall time the entry was stored or last revalidated
    pub stored_at: SystemTime,
    /// Time the entry stays fresh after `stored_at`
    pub freshness_lifetime: Duration,
    /// `ETag` validator
    pub etag: Option<String>,
    /// `Last-Modified` validator
    pub last_modified: Option<String>,
    /// Request headers this variant was selected by
    pub vary: VarySelector,
}

fn encode_body<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(body))
}

fn decode_body<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded)
        .map(Bytes::from)
        .map_err(serde::de::Error::custom)
}

impl CacheEntry {
    /// Capture `response` as an entry
    #[must_use]
    pub fn from_response(
        response: &Response,
        vary: VarySelector,
        stored_at: SystemTime,
        freshness_lifetime: Duration,
    ) -> Self {
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        Self {
            status: response.status().as_u16(),
            headers,
            body: response.body().clone(),
            stored_at,
            freshness_lifetime,
            etag: response.header_str("etag").map(str::to_string),
            last_modified: response.header_str("last-modified").map(str::to_string),
            vary,
        }
    }

    /// Fresh iff `now < stored_at + freshness_lifetime`
    #[must_use]
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        now < self.stored_at + self.freshness_lifetime
    }

    /// Time since the entry was stored
    #[must_use]
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.stored_at).unwrap_or(Duration::ZERO)
    }

    /// Time left until the entry turns stale
    #[must_use]
    pub fn ttl(&self, now: SystemTime) -> Duration {
        (self.stored_at + self.freshness_lifetime)
            .duration_since(now)
            .unwrap_or(Duration::ZERO)
    }

    /// Whether a conditional request can revalidate this entry
    #[must_use]
    pub fn has_validators(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }

    /// Stored headers as a map
    #[must_use]
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                map.append(name, value);
            }
        }
        map
    }

    /// Rebuild the response
    #[must_use]
    pub fn to_response(&self, source: ResponseSource) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        Response::new(status, self.header_map(), self.body.clone()).with_source(source)
    }

    /// Merge the headers of a `304 Not Modified` and restart freshness
    pub fn refresh(
        &mut self,
        not_modified: &Response,
        now: SystemTime,
        freshness_lifetime: Duration,
    ) {
        let mut merged = self.header_map();
        for name in not_modified.headers().keys() {
            if name == http::header::CONTENT_LENGTH {
                continue;
            }
            merged.remove(name);
            for value in not_modified.headers().get_all(name) {
                merged.append(name.clone(), value.clone());
            }
        }
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        let refreshed = Response::new(status, merged, self.body.clone());
        let vary = std::mem::take(&mut self.vary);
        *self = Self::from_response(&refreshed, vary, now, freshness_lifetime);
    }

    /// Approximate in-memory size
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.body.len()
            + self
                .headers
                .iter()
                .map(|(n, v)| n.len() + v.len())
                .sum::<usize>()
    }
}

/// All variants stored under one primary key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Primary key
    pub key: String,
    /// Variants, oldest first
    pub variants: Vec<CacheEntry>,
}

impl CacheRecord {
    /// Empty record for `key`
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            variants: Vec::new(),
        }
    }

    /// Variant selected by `request`
    #[must_use]
    pub fn select(&self, request: &RequestDescriptor) -> Option<&CacheEntry> {
        self.variants.iter().rev().find(|e| e.vary.matches(request))
    }

    /// Mutable variant selected by `request`
    pub fn select_mut(&mut self, request: &RequestDescriptor) -> Option<&mut CacheEntry> {
        self.variants.iter_mut().rev().find(|e| e.vary.matches(request))
    }

    /// Insert `entry`, replacing the variant it supersedes.
    ///
    /// A change in the set of `Vary` header names discards every older variant.
    pub fn insert(&mut self, entry: CacheEntry) {
        let names: Vec<&str> = entry.vary.names().collect();
        self.variants.retain(|existing| {
            existing.vary.names().eq(names.iter().copied()) && existing.vary != entry.vary
        });
        self.variants.push(entry);
        if self.variants.len() > MAX_VARIANTS {
            let excess = self.variants.len() - MAX_VARIANTS;
            self.variants.drain(..excess);
        }
    }

    /// Approximate in-memory size
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.key.len() + self.variants.iter().map(CacheEntry::size_bytes).sum::<usize>()
    }
}
