//! HTTP-semantics response cache.
//!
//! [`ResponseCache::lookup`] classifies the stored variant for a request as
//! fresh, stale or missing. Serving, revalidating and bypassing according to
//! request directives is left to the dispatcher; this module owns storage,
//! freshness and invalidation.

pub mod backend;
pub mod disk;
pub mod entry;
pub mod policy;

pub use backend::{CacheBackend, CacheError, CacheResult, KeyPattern, MemoryCacheBackend};
pub use disk::DiskCacheBackend;
pub use entry::{primary_key, CacheEntry, CacheRecord, VarySelector};
pub use policy::ResponseDirectives;

use rampart_core::{
    Clock, HeaderValue, Method, RequestDescriptor, Response, ResponseSource, SharedClock,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use validator::Validate;

/// Storage backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackendKind {
    /// In-process, bounded by record count
    #[default]
    Memory,
    /// Files under `disk_path`, bounded by bytes
    Disk,
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether responses are cached at all
    pub enabled: bool,
    /// Storage backend
    pub backend: CacheBackendKind,
    /// Records kept by the memory backend
    #[validate(range(min = 1))]
    pub max_entries: usize,
    /// Directory of the disk backend
    pub disk_path: Option<PathBuf>,
    /// Bytes kept by the disk backend
    #[validate(range(min = 1))]
    pub max_disk_bytes: u64,
    /// Largest body that is stored
    pub max_body_bytes: usize,
    /// Freshness lifetime when the response states none
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    /// Statuses whose responses may be stored
    pub cacheable_status_codes: Vec<u16>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: CacheBackendKind::Memory,
            max_entries: 1000,
            disk_path: None,
            max_disk_bytes: 100 * 1024 * 1024,
            max_body_bytes: 10 * 1024 * 1024,
            default_ttl: Duration::from_secs(300),
            cacheable_status_codes: vec![200, 203, 204, 206, 300, 301, 308],
        }
    }
}

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// Usable without contacting the target
    Fresh(CacheEntry),
    /// Must be revalidated before use
    Stale(CacheEntry),
    /// Nothing stored for this request
    Miss,
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Fresh hits
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Lookups that found a stale entry
    pub stale_hits: u64,
    /// Stale entries refreshed by a 304
    pub revalidations: u64,
    /// Responses stored
    pub stores: u64,
    /// Records removed by invalidation
    pub invalidations: u64,
    /// Records currently stored
    pub entries: usize,
}

impl CacheStats {
    /// Fraction of lookups answered without a full response from the target
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.stale_hits;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_hits: AtomicU64,
    revalidations: AtomicU64,
    stores: AtomicU64,
    invalidations: AtomicU64,
}

/// Response cache of one client.
#[derive(Debug)]
pub struct ResponseCache {
    config: CacheConfig,
    backend: Arc<dyn CacheBackend>,
    clock: SharedClock,
    counters: Counters,
    // Serialises read-modify-write of records.
    writes: tokio::sync::Mutex<()>,
}

impl ResponseCache {
    /// Create a cache over an explicit backend
    #[must_use]
    pub fn new(config: CacheConfig, backend: Arc<dyn CacheBackend>, clock: SharedClock) -> Self {
        Self {
            config,
            backend,
            clock,
            counters: Counters::default(),
            writes: tokio::sync::Mutex::new(()),
        }
    }

    /// Create a cache with the backend named by `config`
    ///
    /// # Errors
    /// Returns an error if the disk backend has no path or cannot be opened
    pub async fn from_config(config: CacheConfig, clock: SharedClock) -> CacheResult<Self> {
        let backend: Arc<dyn CacheBackend> = match config.backend {
            CacheBackendKind::Memory => Arc::new(MemoryCacheBackend::new(config.max_entries)),
            CacheBackendKind::Disk => {
                let Some(path) = config.disk_path.clone() else {
                    return Err(CacheError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "disk cache requires disk_path",
                    )));
                };
                Arc::new(DiskCacheBackend::open(path, config.max_disk_bytes).await?)
            }
        };
        Ok(Self::new(config, backend, clock))
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether `request` takes part in caching at all
    #[must_use]
    pub fn applies_to(&self, request: &RequestDescriptor) -> bool {
        self.config.enabled && request.is_safe()
    }

    /// Find the stored variant for `request`
    pub async fn lookup(&self, request: &RequestDescriptor) -> CacheLookup {
        if !self.applies_to(request) {
            return CacheLookup::Miss;
        }
        let key = primary_key(request);
        let record = match self.backend.get(&key).await {
            Ok(record) => record,
            Err(e) => {
                warn!(key = %key, backend = self.backend.name(), error = %e, "Cache read failed");
                None
            }
        };

        let now = self.clock.wall_time();
        match record.as_ref().and_then(|r| r.select(request)) {
            Some(entry) if entry.is_fresh(now) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, ttl_secs = entry.ttl(now).as_secs(), "Cache hit");
                CacheLookup::Fresh(entry.clone())
            }
            Some(entry) => {
                self.counters.stale_hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, age_secs = entry.age(now).as_secs(), "Cache entry stale");
                CacheLookup::Stale(entry.clone())
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Cache miss");
                CacheLookup::Miss
            }
        }
    }

    /// Copy of `request` carrying the validators of `entry`
    #[must_use]
    pub fn conditional_request(
        request: &RequestDescriptor,
        entry: &CacheEntry,
    ) -> RequestDescriptor {
        let mut conditional = request.clone();
        let headers = conditional.headers_mut();
        if let Some(value) = entry.etag.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
            headers.insert(http::header::IF_NONE_MATCH, value);
        }
        if let Some(value) = entry
            .last_modified
            .as_deref()
            .and_then(|v| HeaderValue::from_str(v).ok())
        {
            headers.insert(http::header::IF_MODIFIED_SINCE, value);
        }
        conditional
    }

    /// Store `response` for `request` if HTTP rules allow it.
    ///
    /// A `no-store` response also removes whatever was stored for the key.
    /// Returns whether the response was stored.
    pub async fn store(&self, request: &RequestDescriptor, response: &Response) -> bool {
        if !self.applies_to(request) || request.cache_directives().no_store {
            return false;
        }
        let key = primary_key(request);
        let directives = ResponseDirectives::from_headers(response.headers());
        if directives.no_store {
            self.invalidate(&key).await;
            return false;
        }
        if !policy::is_storable(
            request.method(),
            response,
            &self.config.cacheable_status_codes,
        ) || response.body().len() > self.config.max_body_bytes
        {
            return false;
        }

        let now = self.clock.wall_time();
        let lifetime = policy::freshness_lifetime(response.headers(), now, self.config.default_ttl);
        let mut names = policy::vary_headers(response.headers()).unwrap_or_default();
        let authorized = request.headers().contains_key(http::header::AUTHORIZATION);
        if (directives.private || (authorized && !directives.public))
            && !names.iter().any(|n| n == "authorization")
        {
            names.push("authorization".to_string());
        }
        let entry = CacheEntry::from_response(
            response,
            VarySelector::capture(&names, request),
            now,
            lifetime,
        );
        if lifetime.is_zero() && !entry.has_validators() {
            return false;
        }

        let _guard = self.writes.lock().await;
        let mut record = self.read_record(&key).await;
        record.insert(entry);
        if let Err(e) = self.backend.put(record).await {
            warn!(key = %key, error = %e, "Cache write failed");
            return false;
        }
        self.counters.stores.fetch_add(1, Ordering::Relaxed);
        debug!(
            key = %key,
            lifetime_secs = lifetime.as_secs(),
            default_ttl = !directives.has_freshness(),
            "Stored response"
        );
        true
    }

    /// Apply a `304 Not Modified` to the stale `entry` and return the
    /// refreshed response
    pub async fn revalidated(
        &self,
        request: &RequestDescriptor,
        entry: &CacheEntry,
        not_modified: &Response,
    ) -> Response {
        let now = self.clock.wall_time();
        let mut refreshed = entry.clone();
        refreshed.refresh(not_modified, now, Duration::ZERO);
        refreshed.freshness_lifetime =
            policy::freshness_lifetime(&refreshed.header_map(), now, self.config.default_ttl);

        let key = primary_key(request);
        {
            let _guard = self.writes.lock().await;
            let mut record = self.read_record(&key).await;
            record.insert(refreshed.clone());
            if let Err(e) = self.backend.put(record).await {
                warn!(key = %key, error = %e, "Cache write failed");
            }
        }
        self.counters.revalidations.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Revalidated cache entry");
        refreshed.to_response(ResponseSource::Revalidated)
    }

    async fn read_record(&self, key: &str) -> CacheRecord {
        match self.backend.get(key).await {
            Ok(Some(record)) => record,
            Ok(None) => CacheRecord::new(key),
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed");
                CacheRecord::new(key)
            }
        }
    }

    /// Remove the record stored under `key`
    pub async fn invalidate(&self, key: &str) -> bool {
        let _guard = self.writes.lock().await;
        match self.backend.delete(key).await {
            Ok(removed) => {
                if removed {
                    self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
                }
                removed
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache invalidation failed");
                false
            }
        }
    }

    /// Remove the GET and HEAD records for the URL of `request`
    pub async fn invalidate_url(&self, request: &RequestDescriptor) -> u64 {
        let url = entry::normalize_url(request.url());
        let mut removed = 0;
        for method in [Method::GET, Method::HEAD] {
            if self.invalidate(&format!("{method} {url}")).await {
                removed += 1;
            }
        }
        removed
    }

    /// Remove every record whose key matches the glob `pattern`
    ///
    /// # Errors
    /// Returns an error for an invalid pattern or a failing backend
    pub async fn invalidate_pattern(&self, pattern: &str) -> CacheResult<u64> {
        let pattern = KeyPattern::new(pattern)?;
        let _guard = self.writes.lock().await;
        let removed = self.backend.delete_pattern(&pattern).await?;
        self.counters
            .invalidations
            .fetch_add(removed, Ordering::Relaxed);
        debug!(pattern = %pattern.as_str(), removed = removed, "Invalidated cache records");
        Ok(removed)
    }

    /// Remove everything
    ///
    /// # Errors
    /// Returns an error if the backend fails
    pub async fn clear(&self) -> CacheResult<()> {
        let _guard = self.writes.lock().await;
        self.backend.clear().await
    }

    /// Current statistics
    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stale_hits: self.counters.stale_hits.load(Ordering::Relaxed),
            revalidations: self.counters.revalidations.load(Ordering::Relaxed),
            stores: self.counters.stores.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            entries: self.backend.len().await.unwrap_or_default(),
        }
    }
}
