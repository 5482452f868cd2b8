//! Storage backends for cache records.

use super::entry::CacheRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Error types for cache backend operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// Filesystem error
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded or decoded
    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid invalidation pattern
    #[error("Invalid cache key pattern: {0}")]
    Pattern(String),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Glob over primary keys: `*` matches any run, `?` one character.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    glob: String,
    regex: Regex,
}

impl KeyPattern {
    /// Compile a glob
    ///
    /// # Errors
    /// Returns [`CacheError::Pattern`] for an empty glob
    pub fn new(glob: &str) -> CacheResult<Self> {
        if glob.is_empty() {
            return Err(CacheError::Pattern("empty pattern".to_string()));
        }
        let mut source = String::with_capacity(glob.len() + 8);
        source.push('^');
        for ch in glob.chars() {
            match ch {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                other => source.push_str(&regex::escape(&other.to_string())),
            }
        }
        source.push('$');
        let regex = Regex::new(&source).map_err(|e| CacheError::Pattern(e.to_string()))?;
        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    /// Whether `key` matches
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    /// Source glob
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.glob
    }
}

/// Cache backend trait for polymorphic cache implementations
#[async_trait]
pub trait CacheBackend: Send + Sync + fmt::Debug {
    /// Record stored under `key`
    async fn get(&self, key: &str) -> CacheResult<Option<CacheRecord>>;

    /// Store `record` under its key, evicting per backend policy
    async fn put(&self, record: CacheRecord) -> CacheResult<()>;

    /// Remove `key`; returns whether it existed
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Remove every key matching `pattern`; returns how many were removed
    async fn delete_pattern(&self, pattern: &KeyPattern) -> CacheResult<u64>;

    /// Number of stored records
    async fn len(&self) -> CacheResult<usize>;

    /// Remove everything
    async fn clear(&self) -> CacheResult<()>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

#[derive(Debug, Default)]
struct LruState {
    records: HashMap<String, (CacheRecord, u64)>,
    order: BTreeMap<u64, String>,
    tick: u64,
}

impl LruState {
    fn touch(&mut self, key: &str) {
        self.tick += 1;
        let tick = self.tick;
        if let Some((_, used)) = self.records.get_mut(key) {
            self.order.remove(used);
            *used = tick;
            self.order.insert(tick, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.records.remove(key) {
            Some((_, used)) => {
                self.order.remove(&used);
                true
            }
            None => false,
        }
    }
}

/// In-memory backend bounded by record count, evicting the least recently
/// used record first.
pub struct MemoryCacheBackend {
    max_entries: usize,
    state: Mutex<LruState>,
}

impl MemoryCacheBackend {
    /// Create a backend holding at most `max_entries` records
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            state: Mutex::new(LruState::default()),
        }
    }
}

impl fmt::Debug for MemoryCacheBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCacheBackend")
            .field("max_entries", &self.max_entries)
            .field("entries", &self.state.lock().records.len())
            .finish()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<CacheRecord>> {
        let mut state = self.state.lock();
        state.touch(key);
        Ok(state.records.get(key).map(|(record, _)| record.clone()))
    }

    async fn put(&self, record: CacheRecord) -> CacheResult<()> {
        let mut state = self.state.lock();
        let key = record.key.clone();
        state.remove(&key);
        state.tick += 1;
        let tick = state.tick;
        state.order.insert(tick, key.clone());
        state.records.insert(key, (record, tick));

        while state.records.len() > self.max_entries {
            let Some((_, oldest)) = state.order.pop_first() else {
                break;
            };
            state.records.remove(&oldest);
            debug!(key = %oldest, "Evicted least recently used cache record");
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.state.lock().remove(key))
    }

    async fn delete_pattern(&self, pattern: &KeyPattern) -> CacheResult<u64> {
        let mut state = self.state.lock();
        let matching: Vec<String> = state
            .records
            .keys()
            .filter(|key| pattern.matches(key))
            .cloned()
            .collect();
        for key in &matching {
            state.remove(key);
        }
        Ok(matching.len() as u64)
    }

    async fn len(&self) -> CacheResult<usize> {
        Ok(self.state.lock().records.len())
    }

    async fn clear(&self) -> CacheResult<()> {
        let mut state = self.state.lock();
        state.records.clear();
        state.order.clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
