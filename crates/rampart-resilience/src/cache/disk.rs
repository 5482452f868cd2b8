//! Persistent cache backend bounded by bytes on disk.
//!
//! Each record lives in its own JSON file named after the SHA-256 of its key.
//! An in-memory index tracks sizes and recency; it is rebuilt from the
//! directory when the backend is opened.

use super::backend::{CacheBackend, CacheError, CacheResult, KeyPattern};
use super::entry::CacheRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct IndexEntry {
    size: u64,
    used: u64,
}

#[derive(Debug, Default)]
struct DiskIndex {
    entries: HashMap<String, IndexEntry>,
    order: BTreeMap<u64, String>,
    total_bytes: u64,
    tick: u64,
}

impl DiskIndex {
    fn upsert(&mut self, key: &str, size: u64) {
        self.remove(key);
        self.tick += 1;
        self.entries.insert(
            key.to_string(),
            IndexEntry {
                size,
                used: self.tick,
            },
        );
        self.order.insert(self.tick, key.to_string());
        self.total_bytes += size;
    }

    fn touch(&mut self, key: &str) -> bool {
        self.tick += 1;
        let tick = self.tick;
        match self.entries.get_mut(key) {
            Some(entry) => {
                self.order.remove(&entry.used);
                entry.used = tick;
                self.order.insert(tick, key.to_string());
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.order.remove(&entry.used);
                self.total_bytes = self.total_bytes.saturating_sub(entry.size);
                true
            }
            None => false,
        }
    }

    /// Pop least recently used keys until the total fits `max_bytes`
    fn evict(&mut self, max_bytes: u64, keep: &str) -> Vec<String> {
        let mut victims = Vec::new();
        while self.total_bytes > max_bytes {
            let Some(key) = self
                .order
                .values()
                .find(|k| k.as_str() != keep)
                .cloned()
            else {
                break;
            };
            self.remove(&key);
            victims.push(key);
        }
        victims
    }
}

/// Backend storing one file per record under a directory.
pub struct DiskCacheBackend {
    dir: PathBuf,
    max_bytes: u64,
    index: Mutex<DiskIndex>,
}

impl DiskCacheBackend {
    /// Open (or create) a cache directory holding at most `max_bytes`
    ///
    /// # Errors
    /// Returns an I/O error if the directory cannot be created or listed
    pub async fn open(dir: impl Into<PathBuf>, max_bytes: u64) -> CacheResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut found: Vec<(SystemTime, String, u64)> = Vec::new();
        let mut listing = tokio::fs::read_dir(&dir).await?;
        while let Some(item) = listing.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path).await {
                Ok(record) => {
                    let metadata = item.metadata().await?;
                    let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    found.push((modified, record.key, metadata.len()));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Removing unreadable cache file");
                    discard(&path).await;
                }
            }
        }

        found.sort_by(|a, b| a.0.cmp(&b.0));
        let mut index = DiskIndex::default();
        for (_, key, size) in found {
            index.upsert(&key, size);
        }
        let victims = index.evict(max_bytes, "");

        info!(
            dir = %dir.display(),
            entries = index.entries.len(),
            bytes = index.total_bytes,
            "Opened disk cache"
        );

        let backend = Self {
            dir,
            max_bytes,
            index: Mutex::new(index),
        };
        backend.remove_files(&victims).await;
        Ok(backend)
    }

    /// Directory holding the cache files
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Bytes currently on disk
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.index.lock().total_bytes
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name = hex::encode(Sha256::digest(key.as_bytes()));
        self.dir.join(format!("{name}.json"))
    }

    async fn remove_files(&self, keys: &[String]) {
        for key in keys {
            let path = self.path_for(key);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(key = %key, "Evicted cache file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove cache file"),
            }
        }
    }
}

/// Delete a bad cache file, returning whether it is gone
async fn discard(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove bad cache file");
            false
        }
    }
}

async fn read_record(path: &Path) -> CacheResult<CacheRecord> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

impl fmt::Debug for DiskCacheBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let index = self.index.lock();
        f.debug_struct("DiskCacheBackend")
            .field("dir", &self.dir)
            .field("max_bytes", &self.max_bytes)
            .field("total_bytes", &index.total_bytes)
            .field("entries", &index.entries.len())
            .finish()
    }
}

#[async_trait]
impl CacheBackend for DiskCacheBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<CacheRecord>> {
        if !self.index.lock().touch(key) {
            return Ok(None);
        }
        let path = self.path_for(key);
        match read_record(&path).await {
            Ok(record) if record.key == key => Ok(Some(record)),
            Ok(_) => Ok(None),
            Err(CacheError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                self.index.lock().remove(key);
                Ok(None)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Dropping corrupt cache file");
                self.index.lock().remove(key);
                discard(&path).await;
                Ok(None)
            }
        }
    }

    async fn put(&self, record: CacheRecord) -> CacheResult<()> {
        let bytes = serde_json::to_vec(&record)?;
        let size = bytes.len() as u64;
        if size > self.max_bytes {
            debug!(key = %record.key, size = size, "Record larger than disk cache, not stored");
            self.delete(&record.key).await?;
            return Ok(());
        }

        let path = self.path_for(&record.key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let victims = {
            let mut index = self.index.lock();
            index.upsert(&record.key, size);
            index.evict(self.max_bytes, &record.key)
        };
        self.remove_files(&victims).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let existed = self.index.lock().remove(key);
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(existed),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_pattern(&self, pattern: &KeyPattern) -> CacheResult<u64> {
        let matching: Vec<String> = {
            let mut index = self.index.lock();
            let keys: Vec<String> = index
                .entries
                .keys()
                .filter(|key| pattern.matches(key))
                .cloned()
                .collect();
            for key in &keys {
                index.remove(key);
            }
            keys
        };
        self.remove_files(&matching).await;
        Ok(matching.len() as u64)
    }

    async fn len(&self) -> CacheResult<usize> {
        Ok(self.index.lock().entries.len())
    }

    async fn clear(&self) -> CacheResult<()> {
        let keys: Vec<String> = {
            let mut index = self.index.lock();
            let keys = index.entries.keys().cloned().collect();
            *index = DiskIndex::default();
            keys
        };
        self.remove_files(&keys).await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "disk"
    }
}
