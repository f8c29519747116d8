use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;

use crate::backend::{AsyncStorageBackend, StorageBackend};
use crate::error::Result;

/// In-process store backed by an LRU map.
///
/// Unbounded by default; [`MemoryBackend::with_capacity`] caps the number of entries and drops
/// the least recently used entry on overflow.
#[derive(Debug)]
pub struct MemoryBackend {
    entries: Mutex<LruCache<String, Value>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
        }
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<Value> {
        self.entries.lock().put(key.to_string(), value.clone());
        Ok(value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().pop(key);
        Ok(())
    }

    fn has(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().contains(key))
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .iter()
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn clear(&self) -> Result<()> {
        self.entries.lock().clear();
        Ok(())
    }

    fn estimate_size(&self) -> Option<u64> {
        let entries = self.entries.lock();
        let bytes = entries
            .iter()
            .map(|(key, value)| {
                let value_len = serde_json::to_vec(value).map_or(0, |bytes| bytes.len());
                (key.len() + value_len) as u64
            })
            .sum();
        Some(bytes)
    }
}

#[async_trait::async_trait]
impl AsyncStorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        StorageBackend::get(self, key)
    }

    async fn set(&self, key: &str, value: Value) -> Result<Value> {
        StorageBackend::set(self, key, value)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        StorageBackend::remove(self, key)
    }

    async fn has(&self, key: &str) -> Result<bool> {
        StorageBackend::has(self, key)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        StorageBackend::keys(self)
    }

    async fn clear(&self) -> Result<()> {
        StorageBackend::clear(self)
    }

    async fn estimate_size(&self) -> Option<u64> {
        StorageBackend::estimate_size(self)
    }
}
