use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use arbor_core::now_millis;

use crate::backend::StorageBackend;
use crate::error::{RawStoreError, Result, StorageError};
use crate::raw::RawStore;

/// Number of retries after a hard quota failure from the raw store.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

const META_SUFFIX: &str = "__meta__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaConfig {
    /// Namespace prepended to every key written to the raw store.
    pub key_prefix: String,
    /// Soft budget for the sum of stored value sizes.
    pub max_bytes: u64,
    pub max_retries: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            key_prefix: "arbor:".to_string(),
            max_bytes: 5 * 1024 * 1024,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Size and write time of a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub size: u64,
    pub timestamp: u64,
}

#[derive(Debug, Default)]
struct QuotaState {
    meta: HashMap<String, EntryMeta>,
    total: u64,
    // Last handed-out timestamp; keeps write order strict within a millisecond.
    clock: u64,
}

impl QuotaState {
    fn next_timestamp(&mut self) -> u64 {
        self.clock = now_millis().max(self.clock + 1);
        self.clock
    }

    /// Keys ordered oldest first, skipping `protect`.
    fn oldest_keys(&self, protect: &str) -> Vec<String> {
        let mut keys: Vec<(&String, &EntryMeta)> = self
            .meta
            .iter()
            .filter(|(key, _)| key.as_str() != protect)
            .collect();
        keys.sort_by(|(a_key, a), (b_key, b)| {
            a.timestamp.cmp(&b.timestamp).then_with(|| a_key.cmp(b_key))
        });
        keys.into_iter().map(|(key, _)| key.clone()).collect()
    }
}

/// Quota-bounded persistent store over a [`RawStore`].
///
/// Tracks `{size, timestamp}` per key plus a running total. Writes that would push the total
/// over `max_bytes` first evict the oldest entries; a hard quota failure from the raw store is
/// retried up to `max_retries` times, each retry evicting a quarter of the remaining entries.
pub struct QuotaBackend<S> {
    store: S,
    config: QuotaConfig,
    state: Mutex<QuotaState>,
}

impl<S: RawStore> QuotaBackend<S> {
    /// Opens the backend, reconciling persisted metadata with the raw store contents.
    ///
    /// Entries present in the store but missing from the metadata are adopted with timestamp
    /// `0`, making them the first eviction candidates.
    pub fn open(store: S, config: QuotaConfig) -> Self {
        let backend = Self {
            store,
            config,
            state: Mutex::new(QuotaState::default()),
        };
        backend.reload_metadata();
        backend
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    pub fn raw_store(&self) -> &S {
        &self.store
    }

    pub fn entry_meta(&self, key: &str) -> Option<EntryMeta> {
        self.state.lock().meta.get(key).copied()
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.lock().total
    }

    pub fn len(&self) -> usize {
        self.state.lock().meta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn raw_key(&self, key: &str) -> String {
        format!("{}{key}", self.config.key_prefix)
    }

    fn meta_key(&self) -> String {
        format!("{}{META_SUFFIX}", self.config.key_prefix)
    }

    /// The metadata record shares the key namespace; its name is not available to callers.
    fn check_key(key: &str) -> Result<()> {
        if key == META_SUFFIX {
            return Err(StorageError::ReservedKey {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    fn reload_metadata(&self) {
        let mut persisted: HashMap<String, EntryMeta> = match self.store.get_item(&self.meta_key())
        {
            Ok(Some(text)) => serde_json::from_str(&text).unwrap_or_else(|err| {
                tracing::warn!(
                    target = "arbor.storage",
                    error = %err,
                    "discarding unreadable quota metadata"
                );
                HashMap::new()
            }),
            Ok(None) => HashMap::new(),
            Err(err) => {
                tracing::warn!(
                    target = "arbor.storage",
                    error = %err,
                    "failed to read quota metadata"
                );
                HashMap::new()
            }
        };

        let mut state = QuotaState::default();
        let keys = match self.stored_keys() {
            Ok(keys) => keys,
            Err(err) => {
                tracing::warn!(
                    target = "arbor.storage",
                    error = %err,
                    "failed to list raw store keys"
                );
                Vec::new()
            }
        };
        for key in keys {
            let meta = match persisted.remove(&key) {
                Some(meta) => meta,
                None => {
                    let size = self
                        .store
                        .get_item(&self.raw_key(&key))
                        .ok()
                        .flatten()
                        .map_or(0, |text| text.len() as u64);
                    EntryMeta { size, timestamp: 0 }
                }
            };
            state.total = state.total.saturating_add(meta.size);
            state.clock = state.clock.max(meta.timestamp);
            state.meta.insert(key, meta);
        }
        *self.state.lock() = state;
    }

    fn stored_keys(&self) -> std::io::Result<Vec<String>> {
        let meta_key = self.meta_key();
        Ok(self
            .store
            .keys()?
            .into_iter()
            .filter(|raw| raw != &meta_key)
            .filter_map(|raw| {
                raw.strip_prefix(self.config.key_prefix.as_str())
                    .map(str::to_string)
            })
            .collect())
    }

    fn persist_metadata(&self, state: &QuotaState) {
        let text = match serde_json::to_string(&state.meta) {
            Ok(text) => text,
            Err(err) => {
                tracing::debug!(
                    target = "arbor.storage",
                    error = %err,
                    "failed to encode quota metadata"
                );
                return;
            }
        };
        if let Err(err) = self.store.set_item(&self.meta_key(), &text) {
            tracing::debug!(
                target = "arbor.storage",
                error = %err,
                "failed to persist quota metadata"
            );
        }
    }

    fn evict_key(&self, state: &mut QuotaState, key: &str) -> bool {
        if let Err(err) = self.store.remove_item(&self.raw_key(key)) {
            tracing::debug!(
                target = "arbor.storage",
                key,
                error = %err,
                "failed to evict entry"
            );
            return false;
        }
        if let Some(meta) = state.meta.remove(key) {
            state.total = state.total.saturating_sub(meta.size);
        }
        tracing::debug!(target = "arbor.storage", key, "evicted entry");
        true
    }

    /// Evicts up to `count` of the oldest entries other than `protect`.
    fn evict_oldest(&self, state: &mut QuotaState, count: usize, protect: &str) -> usize {
        let mut evicted = 0;
        for key in state.oldest_keys(protect).into_iter().take(count) {
            if self.evict_key(state, &key) {
                evicted += 1;
            }
        }
        evicted
    }

    /// Evicts oldest entries until `incoming` more bytes fit under the budget.
    fn evict_until_fits(&self, state: &mut QuotaState, key: &str, incoming: u64) -> usize {
        let mut evicted = 0;
        for candidate in state.oldest_keys(key) {
            let previous = state.meta.get(key).map_or(0, |meta| meta.size);
            let projected = state.total.saturating_sub(previous).saturating_add(incoming);
            if projected <= self.config.max_bytes {
                break;
            }
            if self.evict_key(state, &candidate) {
                evicted += 1;
            }
        }
        evicted
    }
}

impl<S: RawStore> StorageBackend for QuotaBackend<S> {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        if key == META_SUFFIX {
            return Ok(None);
        }
        let raw_key = self.raw_key(key);
        let text = match self.store.get_item(&raw_key) {
            Ok(Some(text)) => text,
            Ok(None) => return Ok(None),
            Err(err) => {
                tracing::debug!(
                    target = "arbor.storage",
                    key,
                    error = %err,
                    "failed to read entry; treating as miss"
                );
                return Ok(None);
            }
        };

        match serde_json::from_str(&text) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                tracing::warn!(
                    target = "arbor.storage",
                    key,
                    error = %err,
                    "removing corrupted entry"
                );
                let mut state = self.state.lock();
                self.evict_key(&mut state, key);
                self.persist_metadata(&state);
                Ok(None)
            }
        }
    }

    fn set(&self, key: &str, value: Value) -> Result<Value> {
        Self::check_key(key)?;
        let text = serde_json::to_string(&value)?;
        let size = text.len() as u64;
        let raw_key = self.raw_key(key);

        let mut state = self.state.lock();
        let previous = state.meta.get(key).map_or(0, |meta| meta.size);
        if state.total.saturating_sub(previous).saturating_add(size) > self.config.max_bytes {
            let evicted = self.evict_until_fits(&mut state, key, size);
            tracing::debug!(
                target = "arbor.storage",
                key,
                size,
                evicted,
                "evicted entries to stay within quota"
            );
        }

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.store.set_item(&raw_key, &text) {
                Ok(()) => {
                    let timestamp = state.next_timestamp();
                    if let Some(old) = state.meta.insert(key.to_string(), EntryMeta { size, timestamp })
                    {
                        state.total = state.total.saturating_sub(old.size);
                    }
                    state.total = state.total.saturating_add(size);
                    self.persist_metadata(&state);
                    return Ok(value);
                }
                Err(RawStoreError::QuotaExceeded) => {
                    let retries = attempts - 1;
                    let evictable = state.meta.keys().filter(|k| k.as_str() != key).count();
                    if retries >= self.config.max_retries || evictable == 0 {
                        tracing::warn!(
                            target = "arbor.storage",
                            key,
                            size,
                            attempts,
                            "storage quota exhausted"
                        );
                        self.persist_metadata(&state);
                        return Err(StorageError::QuotaExceeded {
                            key: key.to_string(),
                            attempts,
                        });
                    }
                    let count = (evictable / 4).max(1);
                    self.evict_oldest(&mut state, count, key);
                }
                Err(RawStoreError::Io(err)) => return Err(err.into()),
            }
        }
    }

    fn remove(&self, key: &str) -> Result<()> {
        Self::check_key(key)?;
        self.store.remove_item(&self.raw_key(key))?;
        let mut state = self.state.lock();
        if let Some(meta) = state.meta.remove(key) {
            state.total = state.total.saturating_sub(meta.size);
            self.persist_metadata(&state);
        }
        Ok(())
    }

    fn has(&self, key: &str) -> Result<bool> {
        if key == META_SUFFIX {
            return Ok(false);
        }
        if self.state.lock().meta.contains_key(key) {
            return Ok(true);
        }
        Ok(self.store.get_item(&self.raw_key(key))?.is_some())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.stored_keys()?)
    }

    fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        for key in self.stored_keys()? {
            self.store.remove_item(&self.raw_key(&key))?;
        }
        self.store.remove_item(&self.meta_key())?;
        state.meta.clear();
        state.total = 0;
        Ok(())
    }

    fn estimate_size(&self) -> Option<u64> {
        Some(self.state.lock().total)
    }
}
