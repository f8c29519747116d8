use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arbor_core::{ancestors, is_descendant, now_millis, parent_path, DirectoryNode, NodeKind};
use arbor_storage::{AsyncStorageBackend, StorageBackend, StorageError};
use serde_json::Value;

use crate::entry::{
    CachedChildEntry, CachedDirectoryEntry, CachedTreeRoot, IntegrityViolation, LazyContinuation,
    TREE_CACHE_SCHEMA_VERSION,
};
use crate::error::{CacheError, Result};
use crate::key::TreeKeys;

const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeCacheConfig {
    /// Namespace of every tree cache key (`<prefix>:tree:...`).
    pub key_prefix: String,
    /// Upper bound on cached directory entries enforced by maintenance.
    pub max_entries: usize,
    /// Entries older than this are dropped by maintenance.
    pub ttl: Duration,
    /// Default page size for lazily loaded directories.
    pub lazy_batch_size: usize,
}

impl Default for TreeCacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "arbor".to_string(),
            max_entries: 5_000,
            ttl: DEFAULT_TTL,
            lazy_batch_size: 200,
        }
    }
}

/// Child-level difference between a cached listing and a fresh one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncrementalUpdate {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

impl IncrementalUpdate {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub checked: usize,
    pub corrupted: usize,
    pub repaired: usize,
}

/// First page of a cached directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LazyDirectory {
    pub node: DirectoryNode,
    pub has_more: bool,
    pub total_children: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub corruptions_repaired: u64,
    pub evictions: u64,
    pub entries: usize,
}

enum EntryRead {
    Found(CachedDirectoryEntry),
    Missing,
    Outdated { found: u64 },
    Corrupt(String),
    Failed(CacheError),
}

fn decode_entry(path: &str, value: Value) -> EntryRead {
    match value.get("version").and_then(Value::as_u64) {
        Some(version) if version == u64::from(TREE_CACHE_SCHEMA_VERSION) => {}
        Some(found) => return EntryRead::Outdated { found },
        None => return EntryRead::Corrupt("missing schema version".to_string()),
    }
    let entry: CachedDirectoryEntry = match serde_json::from_value(value) {
        Ok(entry) => entry,
        Err(err) => return EntryRead::Corrupt(err.to_string()),
    };
    if entry.path != path {
        return EntryRead::Corrupt(
            IntegrityViolation::KeyMismatch {
                key_path: path.to_string(),
                path: entry.path,
            }
            .to_string(),
        );
    }
    match entry.validate() {
        Ok(()) => EntryRead::Found(entry),
        Err(violation) => EntryRead::Corrupt(violation.to_string()),
    }
}

struct Inner {
    store: Arc<dyn StorageBackend>,
    durable: Option<Arc<dyn AsyncStorageBackend>>,
    keys: TreeKeys,
    config: TreeCacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    corruptions_repaired: AtomicU64,
    evictions: AtomicU64,
}

/// Persistent cache of directory listings.
///
/// Every loaded directory is stored as its own [`CachedDirectoryEntry`] holding shallow child
/// summaries; reads re-hydrate a subtree by following child directories to their entries.
///
/// Writes go to the synchronous store and, when configured, to the durable asynchronous
/// store. Reads try the synchronous store first and back-fill it from the durable store.
///
/// Entries failing validation are never returned: the read becomes a miss and the entry and
/// all of its ancestors are invalidated.
#[derive(Clone)]
pub struct TreeCacheController {
    inner: Arc<Inner>,
}

impl fmt::Debug for TreeCacheController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeCacheController")
            .field("config", &self.inner.config)
            .field("durable", &self.inner.durable.is_some())
            .finish_non_exhaustive()
    }
}

impl TreeCacheController {
    pub fn new(
        store: Arc<dyn StorageBackend>,
        durable: Option<Arc<dyn AsyncStorageBackend>>,
        config: TreeCacheConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                durable,
                keys: TreeKeys::new(&config.key_prefix),
                config,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                corruptions_repaired: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &TreeCacheConfig {
        &self.inner.config
    }

    pub fn keys(&self) -> &TreeKeys {
        &self.inner.keys
    }

    // -- store plumbing -----------------------------------------------------------------

    async fn read_value(&self, key: &str) -> Result<Option<Value>> {
        let mut failure: Option<StorageError> = None;
        match self.inner.store.get(key) {
            Ok(Some(value)) => return Ok(Some(value)),
            Ok(None) => {}
            Err(err) => failure = Some(err),
        }
        if let Some(durable) = &self.inner.durable {
            match durable.get(key).await {
                Ok(Some(value)) => {
                    if let Err(err) = self.inner.store.set(key, value.clone()) {
                        tracing::debug!(
                            target = "arbor.cache",
                            key,
                            error = %err,
                            "failed to back-fill tree cache entry"
                        );
                    }
                    return Ok(Some(value));
                }
                Ok(None) => {}
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        match failure {
            Some(err) => Err(err.into()),
            None => Ok(None),
        }
    }

    async fn write_value(&self, key: &str, value: Value) -> Result<()> {
        let Some(durable) = &self.inner.durable else {
            self.inner.store.set(key, value)?;
            return Ok(());
        };
        let sync_result = self.inner.store.set(key, value.clone());
        let durable_result = durable.set(key, value).await;
        match (sync_result, durable_result) {
            (Ok(_), Ok(_)) => Ok(()),
            (Ok(_), Err(err)) | (Err(err), Ok(_)) => {
                tracing::debug!(
                    target = "arbor.cache",
                    key,
                    error = %err,
                    "tree cache write reached only one store"
                );
                Ok(())
            }
            (Err(err), Err(_)) => Err(err.into()),
        }
    }

    /// Removes `key` from both stores; `false` if any removal failed.
    async fn remove_value(&self, key: &str) -> bool {
        let mut removed = true;
        if let Err(err) = self.inner.store.remove(key) {
            removed = false;
            tracing::debug!(
                target = "arbor.cache",
                key,
                error = %err,
                "failed to remove tree cache key"
            );
        }
        if let Some(durable) = &self.inner.durable {
            if let Err(err) = durable.remove(key).await {
                removed = false;
                tracing::debug!(
                    target = "arbor.cache",
                    key,
                    error = %err,
                    "failed to remove tree cache key from durable store"
                );
            }
        }
        removed
    }

    async fn list_keys(&self) -> BTreeSet<String> {
        let keys = &self.inner.keys;
        let mut out = BTreeSet::new();
        match self.inner.store.keys() {
            Ok(list) => out.extend(list.into_iter().filter(|key| keys.owns(key))),
            Err(err) => {
                tracing::warn!(target = "arbor.cache", error = %err, "failed to list tree cache keys");
            }
        }
        if let Some(durable) = &self.inner.durable {
            match durable.keys().await {
                Ok(list) => out.extend(list.into_iter().filter(|key| keys.owns(key))),
                Err(err) => {
                    tracing::warn!(
                        target = "arbor.cache",
                        error = %err,
                        "failed to list durable tree cache keys"
                    );
                }
            }
        }
        out
    }

    /// `cachedAt` of a stored entry without decoding it; unreadable entries report `0`.
    async fn entry_timestamp(&self, path: &str) -> u64 {
        match self.read_value(&self.inner.keys.dir(path)).await {
            Ok(Some(value)) => value.get("cachedAt").and_then(Value::as_u64).unwrap_or(0),
            Ok(None) | Err(_) => 0,
        }
    }

    /// Paths of every cached directory entry, sorted.
    pub async fn cached_directory_paths(&self) -> Vec<String> {
        let keys = &self.inner.keys;
        self.list_keys()
            .await
            .iter()
            .filter_map(|key| keys.dir_path(key).map(str::to_string))
            .collect()
    }

    // -- entries ------------------------------------------------------------------------

    async fn write_entry(&self, entry: &CachedDirectoryEntry) -> Result<()> {
        let value = serde_json::to_value(entry)?;
        self.write_value(&self.inner.keys.dir(&entry.path), value)
            .await
    }

    /// Writes an entry for `node` and every loaded directory below it.
    async fn write_directories(&self, node: &DirectoryNode, cached_at: u64) -> Result<u64> {
        if !node.is_dir() || !node.is_loaded {
            return Err(CacheError::NotLoadedDirectory {
                path: node.path.clone(),
            });
        }
        let mut written = 0u64;
        let mut stack = vec![node];
        while let Some(dir) = stack.pop() {
            self.write_entry(&CachedDirectoryEntry::from_node(dir, cached_at))
                .await?;
            written += 1;
            stack.extend(
                dir.children
                    .iter()
                    .filter(|child| child.is_dir() && child.is_loaded),
            );
        }
        Ok(written)
    }

    async fn load_entry(&self, path: &str) -> EntryRead {
        match self.read_value(&self.inner.keys.dir(path)).await {
            Ok(Some(value)) => decode_entry(path, value),
            Ok(None) => EntryRead::Missing,
            Err(err) => EntryRead::Failed(err),
        }
    }

    /// Reads a valid entry, cleaning up outdated and corrupted ones on the way.
    async fn read_entry(&self, path: &str) -> Option<CachedDirectoryEntry> {
        match self.load_entry(path).await {
            EntryRead::Found(entry) => Some(entry),
            EntryRead::Missing => None,
            EntryRead::Outdated { found } => {
                tracing::debug!(
                    target = "arbor.cache",
                    path,
                    found,
                    expected = TREE_CACHE_SCHEMA_VERSION,
                    "dropping tree cache entry with outdated schema"
                );
                self.remove_value(&self.inner.keys.dir(path)).await;
                None
            }
            EntryRead::Corrupt(reason) => {
                self.repair(path, &reason).await;
                None
            }
            EntryRead::Failed(err) => {
                self.repair(path, &err.to_string()).await;
                None
            }
        }
    }

    async fn repair(&self, path: &str, reason: &str) -> bool {
        self.inner
            .corruptions_repaired
            .fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            target = "arbor.cache",
            path,
            reason,
            "repairing corrupted tree cache entry"
        );
        self.invalidate_with_ancestors(path).await
    }

    /// Rebuilds the subtree rooted at `root` from the per-directory entries.
    async fn hydrate(&self, root: CachedDirectoryEntry) -> DirectoryNode {
        let root_path = root.path.clone();
        let mut entries: HashMap<String, CachedDirectoryEntry> = HashMap::new();
        let mut queue = VecDeque::from([root_path.clone()]);
        entries.insert(root_path.clone(), root);

        while let Some(path) = queue.pop_front() {
            let Some(entry) = entries.get(&path) else {
                continue;
            };
            let child_dirs: Vec<String> = entry
                .children
                .iter()
                .filter(|child| child.kind == NodeKind::Dir)
                .map(|child| child.path.clone())
                .collect();
            for child in child_dirs {
                if entries.contains_key(&child) {
                    continue;
                }
                if let Some(child_entry) = self.read_entry(&child).await {
                    entries.insert(child.clone(), child_entry);
                    queue.push_back(child);
                }
            }
        }

        match build_node(&root_path, &mut entries) {
            Some(node) => node,
            None => DirectoryNode::dir(root_path, 0),
        }
    }

    fn record_hit(&self) {
        self.inner.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.inner.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Bumps `cachedAt` of an entry that was just read, off the caller's path.
    fn schedule_touch(&self, path: &str, observed: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let this = self.clone();
        let path = path.to_string();
        handle.spawn(async move {
            this.touch(&path, observed).await;
        });
    }

    async fn touch(&self, path: &str, observed: u64) {
        let EntryRead::Found(mut entry) = self.load_entry(path).await else {
            return;
        };
        // Rewritten since the read; the newer write wins.
        if entry.cached_at != observed {
            return;
        }
        let now = now_millis();
        if now <= observed {
            return;
        }
        entry.cached_at = now;
        if let Err(err) = self.write_entry(&entry).await {
            tracing::debug!(
                target = "arbor.cache",
                path,
                error = %err,
                "failed to refresh tree cache entry timestamp"
            );
        }
    }

    // -- public API ---------------------------------------------------------------------

    /// Caches a whole tree: a root record plus an entry for every loaded directory.
    pub async fn cache_tree(&self, root: &DirectoryNode) -> Result<()> {
        let cached_at = now_millis();
        let directory_count = self.write_directories(root, cached_at).await?;
        let record = CachedTreeRoot {
            path: root.path.clone(),
            cached_at,
            directory_count,
            file_count: root.file_count(),
            version: TREE_CACHE_SCHEMA_VERSION,
        };
        self.write_value(
            &self.inner.keys.root(&root.path),
            serde_json::to_value(&record)?,
        )
        .await?;
        tracing::debug!(
            target = "arbor.cache",
            path = %root.path,
            directories = directory_count,
            files = record.file_count,
            "cached tree"
        );
        Ok(())
    }

    /// Caches one directory listing and any loaded directories below it.
    pub async fn cache_directory(&self, node: &DirectoryNode) -> Result<()> {
        let written = self.write_directories(node, now_millis()).await?;
        tracing::trace!(
            target = "arbor.cache",
            path = %node.path,
            directories = written,
            "cached directory"
        );
        Ok(())
    }

    pub async fn get_cached_tree(&self, root_path: &str) -> Option<DirectoryNode> {
        let key = self.inner.keys.root(root_path);
        let value = match self.read_value(&key).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                self.record_miss();
                return None;
            }
            Err(err) => {
                tracing::warn!(
                    target = "arbor.cache",
                    path = root_path,
                    error = %err,
                    "failed to read cached tree root"
                );
                self.record_miss();
                return None;
            }
        };
        match serde_json::from_value::<CachedTreeRoot>(value) {
            Ok(record)
                if record.version == TREE_CACHE_SCHEMA_VERSION && record.path == root_path => {}
            Ok(record) => {
                tracing::debug!(
                    target = "arbor.cache",
                    path = root_path,
                    found = record.version,
                    "dropping outdated tree root record"
                );
                self.remove_value(&key).await;
                self.record_miss();
                return None;
            }
            Err(err) => {
                self.repair(root_path, &err.to_string()).await;
                self.record_miss();
                return None;
            }
        }

        let Some(entry) = self.read_entry(root_path).await else {
            self.remove_value(&key).await;
            self.record_miss();
            return None;
        };
        self.record_hit();
        self.schedule_touch(root_path, entry.cached_at);
        Some(self.hydrate(entry).await)
    }

    pub async fn get_cached_directory(&self, path: &str) -> Option<DirectoryNode> {
        let Some(entry) = self.read_entry(path).await else {
            self.record_miss();
            return None;
        };
        self.record_hit();
        self.schedule_touch(path, entry.cached_at);
        Some(self.hydrate(entry).await)
    }

    /// One cached level of `path`: only its own entry is read, so child directories come
    /// back as unloaded placeholders.
    pub async fn get_cached_listing(&self, path: &str) -> Option<DirectoryNode> {
        let Some(entry) = self.read_entry(path).await else {
            self.record_miss();
            return None;
        };
        self.record_hit();
        self.schedule_touch(path, entry.cached_at);
        Some(entry.to_node())
    }

    /// Whether the cached listing of `path` can be trusted.
    ///
    /// Without a `current_mtime` any entry is fresh. With one, the entry must carry a recorded
    /// mtime at least as recent.
    pub async fn is_directory_fresh(&self, path: &str, current_mtime: Option<u64>) -> bool {
        let Some(entry) = self.read_entry(path).await else {
            return false;
        };
        match current_mtime {
            None => true,
            Some(current) => entry.last_modified.is_some_and(|recorded| recorded >= current),
        }
    }

    pub async fn is_stale(&self, path: &str, current_mtime: Option<u64>) -> bool {
        !self.is_directory_fresh(path, current_mtime).await
    }

    /// Drops the directory entry, its lazy continuation and any tree root record at `path`.
    async fn remove_directory(&self, path: &str) -> bool {
        let keys = &self.inner.keys;
        let mut removed = self.remove_value(&keys.dir(path)).await;
        removed &= self.remove_value(&keys.meta(path)).await;
        removed &= self.remove_value(&keys.root(path)).await;
        removed
    }

    async fn invalidate_with_ancestors(&self, path: &str) -> bool {
        let mut removed = self.remove_directory(path).await;
        for ancestor in ancestors(path) {
            removed &= self.remove_directory(ancestor).await;
        }
        tracing::debug!(target = "arbor.cache", path, "invalidated directory and ancestors");
        removed
    }

    /// Removes `path` and every cached directory below it. Ancestors are left alone.
    async fn remove_subtree(&self, path: &str) -> usize {
        let mut removed = 0;
        for cached in self.cached_directory_paths().await {
            if cached == path || is_descendant(&cached, path) {
                self.remove_directory(&cached).await;
                removed += 1;
            }
        }
        // Clears root and continuation records even when no entry is listed.
        self.remove_directory(path).await;
        removed
    }

    pub async fn invalidate_directory(&self, path: &str) {
        self.remove_directory(path).await;
        tracing::debug!(target = "arbor.cache", path, "invalidated directory");
    }

    /// Invalidates every ancestor of `path` up to the root, not `path` itself.
    pub async fn invalidate_ancestors(&self, path: &str) {
        for ancestor in ancestors(path) {
            self.remove_directory(ancestor).await;
        }
    }

    /// Invalidates `path` and all of its ancestors.
    pub async fn mark_directory_stale(&self, path: &str) {
        self.invalidate_with_ancestors(path).await;
    }

    /// Invalidates `path`, every cached directory below it and all of its ancestors.
    /// Returns the number of entries removed at or below `path`.
    pub async fn invalidate_subtree(&self, path: &str) -> usize {
        let removed = self.remove_subtree(path).await;
        self.invalidate_ancestors(path).await;
        tracing::debug!(target = "arbor.cache", path, removed, "invalidated subtree");
        removed
    }

    pub async fn invalidate_many<I, P>(&self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        for path in paths {
            self.remove_directory(path.as_ref()).await;
        }
    }

    /// Replaces the cached listing of `path` with `fresh` and refreshes the summary the
    /// parent listing keeps for it.
    pub async fn merge_directory_update(&self, path: &str, fresh: &DirectoryNode) -> Result<()> {
        if fresh.path != path {
            return Err(CacheError::PathMismatch {
                expected: path.to_string(),
                actual: fresh.path.clone(),
            });
        }
        self.write_directories(fresh, now_millis()).await?;
        self.remove_value(&self.inner.keys.meta(path)).await;
        self.patch_parent_summary(fresh).await;
        Ok(())
    }

    async fn patch_parent_summary(&self, fresh: &DirectoryNode) {
        let Some(parent) = parent_path(&fresh.path) else {
            return;
        };
        let Some(mut entry) = self.read_entry(parent).await else {
            return;
        };
        let Some(slot) = entry
            .children
            .iter_mut()
            .find(|child| child.path == fresh.path)
        else {
            return;
        };
        if slot.size == fresh.size
            && slot.last_modified == fresh.last_modified
            && slot.is_loaded == fresh.is_loaded
        {
            return;
        }
        slot.size = fresh.size;
        slot.last_modified = fresh.last_modified;
        slot.is_loaded = fresh.is_loaded;
        if let Err(err) = self.write_entry(&entry).await {
            tracing::debug!(
                target = "arbor.cache",
                path = parent,
                error = %err,
                "failed to patch parent listing"
            );
        }
    }

    /// Diffs `fresh` against the cached listing and applies the difference.
    ///
    /// An unchanged listing is not rewritten. Cached subtrees of removed child directories
    /// are invalidated.
    pub async fn perform_incremental_update(
        &self,
        path: &str,
        fresh: &DirectoryNode,
    ) -> Result<IncrementalUpdate> {
        if fresh.path != path {
            return Err(CacheError::PathMismatch {
                expected: path.to_string(),
                actual: fresh.path.clone(),
            });
        }
        let existing = self.read_entry(path).await;
        let mut update = IncrementalUpdate::default();
        let mut removed_dirs = Vec::new();
        match &existing {
            None => {
                update.added = fresh.children.iter().map(|c| c.path.clone()).collect();
            }
            Some(entry) => {
                let fresh_children: HashMap<&str, &DirectoryNode> = fresh
                    .children
                    .iter()
                    .map(|child| (child.path.as_str(), child))
                    .collect();
                let cached_paths: HashSet<&str> =
                    entry.children.iter().map(|c| c.path.as_str()).collect();
                update.added = fresh
                    .children
                    .iter()
                    .filter(|child| !cached_paths.contains(child.path.as_str()))
                    .map(|child| child.path.clone())
                    .collect();
                for cached in &entry.children {
                    match fresh_children.get(cached.path.as_str()) {
                        None => {
                            update.removed.push(cached.path.clone());
                            if cached.kind == NodeKind::Dir {
                                removed_dirs.push(cached.path.clone());
                            }
                        }
                        Some(node) if cached.differs_from(node) => {
                            update.modified.push(cached.path.clone());
                        }
                        Some(_) => {}
                    }
                }
            }
        }

        let unchanged = existing
            .as_ref()
            .is_some_and(|entry| update.is_empty() && entry.last_modified == fresh.last_modified);
        if unchanged {
            tracing::trace!(target = "arbor.cache", path, "directory unchanged");
            return Ok(update);
        }

        self.merge_directory_update(path, fresh).await?;
        for dir in &removed_dirs {
            self.remove_subtree(dir).await;
        }
        tracing::debug!(
            target = "arbor.cache",
            path,
            added = update.added.len(),
            removed = update.removed.len(),
            modified = update.modified.len(),
            "applied incremental directory update"
        );
        Ok(update)
    }

    /// Keeps at most `max_entries` directory entries, dropping the least recently cached.
    pub async fn evict_lru_entries(&self, max_entries: usize) -> usize {
        let paths = self.cached_directory_paths().await;
        if paths.len() <= max_entries {
            return 0;
        }
        let mut aged = Vec::with_capacity(paths.len());
        for path in paths {
            aged.push((self.entry_timestamp(&path).await, path));
        }
        aged.sort();

        let excess = aged.len() - max_entries;
        let mut evicted = 0;
        for (_, path) in aged.into_iter().take(excess) {
            if self.remove_directory(&path).await {
                evicted += 1;
            }
        }
        self.inner
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        tracing::debug!(target = "arbor.cache", evicted, max_entries, "evicted tree cache entries");
        evicted
    }

    /// Drops directory entries cached longer than `max_age` ago, plus orphaned continuations.
    pub async fn cleanup_expired_entries(&self, max_age: Duration) -> usize {
        let keys = self.list_keys().await;
        let tree_keys = &self.inner.keys;
        let now = now_millis();
        let max_age_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        let mut removed = 0;
        for key in &keys {
            if let Some(path) = tree_keys.dir_path(key) {
                let age = now.saturating_sub(self.entry_timestamp(path).await);
                if age > max_age_ms && self.remove_directory(path).await {
                    removed += 1;
                }
            } else if let Some(path) = tree_keys.meta_path(key) {
                if !keys.contains(&tree_keys.dir(path)) {
                    self.remove_value(key).await;
                }
            }
        }
        if removed > 0 {
            tracing::debug!(target = "arbor.cache", removed, "removed expired tree cache entries");
        }
        removed
    }

    /// Applies the configured TTL and entry bound.
    pub async fn run_maintenance(&self) -> usize {
        let expired = self.cleanup_expired_entries(self.inner.config.ttl).await;
        let evicted = self.evict_lru_entries(self.inner.config.max_entries).await;
        expired + evicted
    }

    /// Checks every cached directory entry and repairs the corrupted ones.
    pub async fn validate_cache_integrity(&self) -> IntegrityReport {
        let mut report = IntegrityReport::default();
        for path in self.cached_directory_paths().await {
            report.checked += 1;
            let reason = match self.load_entry(&path).await {
                EntryRead::Found(_) | EntryRead::Missing => continue,
                EntryRead::Outdated { .. } => {
                    self.remove_value(&self.inner.keys.dir(&path)).await;
                    continue;
                }
                EntryRead::Corrupt(reason) => reason,
                EntryRead::Failed(err) => err.to_string(),
            };
            report.corrupted += 1;
            if self.repair(&path, &reason).await {
                report.repaired += 1;
            }
        }
        tracing::info!(
            target = "arbor.cache",
            checked = report.checked,
            corrupted = report.corrupted,
            repaired = report.repaired,
            "validated tree cache"
        );
        report
    }

    /// Returns the first `max_children` children of a cached directory and records where
    /// [`TreeCacheController::load_more_children`] should resume.
    pub async fn get_cached_directory_lazy(
        &self,
        path: &str,
        max_children: usize,
    ) -> Option<LazyDirectory> {
        let Some(entry) = self.read_entry(path).await else {
            self.record_miss();
            return None;
        };
        self.record_hit();

        let total = entry.children.len();
        let mut node = entry.to_node();
        let shown = max_children.min(total);
        node.children.truncate(shown);
        let has_more = shown < total;

        let meta_key = self.inner.keys.meta(path);
        if has_more {
            let continuation = LazyContinuation {
                path: path.to_string(),
                offset: shown,
                total,
                created_at: now_millis(),
            };
            if let Err(err) = self
                .write_continuation(&meta_key, &continuation)
                .await
            {
                tracing::debug!(
                    target = "arbor.cache",
                    path,
                    error = %err,
                    "failed to store lazy continuation"
                );
            }
        } else {
            self.remove_value(&meta_key).await;
        }

        Some(LazyDirectory {
            node,
            has_more,
            total_children: total,
        })
    }

    async fn write_continuation(&self, key: &str, continuation: &LazyContinuation) -> Result<()> {
        self.write_value(key, serde_json::to_value(continuation)?)
            .await
    }

    /// Next batch of children after a lazy read; `None` once nothing is left to resume.
    /// A `batch` of `0` uses the configured `lazy_batch_size`.
    pub async fn load_more_children(&self, path: &str, batch: usize) -> Option<Vec<DirectoryNode>> {
        let meta_key = self.inner.keys.meta(path);
        let continuation: LazyContinuation = match self.read_value(&meta_key).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(continuation) => continuation,
                Err(err) => {
                    tracing::debug!(
                        target = "arbor.cache",
                        path,
                        error = %err,
                        "dropping unreadable lazy continuation"
                    );
                    self.remove_value(&meta_key).await;
                    return None;
                }
            },
            Ok(None) => return None,
            Err(err) => {
                tracing::debug!(
                    target = "arbor.cache",
                    path,
                    error = %err,
                    "failed to read lazy continuation"
                );
                return None;
            }
        };

        let Some(entry) = self.read_entry(path).await else {
            self.remove_value(&meta_key).await;
            return None;
        };
        if entry.children.len() != continuation.total || continuation.offset > continuation.total
        {
            tracing::debug!(
                target = "arbor.cache",
                path,
                "lazy continuation no longer matches the cached listing"
            );
            self.remove_value(&meta_key).await;
            return None;
        }

        let end = continuation
            .offset
            .saturating_add(self.batch_or_default(batch))
            .min(continuation.total);
        let children = entry.children[continuation.offset..end]
            .iter()
            .map(CachedChildEntry::to_node)
            .collect();

        if end >= continuation.total {
            self.remove_value(&meta_key).await;
        } else {
            let next = LazyContinuation {
                offset: end,
                ..continuation
            };
            if let Err(err) = self.write_continuation(&meta_key, &next).await {
                tracing::debug!(
                    target = "arbor.cache",
                    path,
                    error = %err,
                    "failed to advance lazy continuation"
                );
            }
        }
        Some(children)
    }

    fn batch_or_default(&self, batch: usize) -> usize {
        match batch {
            0 => self.inner.config.lazy_batch_size.max(1),
            batch => batch,
        }
    }

    /// Removes every tree cache key from both stores.
    pub async fn clear(&self) {
        for key in self.list_keys().await {
            self.remove_value(&key).await;
        }
    }

    pub async fn stats(&self) -> TreeCacheStats {
        TreeCacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            corruptions_repaired: self.inner.corruptions_repaired.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            entries: self.cached_directory_paths().await.len(),
        }
    }
}

fn build_node(
    path: &str,
    entries: &mut HashMap<String, CachedDirectoryEntry>,
) -> Option<DirectoryNode> {
    let entry = entries.remove(path)?;
    let mut node = entry.to_node();
    for child in &mut node.children {
        if child.is_dir() {
            if let Some(hydrated) = build_node(&child.path, entries) {
                *child = hydrated;
            }
        }
    }
    Some(node)
}
