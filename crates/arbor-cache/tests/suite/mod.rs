// Consolidated integration test suite for the tiered and tree caches.
mod tier_router;
mod tree_cache;

use std::sync::Arc;

use arbor_cache::{CachedDirectoryEntry, TreeCacheConfig, TreeCacheController};
use arbor_core::DirectoryNode;
use arbor_storage::{MemoryBackend, StorageBackend};
use arbor_test_utils::build_tree;

/// Directories: `/p`, `/p/src`, `/p/src/util`, `/p/docs`.
pub(crate) fn project() -> DirectoryNode {
    build_tree(
        "/p",
        &["README.md", "src/lib.rs", "src/util/mod.rs", "docs/guide.md"],
    )
}

pub(crate) fn memory_cache() -> (TreeCacheController, Arc<MemoryBackend>) {
    arbor_test_utils::init_test_tracing();
    let store = Arc::new(MemoryBackend::new());
    let cache = TreeCacheController::new(store.clone(), None, TreeCacheConfig::default());
    (cache, store)
}

pub(crate) fn stored_entry(
    cache: &TreeCacheController,
    store: &MemoryBackend,
    path: &str,
) -> Option<CachedDirectoryEntry> {
    let value = StorageBackend::get(store, &cache.keys().dir(path)).unwrap()?;
    Some(serde_json::from_value(value).unwrap())
}

pub(crate) fn put_entry(
    cache: &TreeCacheController,
    store: &MemoryBackend,
    entry: &CachedDirectoryEntry,
) {
    StorageBackend::set(
        store,
        &cache.keys().dir(&entry.path),
        serde_json::to_value(entry).unwrap(),
    )
    .unwrap();
}
