use std::sync::Arc;
use std::time::Duration;

use arbor_cache::{
    CacheError, CachedDirectoryEntry, IncrementalUpdate, TreeCacheConfig, TreeCacheController,
};
use arbor_core::DirectoryNode;
use arbor_storage::{MemoryBackend, RedbBackend, StorageBackend};
use arbor_test_utils::{build_tree, FailingBackend};
use serde_json::json;

use super::{memory_cache, project, put_entry, stored_entry};

fn listing(path: &str, depth: u32, files: &[(&str, u64)]) -> DirectoryNode {
    let dir = DirectoryNode::dir(path, depth);
    let children = files
        .iter()
        .map(|(name, size)| dir.child_file(name, Some(*size)))
        .collect();
    dir.with_children(children)
}

#[tokio::test]
async fn cached_tree_round_trips_with_unloaded_placeholders() {
    let (cache, _store) = memory_cache();
    let mut tree = project();
    let vendor = tree.child_dir("vendor");
    tree.children.push(vendor);

    cache.cache_tree(&tree).await.unwrap();
    let restored = cache.get_cached_tree("/p").await.unwrap();
    assert_eq!(restored, tree);
    assert!(!restored.find("/p/vendor").unwrap().is_loaded);

    let stats = cache.stats().await;
    assert_eq!(stats.entries, 4);
    assert_eq!(stats.hits, 1);
}

#[tokio::test]
async fn directory_reads_hydrate_the_subtree_below() {
    let (cache, _store) = memory_cache();
    cache.cache_tree(&project()).await.unwrap();

    let src = cache.get_cached_directory("/p/src").await.unwrap();
    assert_eq!(&src, project().find("/p/src").unwrap());
    assert!(src.find("/p/src/util/mod.rs").is_some());

    assert!(cache.get_cached_directory("/p/missing").await.is_none());
    assert!(cache.get_cached_tree("/q").await.is_none());
    assert_eq!(cache.stats().await.misses, 2);
}

#[tokio::test]
async fn freshness_compares_recorded_mtime() {
    let (cache, _store) = memory_cache();
    let docs = listing("/p/docs", 1, &[("guide.md", 8)]).with_last_modified(100);
    cache.cache_directory(&docs).await.unwrap();

    assert!(cache.is_directory_fresh("/p/docs", None).await);
    assert!(cache.is_directory_fresh("/p/docs", Some(100)).await);
    assert!(cache.is_directory_fresh("/p/docs", Some(99)).await);
    assert!(cache.is_stale("/p/docs", Some(150)).await);
    assert!(cache.is_stale("/p/other", None).await);

    // No recorded mtime cannot vouch for a known one.
    cache
        .cache_directory(&listing("/p/src", 1, &[]))
        .await
        .unwrap();
    assert!(cache.is_directory_fresh("/p/src", None).await);
    assert!(cache.is_stale("/p/src", Some(1)).await);
}

#[tokio::test]
async fn stale_directory_invalidates_its_ancestors() {
    let (cache, _store) = memory_cache();
    cache.cache_tree(&project()).await.unwrap();

    cache.mark_directory_stale("/p/src/util").await;
    assert!(cache.get_cached_directory("/p/src/util").await.is_none());
    assert!(cache.get_cached_directory("/p/src").await.is_none());
    assert!(cache.get_cached_tree("/p").await.is_none());
    assert!(cache.get_cached_directory("/p/docs").await.is_some());
}

#[tokio::test]
async fn single_and_ancestor_invalidation() {
    let (cache, _store) = memory_cache();
    cache.cache_tree(&project()).await.unwrap();

    cache.invalidate_directory("/p/docs").await;
    assert!(cache.get_cached_directory("/p/docs").await.is_none());
    assert!(cache.get_cached_directory("/p/src").await.is_some());

    cache.invalidate_ancestors("/p/src/util").await;
    assert!(cache.get_cached_directory("/p/src/util").await.is_some());
    assert!(cache.get_cached_directory("/p/src").await.is_none());
    assert!(cache.get_cached_directory("/p").await.is_none());

    cache.invalidate_many(["/p/src/util"]).await;
    assert_eq!(cache.stats().await.entries, 0);
}

#[tokio::test]
async fn subtree_invalidation_spares_siblings() {
    let (cache, _store) = memory_cache();
    cache.cache_tree(&project()).await.unwrap();

    assert_eq!(cache.invalidate_subtree("/p/src").await, 2);
    assert_eq!(cache.cached_directory_paths().await, ["/p/docs"]);
}

#[tokio::test]
async fn corrupted_entry_is_repaired_not_returned() {
    let (cache, store) = memory_cache();
    cache.cache_tree(&project()).await.unwrap();

    let mut entry = stored_entry(&cache, &store, "/p/src").unwrap();
    entry.child_count += 1;
    put_entry(&cache, &store, &entry);

    assert!(cache.get_cached_directory("/p/src").await.is_none());
    assert!(stored_entry(&cache, &store, "/p/src").is_none());
    assert!(stored_entry(&cache, &store, "/p").is_none());
    assert!(stored_entry(&cache, &store, "/p/docs").is_some());
    assert!(stored_entry(&cache, &store, "/p/src/util").is_some());
    assert_eq!(cache.stats().await.corruptions_repaired, 1);
}

#[tokio::test]
async fn entry_at_maximal_depth_is_repaired() {
    let (cache, store) = memory_cache();
    cache.cache_tree(&project()).await.unwrap();

    let mut entry = stored_entry(&cache, &store, "/p/src").unwrap();
    entry.depth = u32::MAX;
    put_entry(&cache, &store, &entry);

    assert!(cache.get_cached_directory("/p/src").await.is_none());
    assert!(stored_entry(&cache, &store, "/p/src").is_none());
    assert!(stored_entry(&cache, &store, "/p").is_none());
    assert_eq!(cache.stats().await.corruptions_repaired, 1);
}

#[tokio::test]
async fn listing_reads_leave_descendant_entries_alone() {
    let (cache, store) = memory_cache();
    cache.cache_tree(&project()).await.unwrap();
    let mut util = stored_entry(&cache, &store, "/p/src/util").unwrap();
    util.child_count += 1;
    put_entry(&cache, &store, &util);

    let src = cache.get_cached_listing("/p/src").await.unwrap();
    assert!(src.is_loaded);
    assert_eq!(src.children.len(), 2);
    let child = src.find("/p/src/util").unwrap();
    assert!(!child.is_loaded);
    assert!(child.children.is_empty());

    // The corrupted child entry was never read.
    assert_eq!(cache.stats().await.corruptions_repaired, 0);
    assert!(stored_entry(&cache, &store, "/p/src/util").is_some());

    assert!(cache.get_cached_listing("/p/missing").await.is_none());
    let stats = cache.stats().await;
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn unparsable_entry_is_repaired() {
    let (cache, store) = memory_cache();
    cache.cache_tree(&project()).await.unwrap();
    StorageBackend::set(
        store.as_ref(),
        &cache.keys().dir("/p/docs"),
        json!({ "version": 1, "path": 7 }),
    )
    .unwrap();

    assert!(cache.get_cached_directory("/p/docs").await.is_none());
    assert!(cache.get_cached_tree("/p").await.is_none());
    assert_eq!(cache.stats().await.corruptions_repaired, 1);
}

#[tokio::test]
async fn entry_stored_under_the_wrong_key_is_corrupt() {
    let (cache, store) = memory_cache();
    cache.cache_tree(&project()).await.unwrap();
    let docs = stored_entry(&cache, &store, "/p/docs").unwrap();
    StorageBackend::set(
        store.as_ref(),
        &cache.keys().dir("/p/src"),
        serde_json::to_value(&docs).unwrap(),
    )
    .unwrap();

    assert!(cache.get_cached_directory("/p/src").await.is_none());
    assert_eq!(cache.stats().await.corruptions_repaired, 1);
}

#[tokio::test]
async fn integrity_sweep_repairs_corrupted_entries() {
    let (cache, store) = memory_cache();
    cache.cache_tree(&project()).await.unwrap();
    let mut docs = stored_entry(&cache, &store, "/p/docs").unwrap();
    docs.children[0].path = "/p/docs/other.md".to_string();
    put_entry(&cache, &store, &docs);

    let report = cache.validate_cache_integrity().await;
    assert_eq!(report.checked, 4);
    assert_eq!(report.corrupted, 1);
    assert_eq!(report.repaired, 1);
    assert_eq!(
        cache.cached_directory_paths().await,
        ["/p/src", "/p/src/util"]
    );

    let clean = cache.validate_cache_integrity().await;
    assert_eq!(clean.corrupted, 0);
}

#[tokio::test]
async fn read_failure_counts_as_corruption() {
    let store = Arc::new(FailingBackend::new());
    let cache = TreeCacheController::new(store.clone(), None, TreeCacheConfig::default());
    cache.cache_tree(&project()).await.unwrap();

    store.set_fail_reads(true);
    assert!(cache.get_cached_directory("/p/src").await.is_none());
    store.set_fail_reads(false);

    assert!(cache.get_cached_directory("/p/src").await.is_none());
    assert!(cache.get_cached_directory("/p/docs").await.is_some());
    assert_eq!(cache.stats().await.corruptions_repaired, 1);
}

#[tokio::test]
async fn lru_eviction_drops_the_oldest_entries() {
    let (cache, _store) = memory_cache();
    for name in ["a", "b", "c", "d"] {
        cache
            .cache_directory(&listing(&format!("/p/{name}"), 1, &[]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(cache.evict_lru_entries(10).await, 0);
    assert_eq!(cache.evict_lru_entries(2).await, 2);
    assert_eq!(cache.cached_directory_paths().await, ["/p/c", "/p/d"]);
    assert_eq!(cache.stats().await.evictions, 2);
}

#[tokio::test]
async fn maintenance_enforces_the_entry_bound() {
    let store = Arc::new(MemoryBackend::new());
    let cache = TreeCacheController::new(
        store,
        None,
        TreeCacheConfig {
            max_entries: 3,
            ..TreeCacheConfig::default()
        },
    );
    let tree = build_tree("/p", &["a/", "b/", "c/", "d/", "e/"]);
    cache.cache_tree(&tree).await.unwrap();

    assert_eq!(cache.run_maintenance().await, 3);
    assert_eq!(cache.stats().await.entries, 3);
}

#[tokio::test]
async fn expired_entries_and_orphaned_continuations_are_cleaned_up() {
    let (cache, store) = memory_cache();
    cache
        .cache_directory(&listing("/p/old", 1, &[]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    let big: Vec<(String, u64)> = (0..4).map(|i| (format!("f{i}"), i)).collect();
    let big: Vec<(&str, u64)> = big.iter().map(|(name, size)| (name.as_str(), *size)).collect();
    cache
        .cache_directory(&listing("/p/new", 1, &big))
        .await
        .unwrap();
    cache.get_cached_directory_lazy("/p/new", 1).await.unwrap();
    let meta_key = cache.keys().meta("/p/new");
    assert!(StorageBackend::has(store.as_ref(), &meta_key).unwrap());

    assert_eq!(
        cache
            .cleanup_expired_entries(Duration::from_millis(40))
            .await,
        1
    );
    assert_eq!(cache.cached_directory_paths().await, ["/p/new"]);

    // A continuation whose listing vanished is dropped too.
    StorageBackend::remove(store.as_ref(), &cache.keys().dir("/p/new")).unwrap();
    cache
        .cleanup_expired_entries(Duration::from_secs(3600))
        .await;
    assert!(!StorageBackend::has(store.as_ref(), &meta_key).unwrap());
}

#[tokio::test]
async fn lazy_reads_page_through_large_directories() {
    let (cache, _store) = memory_cache();
    let files: Vec<(String, u64)> = (0..5).map(|i| (format!("file{i}.txt"), i)).collect();
    let files: Vec<(&str, u64)> = files.iter().map(|(n, s)| (n.as_str(), *s)).collect();
    cache
        .cache_directory(&listing("/p/big", 1, &files))
        .await
        .unwrap();

    let first = cache.get_cached_directory_lazy("/p/big", 2).await.unwrap();
    assert!(first.has_more);
    assert_eq!(first.total_children, 5);
    assert_eq!(
        first.node.child_names().collect::<Vec<_>>(),
        ["file0.txt", "file1.txt"]
    );

    let second = cache.load_more_children("/p/big", 2).await.unwrap();
    assert_eq!(second[0].name, "file2.txt");
    assert_eq!(second.len(), 2);
    let last = cache.load_more_children("/p/big", 2).await.unwrap();
    assert_eq!(last.len(), 1);
    assert!(cache.load_more_children("/p/big", 2).await.is_none());

    cache.get_cached_directory_lazy("/p/big", 1).await.unwrap();
    // Zero falls back to the configured page size, which covers the rest.
    let rest = cache.load_more_children("/p/big", 0).await.unwrap();
    assert_eq!(rest.len(), 4);

    let whole = cache.get_cached_directory_lazy("/p/big", 10).await.unwrap();
    assert!(!whole.has_more);
    assert!(cache.load_more_children("/p/big", 2).await.is_none());
}

#[tokio::test]
async fn continuation_is_dropped_when_the_listing_changes() {
    let (cache, _store) = memory_cache();
    cache
        .cache_directory(&listing("/p/big", 1, &[("a", 1), ("b", 1), ("c", 1)]))
        .await
        .unwrap();
    cache.get_cached_directory_lazy("/p/big", 1).await.unwrap();

    cache
        .cache_directory(&listing("/p/big", 1, &[("a", 1)]))
        .await
        .unwrap();
    assert!(cache.load_more_children("/p/big", 5).await.is_none());
}

#[tokio::test]
async fn incremental_update_reports_and_applies_the_diff() {
    let (cache, store) = memory_cache();
    cache.cache_tree(&project()).await.unwrap();

    let fresh = listing("/p/src", 1, &[("lib.rs", 99), ("main.rs", 7)]).with_last_modified(500);
    let update = cache
        .perform_incremental_update("/p/src", &fresh)
        .await
        .unwrap();
    assert_eq!(
        update,
        IncrementalUpdate {
            added: vec!["/p/src/main.rs".to_string()],
            removed: vec!["/p/src/util".to_string()],
            modified: vec!["/p/src/lib.rs".to_string()],
        }
    );

    assert!(stored_entry(&cache, &store, "/p/src/util").is_none());
    assert_eq!(cache.get_cached_directory("/p/src").await.unwrap(), fresh);
    let root = stored_entry(&cache, &store, "/p").unwrap();
    let src_summary = root
        .children
        .iter()
        .find(|child| child.path == "/p/src")
        .unwrap();
    assert_eq!(src_summary.last_modified, Some(500));
    root.validate().unwrap();

    // Same listing again: nothing to do.
    let again = cache
        .perform_incremental_update("/p/src", &fresh)
        .await
        .unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn incremental_update_of_an_uncached_directory_adds_everything() {
    let (cache, _store) = memory_cache();
    let fresh = listing("/p/new", 1, &[("x", 1), ("y", 2)]);
    let update = cache
        .perform_incremental_update("/p/new", &fresh)
        .await
        .unwrap();
    assert_eq!(update.added.len(), 2);
    assert!(cache.get_cached_directory("/p/new").await.is_some());

    let err = cache
        .perform_incremental_update("/p/other", &fresh)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::PathMismatch { .. }));
}

#[tokio::test]
async fn durable_store_backfills_the_sync_store() {
    let durable = Arc::new(RedbBackend::in_memory().unwrap());
    let first = TreeCacheController::new(
        Arc::new(MemoryBackend::new()),
        Some(durable.clone()),
        TreeCacheConfig::default(),
    );
    first.cache_tree(&project()).await.unwrap();

    let sync = Arc::new(MemoryBackend::new());
    let second = TreeCacheController::new(sync.clone(), Some(durable), TreeCacheConfig::default());
    assert_eq!(second.get_cached_tree("/p").await.unwrap(), project());
    assert!(StorageBackend::has(sync.as_ref(), &second.keys().dir("/p/src")).unwrap());
}

#[tokio::test]
async fn clear_leaves_foreign_keys_alone() {
    let (cache, store) = memory_cache();
    cache.cache_tree(&project()).await.unwrap();
    StorageBackend::set(store.as_ref(), "v1:/p/README.md:stats", json!(1)).unwrap();

    let other = TreeCacheController::new(
        store.clone(),
        None,
        TreeCacheConfig {
            key_prefix: "other".to_string(),
            ..TreeCacheConfig::default()
        },
    );
    assert!(other.get_cached_tree("/p").await.is_none());
    other.cache_tree(&project()).await.unwrap();

    cache.clear().await;
    assert_eq!(cache.stats().await.entries, 0);
    assert!(StorageBackend::has(store.as_ref(), "v1:/p/README.md:stats").unwrap());
    assert_eq!(other.stats().await.entries, 4);
}

#[tokio::test]
async fn entries_carry_a_children_checksum() {
    let (cache, store) = memory_cache();
    cache.cache_tree(&project()).await.unwrap();
    let entry: CachedDirectoryEntry = stored_entry(&cache, &store, "/p").unwrap();
    assert_eq!(entry.child_count, 3);
    assert_eq!(
        entry.checksum.as_deref(),
        Some(arbor_cache::children_checksum(&entry.children).as_str())
    );
}
