use std::sync::Arc;
use std::time::Duration;

use arbor_cache::{TreeCacheConfig, TreeCacheController};
use arbor_core::DirectoryLoadResult;
use arbor_explorer::CachedDirectoryLoader;
use arbor_scheduler::{DirectoryLoader, LoadedCallback};
use arbor_storage::{MemoryBackend, StorageBackend};
use arbor_test_utils::{FakeLoader, FakeTree};
use parking_lot::Mutex;
use serde_json::json;

use super::{memory_cache, project, target, within};

struct Setup {
    loader: Arc<FakeLoader>,
    cached: CachedDirectoryLoader,
    changes: Arc<Mutex<Vec<DirectoryLoadResult>>>,
}

fn setup() -> Setup {
    let cache = memory_cache();
    let loader = FakeLoader::new(FakeTree::from_root(&project()));
    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = changes.clone();
    let on_change: LoadedCallback = Arc::new(move |result: &DirectoryLoadResult| {
        sink.lock().push(result.clone());
    });
    let cached = CachedDirectoryLoader::with_change_callback(loader.clone(), cache, on_change, 2);
    Setup {
        loader,
        cached,
        changes,
    }
}

#[tokio::test]
async fn cache_hit_is_served_without_the_source_then_revalidated() {
    let s = setup();
    let docs = FakeTree::from_root(&project()).listing("/p/docs").unwrap();
    s.cached.cache().cache_directory(&docs).await.unwrap();
    s.loader
        .update_tree(|tree| tree.add_file("/p/docs", "changelog.md", 12));

    let result = s
        .cached
        .load_directory(&target("/p/docs", 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.node.children.len(), 1);
    let stats = s.cached.stats();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.foreground_loads, 0);

    within(s.cached.wait_for_validations()).await;
    assert_eq!(s.loader.calls_for("/p/docs"), 1);

    let refreshed = s.cached.cache().get_cached_directory("/p/docs").await.unwrap();
    assert_eq!(refreshed.children.len(), 2);
    let changes = s.changes.lock();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].node.path, "/p/docs");
    assert_eq!(changes[0].file_count, 2);
    assert_eq!(s.cached.stats().changes_detected, 1);
}

#[tokio::test]
async fn unchanged_listing_is_not_reported() {
    let s = setup();
    let docs = FakeTree::from_root(&project()).listing("/p/docs").unwrap();
    s.cached.cache().cache_directory(&docs).await.unwrap();

    s.cached
        .load_directory(&target("/p/docs", 1))
        .await
        .unwrap();
    within(s.cached.wait_for_validations()).await;

    assert_eq!(s.loader.calls_for("/p/docs"), 1);
    assert!(s.changes.lock().is_empty());
    assert_eq!(s.cached.stats().validations, 1);
    assert_eq!(s.cached.stats().changes_detected, 0);
}

#[tokio::test]
async fn cached_subdirectories_come_back_as_pending_targets() {
    let s = setup();
    s.cached.cache().cache_tree(&project()).await.unwrap();

    let result = s
        .cached
        .load_directory(&target("/p/src", 1))
        .await
        .unwrap()
        .unwrap();
    let pending: Vec<&str> = result
        .pending_targets
        .iter()
        .map(|target| target.path.as_str())
        .collect();
    assert_eq!(pending, ["/p/src/util"]);
    assert!(!result.node.find("/p/src/util").unwrap().is_loaded);
    within(s.cached.wait_for_validations()).await;
}

#[tokio::test]
async fn cache_hit_reads_only_the_requested_entry() {
    let store = Arc::new(MemoryBackend::new());
    let cache = TreeCacheController::new(store.clone(), None, TreeCacheConfig::default());
    cache.cache_tree(&project()).await.unwrap();
    // Reading the subdirectory entry would repair it.
    let key = cache.keys().dir("/p/src/util");
    let mut value = StorageBackend::get(store.as_ref(), &key).unwrap().unwrap();
    value["childCount"] = json!(9);
    StorageBackend::set(store.as_ref(), &key, value).unwrap();

    let loader = FakeLoader::new(FakeTree::from_root(&project()));
    let cached = CachedDirectoryLoader::new(loader.clone(), cache.clone());
    let result = cached
        .load_directory(&target("/p/src", 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.node.children.len(), 2);
    assert_eq!(result.pending_targets.len(), 1);
    assert_eq!(cached.stats().cache_hits, 1);
    within(cached.wait_for_validations()).await;

    assert_eq!(loader.calls(), ["/p/src"]);
    assert_eq!(cache.stats().await.corruptions_repaired, 0);
    assert!(StorageBackend::get(store.as_ref(), &key).unwrap().is_some());
}

#[tokio::test]
async fn miss_loads_in_the_foreground_and_caches() {
    let s = setup();
    let result = s
        .cached
        .load_directory(&target("/p/src", 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.file_count, 1);
    assert_eq!(s.loader.calls(), ["/p/src"]);
    assert_eq!(s.cached.stats().foreground_loads, 1);
    assert_eq!(s.cached.pending_validations(), 0);
    assert!(s.cached.cache().get_cached_directory("/p/src").await.is_some());

    // The next load is a cache hit.
    s.cached
        .load_directory(&target("/p/src", 1))
        .await
        .unwrap();
    assert_eq!(s.cached.stats().cache_hits, 1);
    within(s.cached.wait_for_validations()).await;
}

#[tokio::test]
async fn foreground_errors_propagate() {
    let s = setup();
    s.loader.fail_path("/p/docs");
    let err = s
        .cached
        .load_directory(&target("/p/docs", 1))
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("permission denied"));
    assert!(s.cached.cache().get_cached_directory("/p/docs").await.is_none());

    assert!(s
        .cached
        .load_directory(&target("/p/nowhere", 1))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn validations_are_deduplicated_per_path() {
    let s = setup();
    s.cached.cache().cache_tree(&project()).await.unwrap();
    s.loader.delay_path("/p/docs", Duration::from_millis(50));

    for _ in 0..3 {
        s.cached
            .load_directory(&target("/p/docs", 1))
            .await
            .unwrap();
    }
    assert_eq!(s.cached.pending_validations(), 1);
    within(s.cached.wait_for_validations()).await;

    assert_eq!(s.loader.calls_for("/p/docs"), 1);
    assert_eq!(s.cached.stats().validations, 1);
    assert_eq!(s.cached.stats().cache_hits, 3);
}

#[tokio::test]
async fn vanished_directory_is_dropped_from_the_cache() {
    let s = setup();
    s.cached.cache().cache_tree(&project()).await.unwrap();
    s.loader.update_tree(|tree| tree.remove("/p/src"));

    s.cached
        .load_directory(&target("/p/src", 1))
        .await
        .unwrap();
    within(s.cached.wait_for_validations()).await;

    let cache = s.cached.cache();
    assert!(cache.get_cached_directory("/p/src").await.is_none());
    assert!(cache.get_cached_directory("/p/src/util").await.is_none());
    assert!(cache.get_cached_directory("/p/docs").await.is_some());
}

#[tokio::test]
async fn cancelled_validation_reports_nothing() {
    let s = setup();
    s.cached.cache().cache_tree(&project()).await.unwrap();
    s.loader.update_tree(|tree| tree.add_file("/p/docs", "late.md", 1));
    s.loader.delay_path("/p/docs", Duration::from_millis(300));

    s.cached
        .load_directory(&target("/p/docs", 1))
        .await
        .unwrap();
    tokio::task::yield_now().await;
    s.cached.cancel_validations();
    within(s.cached.wait_for_validations()).await;

    assert!(s.changes.lock().is_empty());
    let docs = s.cached.cache().get_cached_directory("/p/docs").await.unwrap();
    assert_eq!(docs.children.len(), 1);
}
