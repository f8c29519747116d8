// Consolidated integration test suite for cache-first loading.
mod cached_loader;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arbor_cache::{TreeCacheConfig, TreeCacheController};
use arbor_core::{DirectoryNode, PrefetchTarget};
use arbor_storage::MemoryBackend;
use arbor_test_utils::build_tree;

/// Directories: `/p`, `/p/src`, `/p/src/util`, `/p/docs`.
pub(crate) fn project() -> DirectoryNode {
    build_tree(
        "/p",
        &["README.md", "src/lib.rs", "src/util/mod.rs", "docs/guide.md"],
    )
}

pub(crate) fn memory_cache() -> TreeCacheController {
    arbor_test_utils::init_test_tracing();
    TreeCacheController::new(
        Arc::new(MemoryBackend::new()),
        None,
        TreeCacheConfig::default(),
    )
}

pub(crate) fn target(path: &str, depth: u32) -> PrefetchTarget {
    PrefetchTarget {
        path: path.to_string(),
        name: arbor_core::file_name(path).to_string(),
        depth,
        parent_path: arbor_core::parent_path(path).map(str::to_string),
    }
}

pub(crate) async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("operation did not finish in time")
}
