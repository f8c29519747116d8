
use std::sync::Arc;
use std::time::Duration;

use arbor_core::DirectoryNode;
use arbor_scheduler::{PrefetchConfig, PrefetchQueue};
use arbor_test_utils::{build_tree, FakeLoader, FakeTree, RecordingCallbacks};

/// Directories: `/p`, `/p/src`, `/p/src/util`, `/p/docs`, `/p/node_modules`,
/// `/p/node_modules/react`. One file each, except `/p/node_modules`.
pub(crate) fn project() -> DirectoryNode {
    build_tree(
        "/p",
        &[
            "README.md",
            "src/lib.rs",
            "src/util/mod.rs",
            "docs/guide.md",
            "node_modules/react/index.js",
        ],
    )
}

pub(crate) struct Harness {
    pub(crate) fake: FakeTree,
    pub(crate) loader: Arc<FakeLoader>,
    pub(crate) recorder: RecordingCallbacks,
    pub(crate) queue: PrefetchQueue,
}

impl Harness {
    pub(crate) fn new(config: PrefetchConfig) -> Self {
        Self::with_tree(&project(), config)
    }

    pub(crate) fn with_tree(tree: &DirectoryNode, config: PrefetchConfig) -> Self {
        arbor_test_utils::init_test_tracing();
        let fake = FakeTree::from_root(tree);
        let loader = FakeLoader::new(fake.clone());
        let recorder = RecordingCallbacks::new();
        let queue = PrefetchQueue::new(config, loader.clone(), recorder.callbacks());
        Self {
            fake,
            loader,
            recorder,
            queue,
        }
    }

    /// The root as the explorer first sees it: one loaded level.
    pub(crate) fn root_listing(&self) -> DirectoryNode {
        self.fake.listing("/p").expect("root listing")
    }

    pub(crate) async fn run_to_idle(&self) {
        self.queue.start().expect("start inside a runtime");
        wait_idle(&self.queue).await;
    }
}

pub(crate) async fn wait_idle(queue: &PrefetchQueue) {
    tokio::time::timeout(Duration::from_secs(10), queue.wait_idle())
        .await
        .expect("prefetch queue did not go idle");
}
