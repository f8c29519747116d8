use std::sync::{Arc, OnceLock};

use arbor_cache::TreeCacheController;
use arbor_core::{DirectoryLoadResult, DirectoryNode, PrefetchTarget};
use arbor_scheduler::{
    DirectoryLoader, LoadedCallback, PrefetchCallbacks, PrefetchConfig, PrefetchQueue,
    PrefetchStatus, WeakPrefetchQueue,
};

use crate::cached::CachedDirectoryLoader;
use crate::error::{ExplorerError, Result};

/// Prefetch queue whose loads go through the tree cache.
///
/// Changed listings found by background validation go through the prefetch queue: they are
/// delivered to the same `on_directory_loaded` callback as regular prefetch results, replace
/// an older listing of the same directory that has not gone out yet, and the directories they
/// reveal are queued for prefetching (restarting a drained run).
#[derive(Debug, Clone)]
pub struct CachedPrefetchQueue {
    queue: PrefetchQueue,
    loader: CachedDirectoryLoader,
}

impl CachedPrefetchQueue {
    pub fn new(
        config: PrefetchConfig,
        source: Arc<dyn DirectoryLoader>,
        cache: TreeCacheController,
        callbacks: PrefetchCallbacks,
    ) -> Self {
        let handle: Arc<OnceLock<WeakPrefetchQueue>> = Arc::new(OnceLock::new());
        let deliver = Arc::clone(&callbacks.on_directory_loaded);
        let requeue = Arc::clone(&handle);
        let on_change: LoadedCallback = Arc::new(move |result: &DirectoryLoadResult| {
            match requeue.get().and_then(WeakPrefetchQueue::upgrade) {
                Some(queue) => queue.deliver_refreshed(result.clone()),
                None => deliver(result),
            }
        });
        let loader = CachedDirectoryLoader::with_change_callback(
            source,
            cache,
            on_change,
            config.worker_count,
        );
        let queue = PrefetchQueue::new(config, Arc::new(loader.clone()), callbacks);
        let _ = handle.set(queue.downgrade());
        Self { queue, loader }
    }

    pub fn queue(&self) -> &PrefetchQueue {
        &self.queue
    }

    pub fn loader(&self) -> &CachedDirectoryLoader {
        &self.loader
    }

    pub fn cache(&self) -> &TreeCacheController {
        self.loader.cache()
    }

    /// Returns the subtree at `target`, from the cache when possible.
    ///
    /// A cached subtree is returned as is and revalidated in the background. Otherwise the
    /// directory is loaded in the foreground and cached; `Ok(None)` means it does not exist.
    /// Unloaded directories of the result are queued for prefetching.
    pub async fn request_subtree(&self, target: &PrefetchTarget) -> Result<Option<DirectoryNode>> {
        if let Some(node) = self.cache().get_cached_directory(&target.path).await {
            self.loader.record_hit();
            self.loader.spawn_validation(target.clone(), node.shallow());
            self.queue.seed_from_tree(&node);
            return Ok(Some(node));
        }
        let result = self
            .loader
            .load_fresh(target)
            .await
            .map_err(|source| ExplorerError::Load {
                path: target.path.clone(),
                source,
            })?;
        Ok(result.map(|result| {
            self.queue.seed_from_tree(&result.node);
            result.node
        }))
    }

    /// Opens a project root.
    ///
    /// A cached tree is returned immediately; its first level is queued so every cached
    /// directory is revalidated as the prefetcher walks it. Without a cached tree the root is
    /// loaded in the foreground and cached as a new tree.
    pub async fn open_root(&self, root: &PrefetchTarget) -> Result<DirectoryNode> {
        if let Some(tree) = self.cache().get_cached_tree(&root.path).await {
            self.loader.record_hit();
            let listing = tree.shallow();
            self.loader.spawn_validation(root.clone(), listing.clone());
            let queued = self.queue.seed_from_tree(&listing);
            tracing::debug!(
                target = "arbor.explorer",
                path = %root.path,
                queued,
                "opened root from cache"
            );
            return Ok(tree);
        }

        let loaded = self
            .loader
            .fetch(root)
            .await
            .map_err(|source| ExplorerError::Load {
                path: root.path.clone(),
                source,
            })?;
        let Some(result) = loaded else {
            return Err(ExplorerError::NotFound {
                path: root.path.clone(),
            });
        };
        if let Err(err) = self.cache().cache_tree(&result.node).await {
            tracing::warn!(
                target = "arbor.explorer",
                path = %root.path,
                error = %err,
                "failed to cache opened root"
            );
        }
        let queued = self.queue.seed_from_tree(&result.node);
        tracing::debug!(
            target = "arbor.explorer",
            path = %root.path,
            queued,
            "opened root from source"
        );
        Ok(result.node)
    }

    pub fn start(&self) -> Result<bool> {
        Ok(self.queue.start()?)
    }

    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    /// Waits for the prefetch run and every background validation to finish.
    ///
    /// Validations can queue work that restarts the run, so this returns only once neither
    /// is busy.
    pub async fn wait_settled(&self) {
        loop {
            self.queue.wait_idle().await;
            self.loader.wait_for_validations().await;
            if !self.queue.status().running && self.loader.pending_validations() == 0 {
                return;
            }
        }
    }

    /// Forgets the current source: cancels validations and resets the prefetch queue.
    pub async fn reset_for_source(&self) {
        self.loader.cancel_validations();
        self.queue.reset_for_source().await;
        self.loader.wait_for_validations().await;
    }

    pub async fn stop(&self) {
        self.queue.stop().await;
    }

    pub fn status(&self) -> PrefetchStatus {
        self.queue.status()
    }
}
