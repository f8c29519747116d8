use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arbor_cache::TreeCacheController;
use arbor_core::{DirectoryLoadResult, DirectoryNode, PrefetchTarget};
use arbor_scheduler::{DirectoryLoader, LoadedCallback};
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

/// Concurrent background validations allowed by default.
const DEFAULT_VALIDATION_LIMIT: usize = 4;

/// Whether two listings of the same directory differ in shape: a different number of
/// children, or a child name present on one side only. Size and mtime changes do not count.
pub fn structurally_changed(cached: &DirectoryNode, fresh: &DirectoryNode) -> bool {
    if cached.children.len() != fresh.children.len() {
        return true;
    }
    let names: HashSet<&str> = cached.child_names().collect();
    fresh.child_names().any(|name| !names.contains(name))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CachedLoaderStats {
    pub cache_hits: u64,
    pub foreground_loads: u64,
    pub validations: u64,
    pub changes_detected: u64,
}

#[derive(Default)]
struct Counters {
    cache_hits: AtomicU64,
    foreground_loads: AtomicU64,
    validations: AtomicU64,
    changes_detected: AtomicU64,
}

struct Inner {
    source: Arc<dyn DirectoryLoader>,
    cache: TreeCacheController,
    on_change: Option<LoadedCallback>,
    permits: Semaphore,
    in_flight: Mutex<HashSet<String>>,
    settled: Notify,
    token: Mutex<CancellationToken>,
    counters: Counters,
}

/// [`DirectoryLoader`] that answers from the tree cache and revalidates in the background.
///
/// - cache hit: the cached listing is returned without calling the wrapped loader, and a
///   validation is spawned that reloads the directory, applies the difference to the cache
///   and reports structural changes through the change callback
/// - cache miss: the wrapped loader runs in the foreground, its result is cached and its
///   errors propagate
///
/// At most one validation per path is in flight; [`CachedDirectoryLoader::wait_for_validations`]
/// resolves once all of them finished.
#[derive(Clone)]
pub struct CachedDirectoryLoader {
    inner: Arc<Inner>,
}

impl fmt::Debug for CachedDirectoryLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedDirectoryLoader")
            .field("stats", &self.stats())
            .field("pending_validations", &self.pending_validations())
            .finish_non_exhaustive()
    }
}

/// Clears the in-flight marker of a validation, even if it panicked.
struct InFlight {
    inner: Arc<Inner>,
    path: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.inner.in_flight.lock().remove(&self.path);
        self.inner.settled.notify_waiters();
    }
}

impl CachedDirectoryLoader {
    pub fn new(source: Arc<dyn DirectoryLoader>, cache: TreeCacheController) -> Self {
        Self::build(source, cache, None, DEFAULT_VALIDATION_LIMIT)
    }

    /// Like [`CachedDirectoryLoader::new`], reporting changed listings to `on_change` and
    /// running at most `validation_limit` validations at once.
    pub fn with_change_callback(
        source: Arc<dyn DirectoryLoader>,
        cache: TreeCacheController,
        on_change: LoadedCallback,
        validation_limit: usize,
    ) -> Self {
        Self::build(source, cache, Some(on_change), validation_limit)
    }

    fn build(
        source: Arc<dyn DirectoryLoader>,
        cache: TreeCacheController,
        on_change: Option<LoadedCallback>,
        validation_limit: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                cache,
                on_change,
                permits: Semaphore::new(validation_limit.max(1)),
                in_flight: Mutex::new(HashSet::new()),
                settled: Notify::new(),
                token: Mutex::new(CancellationToken::new()),
                counters: Counters::default(),
            }),
        }
    }

    pub fn cache(&self) -> &TreeCacheController {
        &self.inner.cache
    }

    pub fn stats(&self) -> CachedLoaderStats {
        let c = &self.inner.counters;
        CachedLoaderStats {
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            foreground_loads: c.foreground_loads.load(Ordering::Relaxed),
            validations: c.validations.load(Ordering::Relaxed),
            changes_detected: c.changes_detected.load(Ordering::Relaxed),
        }
    }

    pub fn pending_validations(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    /// Resolves once no validation is in flight.
    pub async fn wait_for_validations(&self) {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.in_flight.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Cancels every running validation. Later validations are unaffected.
    pub fn cancel_validations(&self) {
        let previous = std::mem::replace(&mut *self.inner.token.lock(), CancellationToken::new());
        previous.cancel();
    }

    /// Calls the wrapped loader without consulting or writing the cache.
    pub(crate) async fn fetch(
        &self,
        target: &PrefetchTarget,
    ) -> anyhow::Result<Option<DirectoryLoadResult>> {
        self.inner
            .counters
            .foreground_loads
            .fetch_add(1, Ordering::Relaxed);
        self.inner.source.load_directory(target).await
    }

    /// Foreground load whose result is written to the cache.
    pub(crate) async fn load_fresh(
        &self,
        target: &PrefetchTarget,
    ) -> anyhow::Result<Option<DirectoryLoadResult>> {
        let result = self.fetch(target).await?;
        if let Some(result) = &result {
            if let Err(err) = self.inner.cache.cache_directory(&result.node).await {
                tracing::warn!(
                    target = "arbor.explorer",
                    path = %target.path,
                    error = %err,
                    "failed to cache loaded directory"
                );
            }
        }
        Ok(result)
    }

    pub(crate) fn record_hit(&self) {
        self.inner
            .counters
            .cache_hits
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Schedules a validation of `cached` unless one is already running for the same path.
    /// Returns whether a validation was spawned.
    pub fn spawn_validation(&self, target: PrefetchTarget, cached: DirectoryNode) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(
                target = "arbor.explorer",
                path = %target.path,
                "no runtime; skipping background validation"
            );
            return false;
        };
        if !self.inner.in_flight.lock().insert(target.path.clone()) {
            return false;
        }
        let guard = InFlight {
            inner: Arc::clone(&self.inner),
            path: target.path.clone(),
        };
        let token = self.inner.token.lock().clone();
        self.inner
            .counters
            .validations
            .fetch_add(1, Ordering::Relaxed);
        let this = self.clone();
        handle.spawn(async move {
            let _guard = guard;
            this.validate(&token, &target, &cached).await;
        });
        true
    }

    async fn validate(
        &self,
        token: &CancellationToken,
        target: &PrefetchTarget,
        cached: &DirectoryNode,
    ) {
        let inner = &self.inner;
        let _permit = tokio::select! {
            permit = inner.permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = token.cancelled() => return,
        };
        let loaded = tokio::select! {
            loaded = inner.source.load_directory(target) => loaded,
            _ = token.cancelled() => return,
        };

        match loaded {
            Ok(Some(result)) => {
                if !structurally_changed(cached, &result.node) {
                    tracing::trace!(
                        target = "arbor.explorer",
                        path = %target.path,
                        "cached listing still valid"
                    );
                    return;
                }
                if token.is_cancelled() {
                    return;
                }
                match inner
                    .cache
                    .perform_incremental_update(&target.path, &result.node)
                    .await
                {
                    Ok(update) => tracing::debug!(
                        target = "arbor.explorer",
                        path = %target.path,
                        added = update.added.len(),
                        removed = update.removed.len(),
                        "cached listing changed"
                    ),
                    Err(err) => tracing::warn!(
                        target = "arbor.explorer",
                        path = %target.path,
                        error = %err,
                        "failed to apply revalidated listing"
                    ),
                }
                inner
                    .counters
                    .changes_detected
                    .fetch_add(1, Ordering::Relaxed);
                if let Some(on_change) = &inner.on_change {
                    on_change(&result);
                }
            }
            Ok(None) => {
                let removed = inner.cache.invalidate_subtree(&target.path).await;
                tracing::debug!(
                    target = "arbor.explorer",
                    path = %target.path,
                    removed,
                    "cached directory no longer exists"
                );
            }
            Err(err) => {
                let error = format!("{err:#}");
                tracing::debug!(
                    target = "arbor.explorer",
                    path = %target.path,
                    error = %error,
                    "background validation failed"
                );
            }
        }
    }
}

#[async_trait::async_trait]
impl DirectoryLoader for CachedDirectoryLoader {
    async fn load_directory(
        &self,
        target: &PrefetchTarget,
    ) -> anyhow::Result<Option<DirectoryLoadResult>> {
        // One level per load, so cached subdirectories come back as pending targets.
        if let Some(listing) = self.inner.cache.get_cached_listing(&target.path).await {
            self.record_hit();
            self.spawn_validation(target.clone(), listing.clone());
            return Ok(Some(DirectoryLoadResult::from_node(listing)));
        }
        self.load_fresh(target).await
    }
}
