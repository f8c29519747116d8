use arbor_core::{DirectoryLoadResult, PrefetchTarget};

/// Loads one directory level for the prefetcher.
///
/// `Ok(None)` means the directory no longer exists; it is not marked loaded and produces no
/// callback. Errors are reported through `on_error` and do not stop sibling jobs.
#[async_trait::async_trait]
pub trait DirectoryLoader: Send + Sync {
    async fn load_directory(
        &self,
        target: &PrefetchTarget,
    ) -> anyhow::Result<Option<DirectoryLoadResult>>;
}
