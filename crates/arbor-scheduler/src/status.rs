use std::sync::Arc;

use arbor_core::DirectoryLoadResult;
use serde::{Deserialize, Serialize};

/// Notable transitions of a prefetch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Milestone {
    /// Every primary target is done and buffered primary results were delivered.
    PrimaryComplete,
    /// Both queues are empty and all workers finished.
    Drained,
    /// The directory budget was reached; remaining work was dropped.
    BudgetExhausted,
    /// Restarts kept finding queued work without making progress.
    Stalled,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefetchStatus {
    pub running: bool,
    /// Targets waiting in the primary queue.
    pub pending: usize,
    /// Targets waiting in the deferred queue.
    pub deferred: usize,
    pub indexed_file_count: u64,
    pub processed_count: u64,
    pub last_duration_ms: u64,
    pub average_duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milestone: Option<Milestone>,
}

/// A failed directory load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefetchError {
    pub message: String,
    pub path: String,
}

pub type LoadedCallback = Arc<dyn Fn(&DirectoryLoadResult) + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(&PrefetchStatus) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&PrefetchError) + Send + Sync>;

/// Observers of a [`crate::PrefetchQueue`].
///
/// Callbacks run on worker tasks, outside the queue lock, and must not block.
#[derive(Clone)]
pub struct PrefetchCallbacks {
    pub on_directory_loaded: LoadedCallback,
    pub on_status: StatusCallback,
    /// Additionally invoked for results from the deferred queue.
    pub on_deferred_metadata: Option<LoadedCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl std::fmt::Debug for PrefetchCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchCallbacks")
            .field("on_deferred_metadata", &self.on_deferred_metadata.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish_non_exhaustive()
    }
}

impl PrefetchCallbacks {
    pub fn new(
        on_directory_loaded: impl Fn(&DirectoryLoadResult) + Send + Sync + 'static,
        on_status: impl Fn(&PrefetchStatus) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_directory_loaded: Arc::new(on_directory_loaded),
            on_status: Arc::new(on_status),
            on_deferred_metadata: None,
            on_error: None,
        }
    }

    pub fn noop() -> Self {
        Self::new(|_| {}, |_| {})
    }

    pub fn with_deferred_metadata(
        mut self,
        callback: impl Fn(&DirectoryLoadResult) + Send + Sync + 'static,
    ) -> Self {
        self.on_deferred_metadata = Some(Arc::new(callback));
        self
    }

    pub fn with_error(mut self, callback: impl Fn(&PrefetchError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub(crate) fn loaded(&self, result: &DirectoryLoadResult) {
        (self.on_directory_loaded)(result);
    }

    pub(crate) fn deferred(&self, result: &DirectoryLoadResult) {
        if let Some(callback) = &self.on_deferred_metadata {
            callback(result);
        }
    }

    pub(crate) fn status(&self, status: &PrefetchStatus) {
        (self.on_status)(status);
    }

    pub(crate) fn error(&self, error: &PrefetchError) {
        match &self.on_error {
            Some(callback) => callback(error),
            None => tracing::warn!(
                target = "arbor.scheduler",
                path = %error.path,
                error = %error.message,
                "directory load failed"
            ),
        }
    }
}
