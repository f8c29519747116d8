use std::collections::BTreeSet;
use std::time::Duration;

use arbor_core::path_segments;

/// Consecutive no-progress restarts after which the queue reports itself stalled.
pub const DEFAULT_MAX_STALL_RESTARTS: u32 = 3;

/// Path segments whose subtrees are prefetched only after everything else.
pub const DEFAULT_DEFERRED_SEGMENTS: &[&str] = &[
    "node_modules",
    ".git",
    "target",
    "dist",
    "build",
    ".venv",
    "__pycache__",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchConfig {
    pub worker_count: usize,
    /// Targets deeper than this are dropped at enqueue time.
    pub max_depth: u32,
    /// Budget on directories prefetched per session and on the loaded-path set.
    pub max_prefetched_dirs: usize,
    /// Emit a status every this many processed directories (`0` disables periodic status).
    pub status_interval: u64,
    /// Each worker pauses for `batch_delay` after this many completed jobs.
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub deferred_segments: BTreeSet<String>,
    pub max_stall_restarts: u32,
    /// Namespace of the persisted session snapshot (`<prefix>:prefetch:session`).
    pub key_prefix: String,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_depth: 32,
            max_prefetched_dirs: 20_000,
            status_interval: 25,
            batch_size: 16,
            batch_delay: Duration::from_millis(5),
            deferred_segments: DEFAULT_DEFERRED_SEGMENTS
                .iter()
                .map(|segment| segment.to_string())
                .collect(),
            max_stall_restarts: DEFAULT_MAX_STALL_RESTARTS,
            key_prefix: "arbor".to_string(),
        }
    }
}

impl PrefetchConfig {
    pub fn snapshot_key(&self) -> String {
        format!("{}:prefetch:session", self.key_prefix)
    }

    /// Whether `path` belongs to the deferred queue.
    pub fn is_deferred(&self, path: &str) -> bool {
        path_segments(path).any(|segment| self.deferred_segments.contains(segment))
    }

    pub(crate) fn workers(&self) -> usize {
        self.worker_count.max(1)
    }
}
