//! Background prefetching of directory trees.
//!
//! [`PrefetchQueue`] walks a tree by repeatedly calling a [`DirectoryLoader`] on a bounded
//! pool of tokio tasks. It keeps two priority classes (primary work first, deferred
//! segments such as `node_modules` after), enforces a directory budget, reports progress
//! through [`PrefetchCallbacks`] and can persist its progress as a [`PrefetchSnapshot`].

mod config;
mod error;
mod loader;
mod queue;
mod snapshot;
mod state;
mod status;

pub use config::{PrefetchConfig, DEFAULT_DEFERRED_SEGMENTS, DEFAULT_MAX_STALL_RESTARTS};
pub use error::{Result, SchedulerError};
pub use loader::DirectoryLoader;
pub use queue::{PrefetchQueue, WeakPrefetchQueue};
pub use snapshot::{
    shape_fingerprint, PrefetchSnapshot, SnapshotRejection, MAX_AVERAGE_FILES_PER_DIR,
};
pub use status::{
    ErrorCallback, LoadedCallback, Milestone, PrefetchCallbacks, PrefetchError, PrefetchStatus,
    StatusCallback,
};
