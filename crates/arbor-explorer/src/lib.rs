//! Cache-first directory loading for the file explorer.
//!
//! [`CachedPrefetchQueue`] puts a [`arbor_cache::TreeCacheController`] in front of the
//! background prefetcher. Cached listings are served immediately; every cache hit schedules a
//! background validation against the real loader, and listings that changed structurally are
//! written back to the cache and re-delivered through `on_directory_loaded`.

mod cached;
mod error;
mod local;
mod queue;

pub use cached::{structurally_changed, CachedDirectoryLoader, CachedLoaderStats};
pub use error::{ExplorerError, Result};
pub use local::LocalDirectoryLoader;
pub use queue::CachedPrefetchQueue;
