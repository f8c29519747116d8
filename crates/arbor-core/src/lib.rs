//! Core shared types for Arbor.
//!
//! This crate is intentionally small: it holds the directory-tree data model shared by the
//! cache, the prefetch scheduler and the explorer glue, plus a handful of path helpers.
//!
//! Paths are `/`-separated strings as handed to us by the file explorer front-end; they are
//! never resolved against the local filesystem here.

mod node;
mod path;
mod target;
mod time;

pub use node::{DirectoryNode, NodeKind};
pub use path::{
    ancestors, file_name, is_descendant, join_path, normalize_path, parent_path, path_segments,
    Ancestors,
};
pub use target::{
    extract_pending_targets, DirectoryLoadResult, PathIndexEntry, PendingTargets, PrefetchTarget,
};
pub use time::now_millis;
