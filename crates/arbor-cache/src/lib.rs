//! Arbor's caches.
//!
//! - [`TierRouter`] stores per-file artifacts ([`CacheField`]s) across a hot in-memory tier, a
//!   warm quota-bounded tier and a cold durable tier. Which tier a field lives in is decided
//!   by [`TierRoutingConfig`] alone.
//! - [`TreeCacheController`] persists directory listings, one entry per directory, and
//!   re-hydrates subtrees from them. It validates every entry it reads and repairs corrupted
//!   ones instead of returning them.
//!
//! ## Key layout
//!
//! - `v1:<path>:<field>`: one cached field of a file
//! - `<prefix>:tree:root:<path>`: [`CachedTreeRoot`] marker of a cached tree
//! - `<prefix>:tree:dir:<path>`: [`CachedDirectoryEntry`]
//! - `<prefix>:tree:meta:<path>`: [`LazyContinuation`] of a partially read directory

mod entry;
mod error;
mod field;
mod key;
mod lookup;
mod tier;
mod tree;

pub use entry::{
    children_checksum, CachedChildEntry, CachedDirectoryEntry, CachedTreeRoot, IntegrityViolation,
    LazyContinuation, TREE_CACHE_SCHEMA_VERSION,
};
pub use error::{CacheError, Result};
pub use field::CacheField;
pub use key::{field_key, TreeKeys, FIELD_KEY_VERSION};
pub use lookup::Lookup;
pub use tier::{Tier, TierRouter, TierRoutingConfig, TierStats};
pub use tree::{
    IncrementalUpdate, IntegrityReport, LazyDirectory, TreeCacheConfig, TreeCacheController,
    TreeCacheStats,
};
