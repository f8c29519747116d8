//! Key-value storage backends for Arbor's caches.
//!
//! Every backend speaks the same small contract ([`StorageBackend`] for synchronous stores,
//! [`AsyncStorageBackend`] for stores that must not block the caller):
//!
//! - [`MemoryBackend`]: in-process LRU map, used as the hot tier.
//! - [`QuotaBackend`]: quota-bounded persistent store layered over a web-storage-like
//!   [`RawStore`]. Evicts oldest entries under quota pressure and retries hard quota failures.
//! - [`RedbBackend`]: embedded `redb` database, used as the cold tier.
//!
//! Values are `serde_json::Value`s. Corrupted values are never surfaced to callers: they are
//! logged, removed and reported as misses.

mod backend;
mod error;
mod memory;
mod quota;
mod raw;
mod redb_backend;

pub use backend::{AsyncStorageBackend, StorageBackend};
pub use error::{RawStoreError, Result, StorageError};
pub use memory::MemoryBackend;
pub use quota::{EntryMeta, QuotaBackend, QuotaConfig, DEFAULT_MAX_RETRIES};
pub use raw::{DirRawStore, MemoryRawStore, RawStore};
pub use redb_backend::RedbBackend;
