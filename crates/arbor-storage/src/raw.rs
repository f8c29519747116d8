use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::RawStoreError;

/// A web-storage-like string store: the primitive under [`crate::QuotaBackend`].
///
/// Writes fail with [`RawStoreError::QuotaExceeded`] when the store is full; quota policy
/// (eviction, retries) lives in the layer above.
pub trait RawStore: Send + Sync {
    fn get_item(&self, key: &str) -> io::Result<Option<String>>;

    fn set_item(&self, key: &str, value: &str) -> Result<(), RawStoreError>;

    fn remove_item(&self, key: &str) -> io::Result<()>;

    fn keys(&self) -> io::Result<Vec<String>>;
}

/// In-memory raw store with an optional hard byte capacity (keys + values).
#[derive(Debug, Default)]
pub struct MemoryRawStore {
    capacity: Option<u64>,
    items: Mutex<BTreeMap<String, String>>,
}

impl MemoryRawStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity_bytes: u64) -> Self {
        Self {
            capacity: Some(capacity_bytes),
            items: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn used_bytes(&self) -> u64 {
        used_bytes(&self.items.lock())
    }
}

fn used_bytes(items: &BTreeMap<String, String>) -> u64 {
    items
        .iter()
        .map(|(key, value)| (key.len() + value.len()) as u64)
        .sum()
}

impl RawStore for MemoryRawStore {
    fn get_item(&self, key: &str) -> io::Result<Option<String>> {
        Ok(self.items.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), RawStoreError> {
        let mut items = self.items.lock();
        if let Some(capacity) = self.capacity {
            let existing = items
                .get(key)
                .map_or(0, |old| (key.len() + old.len()) as u64);
            let projected = used_bytes(&items) - existing + (key.len() + value.len()) as u64;
            if projected > capacity {
                return Err(RawStoreError::QuotaExceeded);
            }
        }
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> io::Result<()> {
        self.items.lock().remove(key);
        Ok(())
    }

    fn keys(&self) -> io::Result<Vec<String>> {
        Ok(self.items.lock().keys().cloned().collect())
    }
}

/// One file per key inside a directory, with an optional hard byte capacity (keys + values,
/// counted like [`MemoryRawStore`]).
///
/// File names are the hex-encoded key, so keys round-trip through [`RawStore::keys`] without
/// an index file. Writes go through a temp file + rename.
#[derive(Debug)]
pub struct DirRawStore {
    root: PathBuf,
    capacity: Option<u64>,
    // Serializes capacity checks with the write that follows them.
    write_lock: Mutex<()>,
}

const ITEM_EXTENSION: &str = "json";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

impl DirRawStore {
    pub fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            capacity: None,
            write_lock: Mutex::new(()),
        })
    }

    pub fn with_capacity(mut self, capacity_bytes: u64) -> Self {
        self.capacity = Some(capacity_bytes);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn item_path(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}.{ITEM_EXTENSION}", hex::encode(key.as_bytes())))
    }

    /// Decoded key of an item file; `None` for temp files and foreign names.
    fn item_key(path: &Path) -> Option<String> {
        if path.extension().and_then(|ext| ext.to_str()) != Some(ITEM_EXTENSION) {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        match hex::decode(stem).map(String::from_utf8) {
            Ok(Ok(key)) => Some(key),
            _ => {
                tracing::debug!(
                    target = "arbor.storage",
                    path = %path.display(),
                    "ignoring raw store file with undecodable name"
                );
                None
            }
        }
    }

    pub fn used_bytes(&self) -> io::Result<u64> {
        let mut total = 0u64;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let Some(key) = Self::item_key(&entry.path()) else {
                continue;
            };
            total = total
                .saturating_add(key.len() as u64)
                .saturating_add(entry.metadata()?.len());
        }
        Ok(total)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let pid = std::process::id();
        let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp_path = self.root.join(format!(".tmp.{pid}.{counter}"));

        let result = (|| -> io::Result<()> {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            drop(file);
            fs::rename(&tmp_path, path)
        })();

        if let Err(err) = result {
            if let Err(remove_err) = fs::remove_file(&tmp_path) {
                if remove_err.kind() != io::ErrorKind::NotFound {
                    tracing::debug!(
                        target = "arbor.storage",
                        path = %tmp_path.display(),
                        error = %remove_err,
                        "failed to remove temporary file after write failure"
                    );
                }
            }
            return Err(err);
        }
        Ok(())
    }
}

impl RawStore for DirRawStore {
    fn get_item(&self, key: &str) -> io::Result<Option<String>> {
        match fs::read_to_string(self.item_path(key)) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), RawStoreError> {
        let _guard = self.write_lock.lock();
        let path = self.item_path(key);
        if let Some(capacity) = self.capacity {
            let existing = match fs::metadata(&path) {
                Ok(meta) => key.len() as u64 + meta.len(),
                Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
                Err(err) => return Err(err.into()),
            };
            let projected = self
                .used_bytes()?
                .saturating_sub(existing)
                .saturating_add((key.len() + value.len()) as u64);
            if projected > capacity {
                return Err(RawStoreError::QuotaExceeded);
            }
        }
        self.write_atomic(&path, value.as_bytes())?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> io::Result<()> {
        match fs::remove_file(self.item_path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn keys(&self) -> io::Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            keys.extend(Self::item_key(&entry?.path()));
        }
        keys.sort();
        Ok(keys)
    }
}
