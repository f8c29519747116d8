use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use arbor_storage::{AsyncStorageBackend, MemoryBackend, Result, StorageBackend, StorageError};
use serde_json::Value;

/// In-memory backend whose reads and writes can be made to fail on demand.
#[derive(Debug, Default)]
pub struct FailingBackend {
    inner: MemoryBackend,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

fn injected() -> StorageError {
    StorageError::Io(std::io::Error::other("injected failure"))
}

impl FailingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of `get`/`has` calls seen, failed ones included.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of `set` calls seen, failed ones included.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Peeks at the stored value, bypassing failure injection and counters.
    pub fn peek(&self, key: &str) -> Option<Value> {
        StorageBackend::get(&self.inner, key).ok().flatten()
    }

    fn check_read(&self) -> Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(injected());
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(injected());
        }
        Ok(())
    }
}

impl StorageBackend for FailingBackend {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        self.check_read()?;
        StorageBackend::get(&self.inner, key)
    }

    fn set(&self, key: &str, value: Value) -> Result<Value> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.check_write()?;
        StorageBackend::set(&self.inner, key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.check_write()?;
        StorageBackend::remove(&self.inner, key)
    }

    fn keys(&self) -> Result<Vec<String>> {
        self.check_read()?;
        StorageBackend::keys(&self.inner)
    }

    fn clear(&self) -> Result<()> {
        self.check_write()?;
        StorageBackend::clear(&self.inner)
    }
}

#[async_trait::async_trait]
impl AsyncStorageBackend for FailingBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        StorageBackend::get(self, key)
    }

    async fn set(&self, key: &str, value: Value) -> Result<Value> {
        StorageBackend::set(self, key, value)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        StorageBackend::remove(self, key)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        StorageBackend::keys(self)
    }

    async fn clear(&self) -> Result<()> {
        StorageBackend::clear(self)
    }
}
