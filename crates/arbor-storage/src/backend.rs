use serde_json::Value;

use crate::error::Result;

/// Synchronous key-value store.
///
/// `set` returns the stored value so callers can chain writes the same way they would with
/// the asynchronous variant.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;

    fn set(&self, key: &str, value: Value) -> Result<Value>;

    fn remove(&self, key: &str) -> Result<()>;

    fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn keys(&self) -> Result<Vec<String>>;

    fn clear(&self) -> Result<()>;

    /// Approximate number of bytes held, when the backend tracks it.
    fn estimate_size(&self) -> Option<u64> {
        None
    }
}

/// Asynchronous key-value store with the same contract as [`StorageBackend`].
#[async_trait::async_trait]
pub trait AsyncStorageBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<Value>;

    async fn remove(&self, key: &str) -> Result<()>;

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn keys(&self) -> Result<Vec<String>>;

    async fn clear(&self) -> Result<()>;

    async fn estimate_size(&self) -> Option<u64> {
        None
    }
}
