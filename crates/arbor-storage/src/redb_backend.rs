use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde_json::Value;

use crate::backend::AsyncStorageBackend;
use crate::error::Result;

const ENTRIES: TableDefinition<&str, &str> = TableDefinition::new("cache_entries");

/// Cold tier backed by an embedded `redb` database.
///
/// Values are stored as JSON text. `redb` is synchronous, so every operation runs on tokio's
/// blocking pool and the async API never stalls the runtime threads.
#[derive(Clone)]
pub struct RedbBackend {
    db: Arc<Database>,
}

impl std::fmt::Debug for RedbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBackend").finish_non_exhaustive()
    }
}

impl RedbBackend {
    /// Opens (or creates) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(path)?;
        Self::from_database(db)
    }

    /// A database that lives only in memory, for tests and ephemeral sessions.
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::from_database(db)
    }

    fn from_database(db: Database) -> Result<Self> {
        // Create the table up front so read transactions never see it missing.
        let txn = db.begin_write()?;
        {
            let _table = txn.open_table(ENTRIES)?;
        }
        txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db)).await?
    }
}

fn read_text(db: &Database, key: &str) -> Result<Option<String>> {
    let txn = db.begin_read()?;
    let table = txn.open_table(ENTRIES)?;
    let value = table.get(key)?.map(|guard| guard.value().to_string());
    Ok(value)
}

fn write_text(db: &Database, key: &str, text: &str) -> Result<()> {
    let txn = db.begin_write()?;
    {
        let mut table = txn.open_table(ENTRIES)?;
        table.insert(key, text)?;
    }
    txn.commit()?;
    Ok(())
}

fn remove_key(db: &Database, key: &str) -> Result<()> {
    let txn = db.begin_write()?;
    {
        let mut table = txn.open_table(ENTRIES)?;
        table.remove(key)?;
    }
    txn.commit()?;
    Ok(())
}

fn list_keys(db: &Database) -> Result<Vec<String>> {
    let txn = db.begin_read()?;
    let table = txn.open_table(ENTRIES)?;
    let mut keys = Vec::new();
    for item in table.iter()? {
        let (key, _value) = item?;
        keys.push(key.value().to_string());
    }
    Ok(keys)
}

#[async_trait::async_trait]
impl AsyncStorageBackend for RedbBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let owned = key.to_string();
        let text = self.blocking(move |db| read_text(db, &owned)).await?;
        let Some(text) = text else {
            return Ok(None);
        };
        match serde_json::from_str(&text) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                tracing::warn!(
                    target = "arbor.storage",
                    key,
                    error = %err,
                    "removing corrupted database entry"
                );
                let owned = key.to_string();
                if let Err(err) = self.blocking(move |db| remove_key(db, &owned)).await {
                    tracing::debug!(
                        target = "arbor.storage",
                        key,
                        error = %err,
                        "failed to remove corrupted database entry"
                    );
                }
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<Value> {
        let text = serde_json::to_string(&value)?;
        let owned = key.to_string();
        self.blocking(move |db| write_text(db, &owned, &text))
            .await?;
        Ok(value)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let owned = key.to_string();
        self.blocking(move |db| remove_key(db, &owned)).await
    }

    async fn has(&self, key: &str) -> Result<bool> {
        let owned = key.to_string();
        let text = self.blocking(move |db| read_text(db, &owned)).await?;
        Ok(text.is_some())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.blocking(list_keys).await
    }

    async fn clear(&self) -> Result<()> {
        self.blocking(|db| {
            let keys = list_keys(db)?;
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(ENTRIES)?;
                for key in &keys {
                    table.remove(key.as_str())?;
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn estimate_size(&self) -> Option<u64> {
        let result = self
            .blocking(|db| {
                let txn = db.begin_read()?;
                let table = txn.open_table(ENTRIES)?;
                let mut bytes = 0u64;
                for item in table.iter()? {
                    let (key, value) = item?;
                    bytes += (key.value().len() + value.value().len()) as u64;
                }
                Ok(bytes)
            })
            .await;
        result.ok()
    }
}
