pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors produced by storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage quota exceeded while writing {key} (gave up after {attempts} attempts)")]
    QuotaExceeded { key: String, attempts: u32 },

    #[error("key {key} is reserved for internal bookkeeping")]
    ReservedKey { key: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {message}")]
    Database { message: String },

    #[error("background storage task failed: {message}")]
    Task { message: String },
}

impl StorageError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, StorageError::QuotaExceeded { .. })
    }
}

macro_rules! database_error_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for StorageError {
                fn from(err: $ty) -> Self {
                    StorageError::Database {
                        message: err.to_string(),
                    }
                }
            }
        )*
    };
}

database_error_from!(
    redb::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

impl From<tokio::task::JoinError> for StorageError {
    fn from(err: tokio::task::JoinError) -> Self {
        StorageError::Task {
            message: err.to_string(),
        }
    }
}

/// Failure reported by a [`crate::RawStore`] write.
#[derive(Debug, thiserror::Error)]
pub enum RawStoreError {
    /// The underlying store refused the write because it is full.
    #[error("raw store quota exceeded")]
    QuotaExceeded,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
