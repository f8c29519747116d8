use arbor_storage::StorageError;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by the tiered and tree caches.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{path} is not a loaded directory")]
    NotLoadedDirectory { path: String },

    #[error("update for {actual} cannot be merged into cached directory {expected}")]
    PathMismatch { expected: String, actual: String },

    #[error("unknown cache field `{0}`")]
    UnknownField(String),
}

impl CacheError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, CacheError::Storage(err) if err.is_quota_exceeded())
    }
}
