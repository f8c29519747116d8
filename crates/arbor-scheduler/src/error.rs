use arbor_storage::StorageError;

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("the prefetch queue can only be started inside a tokio runtime")]
    NoRuntime,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
