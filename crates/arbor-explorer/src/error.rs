use arbor_scheduler::SchedulerError;

pub type Result<T> = std::result::Result<T, ExplorerError>;

#[derive(Debug, thiserror::Error)]
pub enum ExplorerError {
    #[error("failed to load {path}: {source:#}")]
    Load {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("directory {path} does not exist")]
    NotFound { path: String },

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}
