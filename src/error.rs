use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors surfaced by the store and the queue handle.
///
/// "No eligible item" is not an error; `claim` returns `Ok(None)` for it.
/// Handler failures are plain `anyhow::Error`s and stay inside the worker.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
