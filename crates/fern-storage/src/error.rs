#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("row not found: {0}")]
    NotFound(String),
}
