use thiserror::Error;

/// Errors surfaced by the task store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O, constraint violation or corruption reported by SQLite.
    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A one-shot operation's cancellation token fired before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// A row decoder could not find an expected column in the result set.
    #[error("column not found: {0}")]
    ColumnNotFound(String),

    /// Transactional work asked for a rollback.
    #[error("transaction aborted: {0}")]
    Aborted(#[from] anyhow::Error),

    #[error("worker pool is closed")]
    Closed,

    /// A live query was registered outside a Tokio runtime.
    #[error("no tokio runtime available")]
    NoRuntime,

    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StoreError::Cancelled)
    }

    /// True when SQLite stopped a statement because its interrupt handle fired.
    pub(crate) fn is_interrupt(&self) -> bool {
        matches!(
            self,
            StoreError::Storage(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::OperationInterrupted
        )
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
