use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("tensor computation error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid hyperparameters, rejected before any data is indexed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A vector fetch returned a different number of rows than requested.
    #[error("shape mismatch: expected {expected} rows, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// Embedding width disagrees with the configured index dimension.
    #[error("dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("index corruption: {0}")]
    IndexCorruption(String),

    #[error(
        "loading vectors needs {required} bytes, over the budget of {budget}"
    )]
    MemoryBudget { required: u64, budget: u64 },

    #[error("unknown document id: {0}")]
    UnknownDocument(i64),

    #[error("no embedding available for query {0:?}")]
    UnknownQuery(String),

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}
