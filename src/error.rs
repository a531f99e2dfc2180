//! Error types for conductor.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] redb::Error),

    #[error("invalid job record: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("store is closed")]
    Closed,

    #[error("workflow name {0:?} is reserved or empty")]
    ReservedPartition(String),

    #[error("log client error: {0}")]
    Log(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

// redb reports a distinct error type per operation; all of them collapse into
// `redb::Error` so `?` works on any storage call.
macro_rules! storage_error_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Error {
                fn from(e: $ty) -> Self {
                    Error::Storage(redb::Error::from(e))
                }
            }
        )*
    };
}

storage_error_from!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);
