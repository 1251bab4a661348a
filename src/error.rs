//! Error types shared across the crate.

use thiserror::Error;

/// Convenience alias used by every fallible operation in the crate.
pub type Result<T> = std::result::Result<T, AtollError>;

/// Errors surfaced across the database boundary.
#[derive(Debug, Error)]
pub enum AtollError {
    /// The transaction has already been committed or rolled back.
    #[error("tx closed")]
    TxClosed,

    /// A mutating operation was attempted on a read-only transaction.
    #[error("tx not writable")]
    TxNotWritable,

    /// A mutating operation was attempted while the same transaction is
    /// iterating.
    #[error("tx is iterating")]
    TxIterating,

    /// The requested key or index does not exist.
    #[error("not found")]
    NotFound,

    /// An index with the same name is already registered, or the reserved
    /// empty name was used.
    #[error("index exists")]
    IndexExists,

    /// The operation is not legal in this context, such as dropping the
    /// primary keys tree.
    #[error("invalid operation")]
    InvalidOperation,

    /// An unrecognized sync policy name.
    #[error("invalid sync policy")]
    InvalidSyncPolicy,

    /// A shrink is already running.
    #[error("shrink is in-progress")]
    ShrinkInProgress,

    /// The database has been closed.
    #[error("database closed")]
    DatabaseClosed,

    /// The persistence log is malformed beyond truncation recovery.
    #[error("invalid database")]
    InvalidDatabase,

    /// An I/O failure from the persistence layer.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_are_stable() {
        assert_eq!(AtollError::TxClosed.to_string(), "tx closed");
        assert_eq!(AtollError::NotFound.to_string(), "not found");
        assert_eq!(AtollError::IndexExists.to_string(), "index exists");
        assert_eq!(
            AtollError::ShrinkInProgress.to_string(),
            "shrink is in-progress"
        );
        assert_eq!(AtollError::InvalidDatabase.to_string(), "invalid database");
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::other("disk gone");
        let err: AtollError = io.into();
        assert!(matches!(err, AtollError::Io(_)));
    }
}
