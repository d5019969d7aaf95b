//! Error types for the revkv storage engine.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// The result type used throughout revkv.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for revkv operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// An invalid argument was provided (empty key, bad options, ...).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The key to remove does not exist at the given revision.
    #[error("No such element: {0}")]
    NoSuchElement(String),

    /// A single posting does not fit even an empty partition.
    #[error(
        "Posting too large: {size} bytes does not fit the {capacity} bytes available in an empty {partition} partition"
    )]
    PostingTooLarge {
        /// Kind of partition the posting was meant for.
        partition: &'static str,
        /// Encoded size of the posting.
        size: u32,
        /// Usable bytes of an empty partition of that kind.
        capacity: u32,
    },

    /// The on-disk structures broke an invariant. The store must not be trusted further.
    #[error("Store inconsistency: {0}")]
    StoreInconsistency(String),

    /// A header checksum did not match its contents.
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// The checksum stored on disk.
        expected: u32,
        /// The checksum computed over the bytes read.
        actual: u32,
    },

    /// The store write lock was not obtained within the configured wait.
    #[error("Lock obtain timed out after {0:?}")]
    LockTimeout(Duration),

    /// No accessor became available within the configured wait.
    #[error("Accessor pool exhausted, waited {0:?}")]
    PoolExhausted(Duration),

    /// The data directory does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The data directory already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The operation is not valid in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Creates a new store inconsistency error.
    pub fn inconsistency(msg: impl Into<String>) -> Self {
        Error::StoreInconsistency(msg.into())
    }

    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Creates a new no such element error.
    pub fn no_such_element(msg: impl Into<String>) -> Self {
        Error::NoSuchElement(msg.into())
    }

    /// Creates a new invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Returns true if the caller may retry the operation as is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockTimeout(_) | Error::PoolExhausted(_))
    }

    /// Returns true if the error means the on-disk data can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::StoreInconsistency(_) | Error::ChecksumMismatch { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::inconsistency("dangling pointer");
        assert_eq!(err.to_string(), "Store inconsistency: dangling pointer");

        let err = Error::ChecksumMismatch { expected: 0x12345678, actual: 0x87654321 };
        assert!(err.to_string().contains("0x12345678"));
        assert!(err.to_string().contains("0x87654321"));

        let err = Error::PostingTooLarge { partition: "values", size: 2048, capacity: 1000 };
        assert!(err.to_string().contains("values"));
        assert!(err.to_string().contains("2048"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::LockTimeout(Duration::from_millis(10)).is_retryable());
        assert!(Error::PoolExhausted(Duration::from_millis(10)).is_retryable());
        assert!(!Error::no_such_element("k").is_retryable());

        assert!(Error::inconsistency("bad flag").is_fatal());
        assert!(Error::ChecksumMismatch { expected: 1, actual: 2 }.is_fatal());
        assert!(!Error::invalid_argument("empty key").is_fatal());
    }
}
