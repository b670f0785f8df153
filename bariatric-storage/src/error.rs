//! Storage error types.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by the keystore, the backends and the secure store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The platform keystore is locked, missing or returned garbage.
    #[error("keystore unavailable: {0}")]
    KeystoreUnavailable(String),

    /// A stored value failed authentication or could not be parsed.
    #[error("stored value corrupted: {0}")]
    Corrupted(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// A lock guarding the store was poisoned by a panicking writer.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// True when the encryption context itself cannot be obtained. The
    /// session cannot continue without it.
    pub fn is_keystore_failure(&self) -> bool {
        matches!(self, StorageError::KeystoreUnavailable(_))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}
