//! Sync layer error types.

use bariatric_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Maximum length of a response body kept in an [`SyncError::Api`].
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Errors surfaced by the token manager, API client and sync engine.
///
/// Cloneable so the outcome of a single refresh can be handed to every
/// caller that was waiting on it.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    /// The keystore is locked or corrupted, or the store itself is unusable.
    /// Fatal to the session.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// One cached entry could not be read or written. Only the entity type
    /// it belongs to is affected.
    #[error("local cache error: {0}")]
    Cache(String),

    /// No usable credentials remain; the user has to log in again.
    #[error("session expired, re-authentication required")]
    SessionExpired,

    /// The login endpoint rejected the supplied credentials.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("API error {status_code}: {body}")]
    Api { status_code: u16, body: String },

    /// The response did not match the expected schema.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("network timeout: {0}")]
    NetworkTimeout(String),

    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// The server holds a newer version of these records.
    #[error("conflict detected in {entity_type}: {}", ids.join(", "))]
    ConflictDetected { entity_type: String, ids: Vec<String> },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("sync scheduler is not running")]
    SchedulerStopped,
}

impl SyncError {
    /// Builds an [`SyncError::Api`], truncating oversized bodies.
    pub fn api(status_code: u16, body: &str) -> Self {
        SyncError::Api {
            status_code,
            body: truncate_body(body),
        }
    }

    /// Timeouts, connection failures and 5xx responses.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::NetworkTimeout(_) | SyncError::NetworkUnavailable(_) => true,
            SyncError::Api { status_code, .. } => (500..=599).contains(status_code),
            _ => false,
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, SyncError::NetworkTimeout(_) | SyncError::NetworkUnavailable(_))
    }

    /// Errors after which nothing can sync until the user logs in again.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, SyncError::SessionExpired | SyncError::StorageUnavailable(_))
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            SyncError::Api { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }
}

fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}

impl From<StorageError> for SyncError {
    fn from(e: StorageError) -> Self {
        if e.is_keystore_failure() || matches!(e, StorageError::Unavailable(_)) {
            SyncError::StorageUnavailable(e.to_string())
        } else {
            SyncError::Cache(e.to_string())
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SyncError::NetworkTimeout(e.to_string())
        } else if e.is_decode() {
            SyncError::Decode(e.to_string())
        } else {
            SyncError::NetworkUnavailable(e.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for SyncError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        SyncError::NetworkTimeout(e.to_string())
    }
}
