//! Shared types for the session and sync layers.

use crate::error::SyncError;
use crate::models::User;
use bariatric_storage::RemoteRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// JWT pair issued by the auth endpoints.
///
/// Only [`crate::TokenManager`] holds these. They are wiped from memory when
/// dropped and are never handed to UI collaborators.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    #[zeroize(skip)]
    pub expires_at: DateTime<Utc>,
}

impl Credentials {
    /// True once `now` is within `skew_secs` of the expiry time.
    pub fn expires_within(&self, now: DateTime<Utc>, skew_secs: i64) -> bool {
        now >= self.expires_at - chrono::Duration::seconds(skew_secs)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Authentication state of the single session in this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    Refreshing,
    Expired,
}

impl SessionState {
    /// Whether credentials exist for this state.
    pub fn has_credentials(self) -> bool {
        matches!(self, SessionState::Authenticated | SessionState::Refreshing)
    }
}

/// Emitted whenever cached records change or a conflict is detected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub entity_type: String,
    pub ids: Vec<String>,
    pub conflict: bool,
}

// ── Wire types ──

/// Body returned by the login and refresh endpoints.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Lifetime of the access token in seconds.
    pub expires_in: i64,
    #[serde(default)]
    pub user: Option<User>,
}

#[derive(Serialize)]
pub(crate) struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// One page of remote changes for an entity type.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullPage {
    pub records: Vec<RemoteRecord<Value>>,
    /// Server clock at the time the page was produced. Becomes the next
    /// `since` value.
    pub server_time: DateTime<Utc>,
}

/// Server acknowledgement of an accepted push.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    #[serde(default)]
    pub id: String,
    pub version: u64,
}

// ── Reports ──

/// Outcome of a successful pull.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PullReport {
    pub applied: Vec<String>,
    /// Dirty records left untouched because the server also changed them.
    pub conflicts: Vec<String>,
    /// Remote copies older than the cached version.
    pub stale: Vec<String>,
    pub server_time: Option<DateTime<Utc>>,
}

/// Outcome of a push batch that was not interrupted by a network failure.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PushReport {
    pub pushed: Vec<String>,
    /// Rejected with 409; still pending.
    pub conflicts: Vec<String>,
    /// Rejected for another reason; still pending.
    pub failed: Vec<(String, SyncError)>,
}

impl PushReport {
    /// Number of PUT requests the batch issued.
    pub fn writes(&self) -> usize {
        self.pushed.len() + self.conflicts.len() + self.failed.len()
    }
}

/// Push followed by pull for one entity type.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub push: PushReport,
    pub pull: PullReport,
}
