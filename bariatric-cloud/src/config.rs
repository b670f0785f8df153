//! Sync layer configuration.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff for transient failures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Multiplier applied to the delay after every retry.
    pub factor: u32,
    /// Retries after the initial attempt. `3` means at most four requests.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            factor: 2,
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait before retry number `retry` (zero-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let multiplier = u64::from(self.factor).saturating_pow(retry);
        Duration::from_millis(self.base_delay_ms.saturating_mul(multiplier))
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Configuration for the token manager, API client and sync engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the REST API (e.g., "https://api.bariatric.example").
    pub api_base_url: String,

    pub login_path: String,

    pub refresh_path: String,

    /// Prefix under which entity collections live: `{prefix}/{entity_type}`.
    pub entities_path: String,

    /// Dashboard patient list.
    pub patients_path: String,

    /// Prefix of per-patient weight predictions: `{prefix}/{patient_id}`.
    pub results_path: String,

    /// A token is refreshed once `now >= expires_at - refresh_skew_secs`.
    pub refresh_skew_secs: i64,

    /// Timeout for a single HTTP request and for a whole pull or push.
    pub request_timeout_secs: u64,

    pub retry: RetryPolicy,

    /// Background sync interval (seconds).
    pub poll_interval_secs: u64,

    /// Entity collections synced by the background scheduler.
    pub entity_types: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.bariatric.example".to_string(),
            login_path: "/api/auth/login".to_string(),
            refresh_path: "/api/auth/refresh-token".to_string(),
            entities_path: "/api".to_string(),
            patients_path: "/api/surveys".to_string(),
            results_path: "/api/results".to_string(),
            refresh_skew_secs: 60,
            request_timeout_secs: 30,
            retry: RetryPolicy::default(),
            poll_interval_secs: 60,
            entity_types: vec!["surveys".to_string()],
        }
    }
}

impl SyncConfig {
    /// Parses a JSON config; absent fields take their defaults.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        let config: SyncConfig =
            serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if !(self.api_base_url.starts_with("https://") || self.api_base_url.starts_with("http://")) {
            return Err(SyncError::Config(format!(
                "api_base_url must be an http(s) URL, got {:?}",
                self.api_base_url
            )));
        }
        for (name, path) in [
            ("login_path", &self.login_path),
            ("refresh_path", &self.refresh_path),
            ("patients_path", &self.patients_path),
            ("results_path", &self.results_path),
        ] {
            if !path.starts_with('/') {
                return Err(SyncError::Config(format!("{name} must start with '/'")));
            }
        }
        if !self.entities_path.is_empty() && !self.entities_path.starts_with('/') {
            return Err(SyncError::Config("entities_path must be empty or start with '/'".to_string()));
        }
        if self.refresh_skew_secs < 0 {
            return Err(SyncError::Config("refresh_skew_secs must not be negative".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(SyncError::Config("request_timeout_secs must be positive".to_string()));
        }
        if self.poll_interval_secs == 0 {
            return Err(SyncError::Config("poll_interval_secs must be positive".to_string()));
        }
        if self.retry.factor == 0 {
            return Err(SyncError::Config("retry.factor must be at least 1".to_string()));
        }
        if let Some(bad) = self
            .entity_types
            .iter()
            .find(|t| t.is_empty() || t.contains(['/', '?', '#']))
        {
            return Err(SyncError::Config(format!("invalid entity type {bad:?}")));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url.trim_end_matches('/'), path)
    }

    pub(crate) fn entity_url(&self, entity_type: &str) -> String {
        self.url(&format!("{}/{entity_type}", self.entities_path))
    }

    /// Config pointing at a local mock server.
    pub fn for_base_url(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ..Self::default()
        }
    }
}
