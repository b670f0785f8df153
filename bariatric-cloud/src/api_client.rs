//! HTTP client for the bariatric REST API.
//!
//! Every request carries a bearer token from the [`TokenManager`]. Transient
//! failures (timeouts, connection errors, 5xx) are retried with exponential
//! backoff. A 401 forces one token refresh and one replay; a second 401 ends
//! the session. Other non-2xx responses surface as [`SyncError::Api`].

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::{Patient, Prediction};
use crate::token_manager::TokenManager;
use crate::types::{PullPage, PushAck};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, IF_MATCH};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Builds the shared reqwest client: JSON `Accept` header and the configured
/// per-request timeout.
pub(crate) fn build_http_client(config: &SyncConfig) -> SyncResult<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    Client::builder()
        .timeout(config.request_timeout())
        .default_headers(headers)
        .build()
        .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {e}")))
}

/// Reads the whole body and decodes it as `T`.
pub(crate) async fn read_json<T: DeserializeOwned>(resp: Response) -> SyncResult<T> {
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| SyncError::Decode(e.to_string()))
}

/// Authenticated, retrying REST client.
pub struct ApiClient {
    http: Client,
    config: SyncConfig,
    tokens: Arc<TokenManager>,
}

impl ApiClient {
    /// Shares the token manager's HTTP client and configuration.
    pub fn new(tokens: Arc<TokenManager>) -> Self {
        Self {
            http: tokens.http().clone(),
            config: tokens.config().clone(),
            tokens,
        }
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // ── Endpoints ──

    /// GET `path` and decode the body.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> SyncResult<T> {
        let url = self.config.url(path);
        let resp = self.execute(Method::GET, &url, |req| req).await?;
        read_json(resp).await
    }

    /// Patients shown on the clinician dashboard.
    pub async fn fetch_patients(&self) -> SyncResult<Vec<Patient>> {
        self.get_json(&self.config.patients_path).await
    }

    /// Weight prediction for a patient.
    pub async fn fetch_prediction(&self, patient_id: &str) -> SyncResult<Prediction> {
        let path = format!("{}/{patient_id}", self.config.results_path.trim_end_matches('/'));
        self.get_json(&path).await
    }

    /// Records of `entity_type` changed after `since`, or all of them on
    /// first sync.
    pub async fn fetch_page(&self, entity_type: &str, since: Option<DateTime<Utc>>) -> SyncResult<PullPage> {
        let url = self.config.entity_url(entity_type);
        let since = since.map(|ts| ts.to_rfc3339_opts(SecondsFormat::AutoSi, true));

        let resp = self
            .execute(Method::GET, &url, |req| match &since {
                Some(ts) => req.query(&[("since", ts)]),
                None => req,
            })
            .await?;
        read_json(resp).await
    }

    /// Uploads a record based on server `version`. A 409 surfaces as
    /// [`SyncError::ConflictDetected`].
    pub async fn push_record(
        &self,
        entity_type: &str,
        id: &str,
        version: u64,
        payload: &Value,
    ) -> SyncResult<PushAck> {
        let url = format!("{}/{id}", self.config.entity_url(entity_type));
        let if_match = version.to_string();

        let resp = self
            .execute(Method::PUT, &url, |req| req.header(IF_MATCH, &if_match).json(payload))
            .await;
        match resp {
            Ok(resp) => read_json(resp).await,
            Err(SyncError::Api { status_code: 409, .. }) => {
                debug!(entity_type, id, version, "push rejected with version conflict");
                Err(SyncError::ConflictDetected {
                    entity_type: entity_type.to_string(),
                    ids: vec![id.to_string()],
                })
            }
            Err(e) => Err(e),
        }
    }

    // ── Transport ──

    /// Sends a request with backoff for transient failures.
    ///
    /// `build` is invoked again for every replay, so request bodies are
    /// rebuilt rather than cloned.
    async fn execute<F>(&self, method: Method, url: &str, build: F) -> SyncResult<Response>
    where
        F: Fn(RequestBuilder) -> RequestBuilder + Send + Sync,
    {
        let policy = &self.config.retry;
        let mut refreshed = false;
        let mut retry = 0;

        loop {
            match self.send_authorized(&method, url, &build, &mut refreshed).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() && retry < policy.max_retries => {
                    let delay = policy.delay_for(retry);
                    retry += 1;
                    warn!(
                        %method,
                        url,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One attempt, including the single refresh-and-replay on 401.
    async fn send_authorized<F>(
        &self,
        method: &Method,
        url: &str,
        build: &F,
        refreshed: &mut bool,
    ) -> SyncResult<Response>
    where
        F: Fn(RequestBuilder) -> RequestBuilder + Send + Sync,
    {
        let token = self.tokens.get_valid_access_token().await?;
        let mut resp = build(self.http.request(method.clone(), url))
            .bearer_auth(&token)
            .send()
            .await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            if *refreshed {
                return Err(self.reject_session(method, url).await);
            }
            debug!("401 on {method} {url}, refreshing token");
            let token = self.tokens.force_refresh(&token).await?;
            *refreshed = true;

            resp = build(self.http.request(method.clone(), url))
                .bearer_auth(&token)
                .send()
                .await?;
            if resp.status() == StatusCode::UNAUTHORIZED {
                return Err(self.reject_session(method, url).await);
            }
        }

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(SyncError::api(status.as_u16(), &body))
    }

    async fn reject_session(&self, method: &Method, url: &str) -> SyncError {
        warn!("401 on {method} {url} after token refresh, ending session");
        self.tokens.expire_session().await;
        SyncError::SessionExpired
    }
}
