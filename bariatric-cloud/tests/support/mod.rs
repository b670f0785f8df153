//! Shared fixtures: an in-memory secure store and a wired-up session stack
//! pointing at a wiremock server.
#![allow(dead_code)]

use bariatric_cloud::{ApiClient, RetryPolicy, SyncConfig, SyncEngine, TokenManager};
use bariatric_storage::{MemoryBackend, MemoryKeystore, RecordCache, SecureStore};
use serde_json::{json, Value};
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const CREDENTIALS_KEY: &str = "auth.credentials";
pub const USER_KEY: &str = "auth.user";

pub struct Harness {
    pub server: MockServer,
    pub backend: Arc<MemoryBackend>,
    pub keystore: Arc<MemoryKeystore>,
    pub store: Arc<SecureStore>,
    pub tokens: Arc<TokenManager>,
    pub api: Arc<ApiClient>,
    pub engine: Arc<SyncEngine>,
}

/// Config with millisecond backoff so retry tests stay fast.
pub fn fast_config(base_url: &str) -> SyncConfig {
    SyncConfig {
        retry: RetryPolicy {
            base_delay_ms: 10,
            factor: 2,
            max_retries: 3,
        },
        request_timeout_secs: 5,
        ..SyncConfig::for_base_url(base_url)
    }
}

pub async fn harness() -> Harness {
    let server = MockServer::start().await;
    let config = fast_config(&server.uri());
    harness_with(server, config)
}

pub fn harness_with(server: MockServer, config: SyncConfig) -> Harness {
    let backend = Arc::new(MemoryBackend::new());
    let keystore = Arc::new(MemoryKeystore::new());
    let store = Arc::new(SecureStore::new(backend.clone(), keystore.clone()));
    let tokens = Arc::new(TokenManager::new(config, store.clone()).unwrap());
    let api = Arc::new(ApiClient::new(tokens.clone()));
    let engine = Arc::new(SyncEngine::new(api.clone(), RecordCache::new(store.clone())));
    Harness {
        server,
        backend,
        keystore,
        store,
        tokens,
        api,
        engine,
    }
}

pub fn token_body(access: &str, refresh: &str, expires_in: i64) -> Value {
    json!({
        "accessToken": access,
        "refreshToken": refresh,
        "expiresIn": expires_in,
        "user": { "id": 7, "name": "Ana", "surname": "Kowalska", "email": "ana@clinic.example" }
    })
}

/// Mounts a login endpoint issuing `at-1`/`rt-1` valid for `expires_in` seconds.
pub async fn mount_login(server: &MockServer, expires_in: i64) {
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-1", "rt-1", expires_in)))
        .mount(server)
        .await;
}

/// Logs in with a token that stays valid for an hour.
pub async fn login(h: &Harness) {
    login_expiring_in(h, 3600).await;
}

pub async fn login_expiring_in(h: &Harness, expires_in: i64) {
    mount_login(&h.server, expires_in).await;
    h.tokens.login("ana@clinic.example", "secret").await.unwrap();
}

pub fn page(records: Value, server_time: &str) -> Value {
    json!({ "records": records, "serverTime": server_time })
}
