mod support;

use bariatric_cloud::{Patient, Prediction, RetryPolicy, SessionState, SyncConfig, SyncError};
use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::{Duration, Instant};
use support::*;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn prediction_body() -> serde_json::Value {
    json!({ "one_month": 112.5, "three_months": 101.0, "six_months": 92.25 })
}

// --- Read-only endpoints ---

#[tokio::test]
async fn patients_are_listed_for_the_dashboard() {
    let h = harness().await;
    login(&h).await;
    Mock::given(method("GET"))
        .and(path("/api/surveys"))
        .and(header("authorization", "Bearer at-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "patient_number": "P-100", "submission_date": "2026-02-11", "status": "pending" },
            { "patient_number": "P-101", "submission_date": "2026-02-12", "status": "accepted" }
        ])))
        .expect(1)
        .mount(&h.server)
        .await;

    let patients = h.api.fetch_patients().await.unwrap();

    assert_eq!(
        patients.iter().map(|p| p.patient_number.as_str()).collect::<Vec<_>>(),
        vec!["P-100", "P-101"]
    );
    assert_eq!(
        patients[1],
        Patient {
            patient_number: "P-101".into(),
            submission_date: "2026-02-12".into(),
            status: "accepted".into(),
        }
    );
}

#[tokio::test]
async fn endpoint_paths_come_from_config() {
    let server = MockServer::start().await;
    let config = SyncConfig {
        patients_path: "/v2/patients".into(),
        results_path: "/v2/predictions/".into(),
        ..fast_config(&server.uri())
    };
    let h = harness_with(server, config);
    login(&h).await;
    Mock::given(method("GET"))
        .and(path("/v2/patients"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/predictions/p-3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(prediction_body()))
        .expect(1)
        .mount(&h.server)
        .await;

    assert!(h.api.fetch_patients().await.unwrap().is_empty());
    assert_eq!(h.api.fetch_prediction("p-3").await.unwrap().six_months, 92.25);
}

// --- Headers ---

#[tokio::test]
async fn requests_carry_bearer_and_json_accept() {
    let h = harness().await;
    login(&h).await;
    Mock::given(method("GET"))
        .and(path("/api/results/p-17"))
        .and(header("authorization", "Bearer at-1"))
        .and(header("accept", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(prediction_body()))
        .expect(1)
        .mount(&h.server)
        .await;

    let prediction = h.api.fetch_prediction("p-17").await.unwrap();
    assert_eq!(
        prediction,
        Prediction {
            one_month: 112.5,
            three_months: 101.0,
            six_months: 92.25
        }
    );
}

#[tokio::test]
async fn no_session_fails_without_a_request() {
    let h = harness().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&h.server)
        .await;

    let err = h.api.get_json::<serde_json::Value>("/api/surveys").await.unwrap_err();
    assert_eq!(err, SyncError::SessionExpired);
}

// --- Retry ---

#[tokio::test]
async fn three_server_errors_then_success() {
    let h = harness().await;
    login(&h).await;
    Mock::given(method("GET"))
        .and(path("/api/results/p-1"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .expect(3)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/results/p-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(prediction_body()))
        .expect(1)
        .mount(&h.server)
        .await;

    let prediction = h.api.fetch_prediction("p-1").await.unwrap();
    assert_eq!(prediction.six_months, 92.25);
}

#[tokio::test]
async fn default_backoff_waits_500_1000_2000_ms() {
    let server = MockServer::start().await;
    let config = SyncConfig::for_base_url(server.uri());
    assert_eq!(config.retry, RetryPolicy::default());
    let h = harness_with(server, config);
    login(&h).await;
    Mock::given(method("GET"))
        .and(path("/api/results/p-1"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/results/p-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(prediction_body()))
        .mount(&h.server)
        .await;

    let started = Instant::now();
    h.api.fetch_prediction("p-1").await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(3500), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(6000), "elapsed {elapsed:?}");
    let requests = h.server.received_requests().await.unwrap();
    let gets = requests.iter().filter(|r| r.method.as_str() == "GET").count();
    assert_eq!(gets, 4);
}

#[tokio::test]
async fn persistent_server_error_surfaces_after_max_retries() {
    let h = harness().await;
    login(&h).await;
    Mock::given(method("GET"))
        .and(path("/api/results/p-1"))
        .respond_with(ResponseTemplate::new(503).set_body_string("down"))
        .expect(4)
        .mount(&h.server)
        .await;

    let err = h.api.fetch_prediction("p-1").await.unwrap_err();
    assert_eq!(err, SyncError::Api { status_code: 503, body: "down".into() });
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let h = harness().await;
    login(&h).await;
    for (id, status) in [("p-404", 404), ("p-429", 429), ("p-422", 422)] {
        Mock::given(method("GET"))
            .and(path(format!("/api/results/{id}")))
            .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
            .expect(1)
            .mount(&h.server)
            .await;

        let err = h.api.fetch_prediction(id).await.unwrap_err();
        assert_eq!(err.status_code(), Some(status));
        assert!(!err.is_retryable());
    }
}

#[tokio::test]
async fn schema_mismatch_is_decode_error_and_not_retried() {
    let h = harness().await;
    login(&h).await;
    Mock::given(method("GET"))
        .and(path("/api/results/p-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"one_month": "soon"})))
        .expect(1)
        .mount(&h.server)
        .await;

    let err = h.api.fetch_prediction("p-1").await.unwrap_err();
    assert!(matches!(err, SyncError::Decode(_)));
}

#[tokio::test]
async fn slow_response_times_out() {
    let server = MockServer::start().await;
    let config = SyncConfig {
        request_timeout_secs: 1,
        retry: RetryPolicy::none(),
        ..SyncConfig::for_base_url(server.uri())
    };
    let h = harness_with(server, config);
    login(&h).await;
    Mock::given(method("GET"))
        .and(path("/api/results/p-1"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&h.server)
        .await;

    let err = h.api.fetch_prediction("p-1").await.unwrap_err();
    assert!(matches!(err, SyncError::NetworkTimeout(_)), "{err:?}");
    assert!(err.is_network());
}

#[tokio::test]
async fn unreachable_server_is_network_unavailable() {
    let h = harness().await;
    login(&h).await;
    let Harness { server, api, .. } = h;
    drop(server);

    let err = api.fetch_prediction("p-1").await.unwrap_err();
    assert!(matches!(err, SyncError::NetworkUnavailable(_)), "{err:?}");
}

// --- 401 handling ---

#[tokio::test]
async fn single_401_refreshes_and_replays() {
    let h = harness().await;
    login(&h).await;
    Mock::given(method("GET"))
        .and(path("/api/results/p-1"))
        .and(header("authorization", "Bearer at-1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/results/p-1"))
        .and(header("authorization", "Bearer at-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(prediction_body()))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-2", "rt-2", 3600)))
        .expect(1)
        .mount(&h.server)
        .await;

    h.api.fetch_prediction("p-1").await.unwrap();
    assert_eq!(h.tokens.state(), SessionState::Authenticated);
}

#[tokio::test]
async fn second_401_expires_session() {
    let h = harness().await;
    login(&h).await;
    Mock::given(method("GET"))
        .and(path("/api/results/p-1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-2", "rt-2", 3600)))
        .expect(1)
        .mount(&h.server)
        .await;

    let err = h.api.fetch_prediction("p-1").await.unwrap_err();

    assert_eq!(err, SyncError::SessionExpired);
    assert_eq!(h.tokens.state(), SessionState::Expired);
    assert!(!h.store.contains(CREDENTIALS_KEY).unwrap());
}

#[tokio::test]
async fn rejected_refresh_after_401_is_session_expired() {
    let h = harness().await;
    login(&h).await;
    Mock::given(method("GET"))
        .and(path("/api/results/p-1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh-token"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&h.server)
        .await;

    assert_eq!(h.api.fetch_prediction("p-1").await.unwrap_err(), SyncError::SessionExpired);
    assert_eq!(h.tokens.state(), SessionState::Expired);
}

// --- Entity endpoints ---

#[tokio::test]
async fn first_page_omits_since() {
    let h = harness().await;
    login(&h).await;
    Mock::given(method("GET"))
        .and(path("/api/surveys"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([]), "2026-03-01T10:00:00Z")))
        .mount(&h.server)
        .await;

    let page = h.api.fetch_page("surveys", None).await.unwrap();
    assert!(page.records.is_empty());

    let requests = h.server.received_requests().await.unwrap();
    let get = requests.iter().find(|r| r.method.as_str() == "GET").unwrap();
    assert_eq!(get.url.query(), None);
}

#[tokio::test]
async fn later_pages_send_since() {
    let h = harness().await;
    login(&h).await;
    Mock::given(method("GET"))
        .and(path("/api/surveys"))
        .and(query_param("since", "2026-03-01T10:00:00Z"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(
            json!([{ "id": "5", "version": 3, "payload": { "weight": 120 } }]),
            "2026-03-01T11:00:00Z",
        )))
        .expect(1)
        .mount(&h.server)
        .await;

    let since = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
    let page = h.api.fetch_page("surveys", Some(since)).await.unwrap();

    assert_eq!(page.records.len(), 1);
    assert_eq!(page.records[0].version, 3);
    assert_eq!(page.server_time, Utc.with_ymd_and_hms(2026, 3, 1, 11, 0, 0).unwrap());
}

#[tokio::test]
async fn push_sends_if_match_and_payload() {
    let h = harness().await;
    login(&h).await;
    Mock::given(method("PUT"))
        .and(path("/api/surveys/5"))
        .and(header("if-match", "2"))
        .and(body_json(json!({ "weight": 118 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "5", "version": 3 })))
        .expect(1)
        .mount(&h.server)
        .await;

    let ack = h.api.push_record("surveys", "5", 2, &json!({ "weight": 118 })).await.unwrap();
    assert_eq!(ack.version, 3);
}

#[tokio::test]
async fn push_conflict_names_the_record() {
    let h = harness().await;
    login(&h).await;
    Mock::given(method("PUT"))
        .and(path("/api/surveys/7"))
        .respond_with(ResponseTemplate::new(409))
        .expect(1)
        .mount(&h.server)
        .await;

    let err = h.api.push_record("surveys", "7", 1, &json!({})).await.unwrap_err();
    assert_eq!(
        err,
        SyncError::ConflictDetected {
            entity_type: "surveys".into(),
            ids: vec!["7".into()]
        }
    );
}
