//! HTTP surface tests driving the router with in-memory stores.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use medbridge_engine::stores::{MemoryPrimaryStore, MemorySecondaryStore};
use medbridge_engine::{
    Coercion, EngineConfig, KeyMapping, MappingCatalog, StateStore, SyncEngine, TableMapping,
};
use medbridge_protocol::{ChangeEvent, RowImage};
use medbridge_server::{build_router, AppState, WebhookVerifier, SIGNATURE_HEADER};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const SECRET: &[u8] = b"portal-shared-secret";

fn catalog() -> Arc<MappingCatalog> {
    Arc::new(
        MappingCatalog::new(vec![
            TableMapping::new(
                "patients",
                "portal_patients",
                KeyMapping::cross_reference("id", "patient_id"),
            )
            .with_column("name", "full_name", Coercion::Identity),
            TableMapping::new(
                "appointments",
                "portal_appointments",
                KeyMapping::cross_reference("id", "appointment_id"),
            )
            .with_reference("patient_id", "patient_id", "patients"),
        ])
        .unwrap(),
    )
}

fn row(pairs: &[(&str, Value)]) -> RowImage {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

struct Harness {
    router: axum::Router,
    engine: Arc<SyncEngine>,
    primary: Arc<MemoryPrimaryStore>,
    secondary: Arc<MemorySecondaryStore>,
    _dir: TempDir,
}

async fn harness(verifier: WebhookVerifier) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(StateStore::open(dir.path().join("state.db")).await.unwrap());
    let primary = Arc::new(MemoryPrimaryStore::new());
    let secondary = Arc::new(MemorySecondaryStore::new());
    let engine = Arc::new(SyncEngine::new(
        primary.clone(),
        secondary.clone(),
        state,
        catalog(),
        EngineConfig::new(),
    ));
    let router = build_router(AppState {
        engine: engine.clone(),
        verifier,
    });
    Harness {
        router,
        engine,
        primary,
        secondary,
        _dir: dir,
    }
}

async fn read_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

fn webhook_body(event_id: &str, patient_id: i64, name: &str) -> Vec<u8> {
    json!({
        "table": "portal_patients",
        "type": "insert",
        "record": {"patient_id": patient_id, "full_name": name},
        "timestamp": "2024-03-01T10:00:00Z",
        "event_id": event_id,
    })
    .to_string()
    .into_bytes()
}

fn webhook_request(body: Vec<u8>, signature: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/sync/webhook")
        .header("content-type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header(SIGNATURE_HEADER, signature);
    }
    builder.body(Body::from(body)).expect("request")
}

fn empty_post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).expect("request")
}

#[tokio::test]
async fn unsigned_webhook_applies_the_change() {
    let h = harness(WebhookVerifier::unsigned()).await;

    let request = webhook_request(webhook_body("evt-1", 7, "Ada Lovelace"), None);
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let ack = read_json(response).await;
    assert_eq!(ack["applied"], json!(true));
    assert_eq!(ack["status"], json!("applied"));

    // The row landed under the generated primary key.
    let row = h.primary.row("patients", &json!(1)).expect("row applied");
    assert_eq!(row.get("name"), Some(&json!("Ada Lovelace")));
}

#[tokio::test]
async fn second_delivery_acks_as_duplicate() {
    let h = harness(WebhookVerifier::unsigned()).await;

    let first = webhook_request(webhook_body("evt-1", 7, "Ada"), None);
    h.router.clone().oneshot(first).await.unwrap();

    let second = webhook_request(webhook_body("evt-1", 7, "Ada"), None);
    let response = h.router.clone().oneshot(second).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let ack = read_json(response).await;
    assert_eq!(ack["applied"], json!(false));
    assert_eq!(ack["status"], json!("duplicate"));
    assert_eq!(h.primary.apply_calls(), 1);
}

#[tokio::test]
async fn signed_webhook_round_trip() {
    let verifier = WebhookVerifier::new(SECRET.to_vec());
    let h = harness(verifier.clone()).await;

    let body = webhook_body("evt-1", 7, "Ada");
    let signature = verifier.sign(&body).unwrap();

    let request = webhook_request(body, Some(&signature));
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let ack = read_json(response).await;
    assert_eq!(ack["status"], json!("applied"));
}

#[tokio::test]
async fn webhook_with_wrong_signature_is_rejected() {
    let verifier = WebhookVerifier::new(SECRET.to_vec());
    let h = harness(verifier.clone()).await;

    // Signature over different bytes than the ones delivered.
    let signature = verifier.sign(b"something else").unwrap();
    let request = webhook_request(webhook_body("evt-1", 7, "Ada"), Some(&signature));

    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let error = read_json(response).await;
    assert!(error["error"].as_str().unwrap().contains("signature"));
    assert_eq!(h.primary.apply_calls(), 0);
}

#[tokio::test]
async fn webhook_without_signature_is_rejected() {
    let h = harness(WebhookVerifier::new(SECRET.to_vec())).await;

    let request = webhook_request(webhook_body("evt-1", 7, "Ada"), None);
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn malformed_webhook_body_is_a_bad_request() {
    let h = harness(WebhookVerifier::unsigned()).await;

    let request = webhook_request(b"not json".to_vec(), None);
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let error = read_json(response).await;
    assert!(error["error"].as_str().unwrap().contains("malformed"));
    assert_eq!(error["retryable"], json!(false));
}

#[tokio::test]
async fn queue_notify_drains_the_outbox() {
    let h = harness(WebhookVerifier::unsigned()).await;

    let event = ChangeEvent::primary_insert(
        "patients",
        row(&[("id", json!(3)), ("name", json!("Grace Hopper"))]),
    );
    h.engine.capture("3", &event).await.unwrap();

    let response = h
        .router
        .clone()
        .oneshot(empty_post("/api/sync/queue-notify"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let report = read_json(response).await;
    assert_eq!(report["processed"], json!(1));
    assert_eq!(report["failed"], json!(0));

    let portal_row = h
        .secondary
        .row("portal_patients", &json!(1))
        .expect("row pushed");
    assert_eq!(portal_row.get("full_name"), Some(&json!("Grace Hopper")));
}

#[tokio::test]
async fn trigger_runs_both_directions_by_default() {
    let h = harness(WebhookVerifier::unsigned()).await;

    let response = h
        .router
        .clone()
        .oneshot(empty_post("/api/sync/trigger"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let report = read_json(response).await;
    assert!(report.get("outbound").is_some());
    assert!(report.get("inbound").is_some());
}

#[tokio::test]
async fn trigger_can_be_restricted_to_one_direction() {
    let h = harness(WebhookVerifier::unsigned()).await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/sync/trigger")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"direction": "sql-to-postgres"}).to_string(),
        ))
        .unwrap();
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let report = read_json(response).await;
    assert!(report.get("outbound").is_some());
    assert!(report.get("inbound").is_none());
}

#[tokio::test]
async fn status_reflects_engine_activity() {
    let h = harness(WebhookVerifier::unsigned()).await;

    // Nothing has synced yet.
    let response = h.router.clone().oneshot(get("/api/sync/status")).await.unwrap();
    let status = read_json(response).await;
    assert_eq!(status["healthy"], json!(false));
    assert_eq!(status["lastSync"], json!(null));

    // One outbound push: that direction turns healthy, the top level stays
    // down because inbound has never synced.
    let event = ChangeEvent::primary_insert("patients", row(&[("id", json!(3))]));
    h.engine.capture("3", &event).await.unwrap();
    h.router
        .clone()
        .oneshot(empty_post("/api/sync/queue-notify"))
        .await
        .unwrap();

    let response = h.router.clone().oneshot(get("/api/sync/status")).await.unwrap();
    let status = read_json(response).await;
    assert_eq!(status["healthy"], json!(false));
    assert_eq!(status["outbound"]["healthy"], json!(true));
    assert_eq!(status["counters"]["outboundApplied"], json!(1));
    assert_eq!(status["queue"]["pending"], json!(0));

    // One inbound apply completes the pair.
    let request = webhook_request(webhook_body("evt-1", 7, "Ada"), None);
    h.router.clone().oneshot(request).await.unwrap();

    let response = h.router.clone().oneshot(get("/api/sync/status")).await.unwrap();
    let status = read_json(response).await;
    assert_eq!(status["healthy"], json!(true));
    assert!(status["lastSync"].is_string());
}

#[tokio::test]
async fn dead_letters_are_listed_newest_first() {
    let h = harness(WebhookVerifier::unsigned()).await;

    for event_id in ["evt-1", "evt-2"] {
        let body = json!({
            "table": "portal_unknown",
            "type": "insert",
            "record": {"id": 1},
            "timestamp": "2024-03-01T10:00:00Z",
            "event_id": event_id,
        })
        .to_string()
        .into_bytes();
        let response = h
            .router
            .clone()
            .oneshot(webhook_request(body, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let ack = read_json(response).await;
        assert_eq!(ack["status"], json!("dead_lettered"));
    }

    let response = h
        .router
        .clone()
        .oneshot(get("/api/sync/dead-letters"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let entries = read_json(response).await;
    let entries = entries.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["eventId"], json!("evt-2"));
    assert_eq!(entries[0]["table"], json!("portal_unknown"));
    assert_eq!(entries[0]["direction"], json!("postgres-to-sql"));

    let response = h
        .router
        .clone()
        .oneshot(get("/api/sync/dead-letters?limit=1"))
        .await
        .unwrap();
    let entries = read_json(response).await;
    assert_eq!(entries.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn unresolved_reference_returns_service_unavailable() {
    let h = harness(WebhookVerifier::unsigned()).await;

    // Child row whose parent has never synced: retryable, so the portal
    // should redeliver rather than drop the event.
    let body = json!({
        "table": "portal_appointments",
        "type": "insert",
        "record": {"appointment_id": 5, "patient_id": 99},
        "timestamp": "2024-03-01T10:00:00Z",
        "event_id": "evt-orphan",
    })
    .to_string()
    .into_bytes();

    let response = h
        .router
        .clone()
        .oneshot(webhook_request(body, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let error = read_json(response).await;
    assert_eq!(error["retryable"], json!(true));
    assert!(error["error"].as_str().unwrap().contains("unresolved"));
}
