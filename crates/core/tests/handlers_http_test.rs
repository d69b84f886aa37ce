use axum::{
    body::Body,
    extract::connect_info::MockConnectInfo,
    http::{header, Request, StatusCode},
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use virtuous_core::test_utils::{create_test_app_state, measurement};
use virtuous_core::{build_router, AppState};

const KEY: &str = "test-key";

fn app(state: Arc<AppState>) -> axum::Router {
    build_router(state).layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 9000))))
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, key: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(key) = key {
        builder = builder.header("X-API-Key", key);
    }
    let body = body.map_or_else(Body::empty, |b| Body::from(b.to_string()));
    builder.body(body).unwrap()
}

async fn wait_for_ledger(state: &AppState, len: usize) {
    for _ in 0..200 {
        if state.ledger.len() >= len && state.orchestrator.in_flight().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("ledger never reached {} entries", len);
}

#[tokio::test]
async fn test_status_reports_component_health() {
    let state = create_test_app_state(Some(KEY.to_string())).await;
    state.monitor.observe(measurement("summarizer", 0.96)).unwrap();
    state.monitor.observe(measurement("classifier", 0.80)).unwrap();
    let app = app(state);

    let (status, body) = send(&app, get("/status")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["monitoring"]["components_tracked"], 2);
    assert_eq!(body["thresholds"]["critical"], 0.85);
    assert_eq!(body["thresholds"]["variance_unit"], "std_dev");
    assert_eq!(body["thresholds"]["trend_unit_secs"], 60);
    let components = body["components"].as_array().unwrap();
    assert_eq!(components[0]["component_id"], "classifier");
    assert_eq!(components[0]["health"], "critical");
    assert_eq!(components[1]["health"], "healthy");
    assert_eq!(components[1]["tier"], "excellent");
}

#[tokio::test]
async fn test_trigger_requires_api_key() {
    let state = create_test_app_state(Some(KEY.to_string())).await;
    let app = app(state.clone());
    let payload = json!({ "component_id": "summarizer", "reason": "looks off" });

    let (status, body) = send(&app, post("/trigger", None, Some(payload.clone()))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["status"], "error");
    assert_eq!(body["error"]["type"], "PermissionDenied");

    let (status, _) = send(&app, post("/trigger", Some("wrong"), Some(payload))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(state.ledger.is_empty());
}

#[tokio::test]
async fn test_trigger_deploys_then_rejects_during_cooldown() {
    let state = create_test_app_state(Some(KEY.to_string())).await;
    let app = app(state.clone());
    let payload = json!({ "component_id": "summarizer", "reason": "looks off" });

    let (status, body) = send(&app, post("/trigger", Some(KEY), Some(payload.clone()))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "success");
    let cycle_id = body["cycle_id"].as_str().unwrap().to_string();

    wait_for_ledger(&state, 1).await;
    assert_eq!(state.ledger.recent(1)[0].cycle_id, cycle_id);

    let (status, body) = send(&app, post("/trigger", Some(KEY), Some(payload))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"]["message"].as_str().unwrap().contains("cooldown"));
}

#[tokio::test]
async fn test_trigger_rate_limited_per_client() {
    let state = create_test_app_state(Some(KEY.to_string())).await;
    let app = app(state);

    for i in 0..3 {
        let payload = json!({ "component_id": format!("component-{i}") });
        let (status, _) = send(&app, post("/trigger", Some(KEY), Some(payload))).await;
        assert_ne!(status, StatusCode::TOO_MANY_REQUESTS, "request {} should pass the limiter", i);
    }

    let payload = json!({ "component_id": "component-3" });
    let (status, body) = send(&app, post("/trigger", Some(KEY), Some(payload))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["type"], "RateLimited");
}

#[tokio::test]
async fn test_rollback_without_body_reverts_latest() {
    let state = create_test_app_state(Some(KEY.to_string())).await;
    let app = app(state.clone());

    let (status, body) = send(&app, post("/rollback", Some(KEY), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "NotFound");

    let payload = json!({ "component_id": "summarizer" });
    let (_, body) = send(&app, post("/trigger", Some(KEY), Some(payload))).await;
    let cycle_id = body["cycle_id"].as_str().unwrap().to_string();
    wait_for_ledger(&state, 1).await;

    let (status, body) = send(&app, post("/rollback", Some(KEY), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reverted_cycle_id"], cycle_id.as_str());
    assert_eq!(body["changes"][0]["after"]["kind"], "temperature");
    assert_eq!(body["changes"][0]["after"]["value"], 0.7);
    assert_eq!(body["summary"]["rollback_available"], false);

    let (status, body) = send(&app, get("/changes?limit=10")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["changes"][0]["type"], "rollback");
    assert_eq!(body["changes"][1]["type"], "optimization");
    assert_eq!(body["summary"]["total_changes_tracked"], 2);
    assert_eq!(body["summary"]["rollbacks"], 1);
}

#[tokio::test]
async fn test_rollback_rejects_malformed_body() {
    let state = create_test_app_state(Some(KEY.to_string())).await;
    let app = app(state);

    let request = Request::builder()
        .method("POST")
        .uri("/rollback")
        .header(header::CONTENT_TYPE, "application/json")
        .header("X-API-Key", KEY)
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "ValidationError");
}

#[tokio::test]
async fn test_clear_history_empties_ledger_only() {
    let state = create_test_app_state(Some(KEY.to_string())).await;
    let app = app(state.clone());

    send(&app, post("/trigger", Some(KEY), Some(json!({ "component_id": "summarizer" })))).await;
    wait_for_ledger(&state, 1).await;
    let version = state.governor.snapshot().version;

    let (status, body) = send(&app, post("/clear-history", Some(KEY), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cleared"], 1);
    assert_eq!(body["config_version"], version);

    let (_, body) = send(&app, get("/changes")).await;
    assert_eq!(body["summary"]["total_changes_tracked"], 0);
    assert_eq!(body["summary"]["rollback_available"], false);
}

#[tokio::test]
async fn test_config_override_round_trip() {
    let state = create_test_app_state(Some(KEY.to_string())).await;
    let app = app(state);

    let payload = json!({
        "component_id": "summarizer",
        "setting": { "kind": "model", "value": "gpt-4o" },
        "reason": "pin model during incident"
    });
    let (status, body) = send(&app, post("/config", Some(KEY), Some(payload))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["config_version"], 1);

    let (status, body) = send(&app, get("/config?component=summarizer")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["settings"]["model"], "gpt-4o");

    let (_, body) = send(&app, get("/config?component=other")).await;
    assert_eq!(body["settings"]["model"], "gpt-4o-mini");
}

#[tokio::test]
async fn test_measurement_ingestion_validates_score() {
    let state = create_test_app_state(Some(KEY.to_string())).await;
    let app = app(state.clone());

    let bad = json!({ "component_id": "summarizer", "model_id": "gpt-4o-mini", "score": 1.5 });
    let (status, _) = send(&app, post("/measurements", Some(KEY), Some(bad))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let good = json!({ "component_id": "summarizer", "model_id": "gpt-4o-mini", "score": 0.97 });
    let (status, body) = send(&app, post("/measurements", Some(KEY), Some(good))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "accepted");

    for _ in 0..200 {
        if state.monitor.component("summarizer").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state.monitor.latest_score("summarizer"), Some(0.97));
}

#[tokio::test]
async fn test_unknown_alert_resolve_is_not_found() {
    let state = create_test_app_state(Some(KEY.to_string())).await;
    let app = app(state);

    let (status, body) = send(&app, post("/alerts/does-not-exist/resolve", Some(KEY), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "error");

    let (status, body) = send(&app, get("/alerts?unresolved=true")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 0);
}

#[tokio::test]
async fn test_version_endpoint() {
    let state = create_test_app_state(None).await;
    let app = app(state);

    let (status, body) = send(&app, get("/system/version")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}
