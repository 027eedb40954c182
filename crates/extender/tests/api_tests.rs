//! Integration tests for the extender API against a mock metrics store

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use mockito::{Matcher, Server, ServerGuard};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use scheduler_extender::api::{create_router, AppState};
use telemetry_lib::{
    health::{components, HealthRegistry},
    scorer::{FilterChain, NodeScorer, PrometheusStore, ScorerConfig},
};
use tower::ServiceExt;

/// (series, [(node, value)]) served by the mock store
const HEALTHY_CLUSTER: [(&str, [(&str, &str); 2]); 5] = [
    ("ebpf_rtt_p99_milliseconds", [("a", "10"), ("b", "500")]),
    ("ebpf_tcp_retrans_rate", [("a", "0"), ("b", "50")]),
    ("ebpf_drop_rate", [("a", "0"), ("b", "20")]),
    ("ebpf_runqlat_p95_milliseconds", [("a", "1"), ("b", "50")]),
    ("ebpf_cpu_utilization", [("a", "5"), ("b", "80")]),
];

async fn mock_store(server: &mut ServerGuard) {
    for (series, nodes) in HEALTHY_CLUSTER {
        let result: Vec<Value> = nodes
            .iter()
            .map(|(node, value)| json!({"metric": {"node": node}, "value": [1_700_000_000, value]}))
            .collect();
        server
            .mock("GET", "/api/v1/query")
            .match_query(Matcher::UrlEncoded("query".into(), series.into()))
            .with_header("content-type", "application/json")
            .with_body(
                json!({"status": "success", "data": {"resultType": "vector", "result": result}})
                    .to_string(),
            )
            .create_async()
            .await;
    }
}

async fn setup_test_app(store_url: &str, filter_chain: FilterChain) -> Router {
    let health_registry = HealthRegistry::new("scheduler-extender");
    health_registry.register(components::SCORE_CACHE).await;
    health_registry.register(components::METRICS_STORE).await;
    health_registry.set_ready(true).await;

    let store = PrometheusStore::new(store_url, Duration::from_secs(1)).unwrap();
    let scorer = Arc::new(NodeScorer::new(
        Arc::new(store),
        ScorerConfig {
            refresh_timeout: Duration::from_secs(2),
            ..Default::default()
        },
        health_registry.clone(),
    ));

    create_router(Arc::new(AppState::new(scorer, filter_chain, health_registry)))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn node(name: &str) -> Value {
    json!({"metadata": {"name": name}})
}

#[tokio::test]
async fn test_prioritize_ranks_by_telemetry() {
    let mut server = Server::new_async().await;
    mock_store(&mut server).await;
    let app = setup_test_app(&server.url(), FilterChain::default()).await;

    let (status, body) = send(
        &app,
        post_json(
            "/prioritize",
            json!({
                "Pod": {"metadata": {"name": "web-0", "namespace": "default"}},
                "Nodes": {"items": [node("a"), node("b"), node("c")]}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let priorities: Vec<Value> = serde_json::from_slice(&body).unwrap();
    let score = |host: &str| {
        priorities
            .iter()
            .find(|p| p["Host"] == host)
            .and_then(|p| p["Score"].as_i64())
            .unwrap()
    };
    assert!(score("a") > score("c"));
    assert!(score("b") < score("c"));
    assert_eq!(score("c"), 50);
}

#[tokio::test]
async fn test_filter_passes_all_candidates_through() {
    let mut server = Server::new_async().await;
    mock_store(&mut server).await;
    let app = setup_test_app(&server.url(), FilterChain::default()).await;

    let (status, body) = send(
        &app,
        post_json("/filter", json!({"Nodes": {"items": [node("a"), node("b")]}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let result: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(result["Nodes"]["items"], json!([node("a"), node("b")]));
    assert_eq!(result["FailedNodes"], json!({}));
    assert_eq!(result["Error"], "");
}

#[tokio::test]
async fn test_filter_with_min_score_reports_failures() {
    let mut server = Server::new_async().await;
    mock_store(&mut server).await;
    let app = setup_test_app(&server.url(), FilterChain::from_min_score(Some(60.0))).await;

    let (status, body) = send(
        &app,
        post_json("/filter", json!({"NodeNames": ["a", "b", "c"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let result: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(result["NodeNames"], json!(["a", "c"]));
    assert!(result["FailedNodes"]["b"]
        .as_str()
        .unwrap()
        .contains("below minimum 60.0"));
}

#[tokio::test]
async fn test_malformed_body_is_a_client_error() {
    let server = Server::new_async().await;
    let app = setup_test_app(&server.url(), FilterChain::default()).await;

    for uri in ["/filter", "/prioritize"] {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from("{\"NodeNames\": [\"a\", "))
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let error: Value = serde_json::from_slice(&body).unwrap();
        assert!(error["error"].as_str().unwrap().contains("invalid request body"));
    }
}

#[tokio::test]
async fn test_store_outage_serves_neutral_scores() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/v1/query")
        .match_query(Matcher::Any)
        .with_status(503)
        .with_body("unavailable")
        .create_async()
        .await;
    let app = setup_test_app(&server.url(), FilterChain::default()).await;

    let (status, body) = send(
        &app,
        post_json("/prioritize", json!({"NodeNames": ["a", "b"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let priorities: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        priorities,
        json!([{"Host": "a", "Score": 50}, {"Host": "b", "Score": 50}])
    );

    // Degraded is still operational
    let (status, body) = send(&app, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["cache_state"], "cold");

    let (status, _) = send(&app, get("/readyz")).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&app, get("/cache")).await;
    let cache: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(cache["state"], "cold");
    assert!(cache["last_error"].as_str().unwrap().contains("503"));
}

#[tokio::test]
async fn test_cache_endpoint_dumps_entries() {
    let mut server = Server::new_async().await;
    mock_store(&mut server).await;
    let app = setup_test_app(&server.url(), FilterChain::default()).await;

    let (_, body) = send(&app, get("/cache")).await;
    let cache: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(cache["state"], "cold");
    assert_eq!(cache["entries"], json!([]));

    send(&app, post_json("/prioritize", json!({"NodeNames": ["a"]}))).await;

    let (status, body) = send(&app, get("/cache")).await;
    assert_eq!(status, StatusCode::OK);
    let cache: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(cache["state"], "warm");
    assert_eq!(cache["entries"][0]["node_name"], "a");
    assert_eq!(cache["entries"][1]["node_name"], "b");
    assert_eq!(cache["entries"][1]["raw"]["rtt_p99_ms"], 500.0);
    assert!(cache["last_error"].is_null());
}

#[tokio::test]
async fn test_liveness_and_metrics() {
    let server = Server::new_async().await;
    let app = setup_test_app(&server.url(), FilterChain::default()).await;

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");

    send(&app, post_json("/prioritize", json!({"NodeNames": []}))).await;
    let (status, body) = send(&app, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("netsched_extender_requests_total"));
}
