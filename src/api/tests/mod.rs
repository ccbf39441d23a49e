use super::*;
use crate::engine::test_helpers::{MockFiscalClient, create_test_engine, wait_for_terminal};
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use std::time::Duration;
use tower::ServiceExt;

mod system;

/// Helper: a router over a test engine with a scripted client
async fn create_test_api() -> (
    Router,
    Arc<DownloadEngine>,
    Arc<MockFiscalClient>,
    tempfile::TempDir,
) {
    let (engine, client, temp) = create_test_engine().await;
    let engine = Arc::new(engine);
    let config = engine.get_config();
    let app = create_router(engine.clone(), config);
    (app, engine, client, temp)
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).expect("response should be valid JSON")
}

#[tokio::test]
async fn api_server_binds_and_serves() {
    let (_app, engine, _client, _guard) = create_test_api().await;

    let mut config = (*engine.get_config()).clone();
    // Port 0 = OS assigns a free port
    config.api.bind_address = "127.0.0.1:0".parse().unwrap();
    let config = Arc::new(config);

    let handle = tokio::spawn({
        let engine = engine.clone();
        async move { start_api_server(engine, config).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_finished(), "server should still be serving");
    handle.abort();
}

#[tokio::test]
async fn cors_headers_are_present() {
    let (app, _engine, _client, _guard) = create_test_api().await;

    let request = Request::builder()
        .uri("/api/v1/health")
        .header("Origin", "http://localhost:3000")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .contains_key("access-control-allow-origin"),
        "CORS header should be present"
    );
}
