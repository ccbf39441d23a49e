use super::*;

#[tokio::test]
async fn health_reports_ok_and_version() {
    let (app, _engine, _client, _guard) = create_test_api().await;

    let response = app
        .oneshot(empty_request("GET", "/api/v1/health"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn openapi_spec_is_served() {
    let (app, _engine, _client, _guard) = create_test_api().await;

    let response = app
        .oneshot(empty_request("GET", "/api/v1/openapi.json"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["info"]["title"], "fiscal-dl REST API");
    assert!(body["paths"]["/api/v1/downloads/execute"].is_object());
}

#[tokio::test]
async fn event_stream_responds_with_sse_content_type() {
    let (app, _engine, _client, _guard) = create_test_api().await;

    let response = app
        .oneshot(empty_request("GET", "/api/v1/events"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert!(
        content_type.starts_with("text/event-stream"),
        "unexpected content type {}",
        content_type
    );
}
