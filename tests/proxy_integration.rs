//! End-to-end proxy tests against a mock backend.

mod common;

use axum::http::StatusCode;
use common::{body_json, build_app, next_event_of, request, test_config};
use futures_util::StreamExt;
use portico::state::InferenceDefaults;
use serde_json::json;
use tower::Service;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn completion_response() -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "created": 1733000000,
        "model": "qwen2-1.5b",
        "choices": [],
        "usage": {"prompt_tokens": 9, "completion_tokens": 12, "total_tokens": 21}
    })
}

#[tokio::test]
async fn test_shorthand_path_rewritten_to_v1() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_response()))
        .expect(1)
        .mount(&server)
        .await;

    let (mut app, _state) = build_app(test_config(&server.uri()));

    let response = app
        .call(request(
            "POST",
            "/chat/completions",
            Some(json!({"model": "qwen2-1.5b", "messages": []})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_active_model_injected_with_defaults() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(
            json!({"model": "qwen2-1.5b", "temperature": 0.2}),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_response()))
        .expect(1)
        .mount(&server)
        .await;

    let (mut app, state) = build_app(test_config(&server.uri()));
    state.state.set_active_model(
        "qwen2-1.5b".to_string(),
        None,
        InferenceDefaults {
            temperature: Some(0.2),
            ..Default::default()
        },
    );

    let response = app
        .call(request(
            "POST",
            "/v1/chat/completions",
            Some(json!({"messages": [{"role": "user", "content": "hi"}]})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_instance_id_preferred_over_model_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"model": "qwen2-1.5b-1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_response()))
        .expect(1)
        .mount(&server)
        .await;

    let (mut app, state) = build_app(test_config(&server.uri()));
    state.state.set_active_model(
        "qwen2-1.5b".to_string(),
        Some("qwen2-1.5b-1".to_string()),
        InferenceDefaults::default(),
    );

    let response = app
        .call(request(
            "POST",
            "/v1/chat/completions",
            Some(json!({"messages": []})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_client_model_never_overwritten() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"model": "client-pick"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_response()))
        .expect(1)
        .mount(&server)
        .await;

    let (mut app, state) = build_app(test_config(&server.uri()));
    state.state.set_active_model(
        "active-model".to_string(),
        None,
        InferenceDefaults::default(),
    );

    app.call(request(
        "POST",
        "/v1/chat/completions",
        Some(json!({"model": "client-pick", "messages": []})),
    ))
    .await
    .unwrap();
}

#[tokio::test]
async fn test_no_active_model_leaves_body_unaugmented() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_response()))
        .mount(&server)
        .await;

    let (mut app, _state) = build_app(test_config(&server.uri()));
    app.call(request(
        "POST",
        "/v1/chat/completions",
        Some(json!({"messages": []})),
    ))
    .await
    .unwrap();

    let received = &server.received_requests().await.unwrap()[0];
    let forwarded: serde_json::Value = serde_json::from_slice(&received.body).unwrap();
    assert!(forwarded.get("model").is_none());
}

#[tokio::test]
async fn test_api_key_header_stripped_before_forwarding() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_response()))
        .mount(&server)
        .await;

    let mut config = test_config(&server.uri());
    config.auth.shared_secret = "s3cret".to_string();
    let (mut app, _state) = build_app(config);

    let mut req = request(
        "POST",
        "/v1/chat/completions",
        Some(json!({"model": "m", "messages": []})),
    );
    req.headers_mut()
        .insert("x-api-key", "s3cret".parse().unwrap());
    app.call(req).await.unwrap();

    let received = &server.received_requests().await.unwrap()[0];
    assert!(received.headers.get("x-api-key").is_none());
}

#[tokio::test]
async fn test_usage_captured_and_metrics_updated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_response()))
        .mount(&server)
        .await;

    let (mut app, state) = build_app(test_config(&server.uri()));
    let mut subscriber = state.bus.subscribe();

    app.call(request(
        "POST",
        "/v1/chat/completions",
        Some(json!({"model": "m", "messages": []})),
    ))
    .await
    .unwrap();

    let start = next_event_of(&mut subscriber, "inference_start").await;
    assert_eq!(start["method"], "POST");
    assert_eq!(start["path"], "/v1/chat/completions");
    let complete = next_event_of(&mut subscriber, "inference_complete").await;
    assert_eq!(complete["request_id"], start["request_id"]);
    assert_eq!(complete["token_usage"]["total"], 21);

    let response = app
        .call(request("GET", "/debug/metrics", None))
        .await
        .unwrap();
    let metrics = body_json(response).await;
    assert_eq!(metrics["performance"]["total_requests"], 1);
    assert_eq!(metrics["performance"]["completed_count"], 1);
    assert!(metrics["performance"]["avg_response_time_ms"].is_number());
    assert_eq!(metrics["token_stats"]["total_completion_tokens"], 12);
}

#[tokio::test]
async fn test_backend_error_status_passes_through() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({"error": "model field required"})),
        )
        .mount(&server)
        .await;

    let (mut app, _state) = build_app(test_config(&server.uri()));
    let response = app
        .call(request(
            "POST",
            "/v1/chat/completions",
            Some(json!({"messages": []})),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "model field required");
}

#[tokio::test]
async fn test_unreachable_backend_returns_503_and_counts_error() {
    let (mut app, state) = build_app(test_config("http://127.0.0.1:1"));
    let mut subscriber = state.bus.subscribe();

    let response = app
        .call(request(
            "POST",
            "/v1/chat/completions",
            Some(json!({"model": "m", "messages": []})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert!(body["error"].is_string());

    let error = next_event_of(&mut subscriber, "error").await;
    assert!(error["request_id"].as_str().unwrap().starts_with("req_"));

    let snapshot = state.state.snapshot(10);
    assert_eq!(snapshot.total_errors, 1);
}

#[tokio::test]
async fn test_query_string_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .and(query_param("verbose", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .expect(1)
        .mount(&server)
        .await;

    let (mut app, _state) = build_app(test_config(&server.uri()));
    let response = app
        .call(request("GET", "/v1/models?verbose=true", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_reserved_v1_paths_not_proxied() {
    // Backend would answer; the gateway must not even try.
    let (mut app, state) = build_app(test_config("http://127.0.0.1:1"));

    for reserved in ["/v1/admin/models", "/v1/debug/status", "/v1/health/x"] {
        let response = app.call(request("GET", reserved, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", reserved);
    }
    assert_eq!(state.state.snapshot(10).total_requests, 0);
}

#[tokio::test]
async fn test_streaming_chunks_relayed_verbatim() {
    let sse_body = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n";
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_body.as_bytes(), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let (mut app, state) = build_app(test_config(&server.uri()));
    let mut subscriber = state.bus.subscribe();

    let response = app
        .call(request(
            "POST",
            "/v1/chat/completions",
            Some(json!({"model": "m", "messages": [], "stream": true})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(String::from_utf8(bytes.to_vec()).unwrap(), sse_body);

    let start = next_event_of(&mut subscriber, "inference_start").await;
    let complete = next_event_of(&mut subscriber, "inference_complete").await;
    assert_eq!(complete["request_id"], start["request_id"]);

    let snapshot = state.state.snapshot(10);
    assert_eq!(snapshot.total_requests, 1);
    assert_eq!(snapshot.total_errors, 0);
}

#[tokio::test]
async fn test_streaming_client_disconnect_tears_down() {
    let sse_body = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n";
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_body.as_bytes(), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let (mut app, state) = build_app(test_config(&server.uri()));
    let mut subscriber = state.bus.subscribe();

    let response = app
        .call(request(
            "POST",
            "/v1/chat/completions",
            Some(json!({"model": "m", "messages": [], "stream": true})),
        ))
        .await
        .unwrap();

    let mut body = response.into_body().into_data_stream();
    let first = body.next().await.unwrap().unwrap();
    assert!(!first.is_empty());

    // Client walks away mid-stream.
    drop(body);

    let _start = next_event_of(&mut subscriber, "inference_start").await;
    let error = next_event_of(&mut subscriber, "error").await;
    assert_eq!(error["error"], "client closed connection");

    let snapshot = state.state.snapshot(10);
    assert_eq!(snapshot.total_errors, 1);
}
