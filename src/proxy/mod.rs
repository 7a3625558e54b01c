//! OpenAI-compatible proxy path
//!
//! Forwards `/v1/*` calls (and their bare shorthands) to the backend HTTP
//! surface. Chat and text completion bodies are augmented with the active
//! model and its sampling defaults; client-provided fields are never
//! overwritten. Every proxied request publishes `inference_start` and
//! exactly one terminal event on the bus.

use crate::api::AppState;
use crate::bus::{events, EventBus};
use crate::state::{ActiveModel, GatewayState, TokenUsage};
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// Bare OpenAI shorthand paths accepted without the `/v1` prefix.
pub const SHORTHAND_PATHS: &[&str] = &[
    "/chat/completions",
    "/completions",
    "/models",
    "/embeddings",
    "/images/generations",
    "/audio/transcriptions",
    "/audio/translations",
];

/// Request headers never forwarded upstream.
const SKIP_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "transfer-encoding",
    "content-length",
    "x-api-key",
];

/// Backend response headers never relayed downstream.
const SKIP_RESPONSE_HEADERS: &[&str] = &["connection", "transfer-encoding", "content-length"];

/// Handle any proxied request.
pub async fn handle(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let method = request.method().clone();
    let original_path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);
    let headers = request.headers().clone();

    let path = rewrite_path(&original_path);
    // `/v1/{admin,debug,health}/...` belongs to the gateway's own surface.
    if path.starts_with("/v1/admin") || path.starts_with("/v1/debug") || path.starts_with("/v1/health")
    {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "Not found"}))).into_response();
    }

    let body = match axum::body::to_bytes(request.into_body(), crate::api::MAX_BODY_SIZE).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("Failed to read request body: {}", e)})),
            )
                .into_response();
        }
    };

    let request_id = mint_request_id();
    info!(request_id = %request_id, method = %method, path = %original_path, "Proxying request");
    state.bus.publish(
        events::INFERENCE_START,
        json!({
            "request_id": &request_id,
            "method": method.as_str(),
            "path": &original_path,
        }),
    );
    state.state.begin_inference();

    let (body, stream_requested) = prepare_body(&method, &path, body, &state.state.active_model());

    let url = match &query {
        Some(q) => format!("{}{}?{}", state.config.upstream.base_url_trimmed(), path, q),
        None => format!("{}{}", state.config.upstream.base_url_trimmed(), path),
    };

    if stream_requested {
        forward_streaming(state, method, url, headers, body, request_id).await
    } else {
        forward_buffered(state, method, url, headers, body, request_id).await
    }
}

/// Forward a non-streaming request and relay the backend's status and
/// body unchanged.
async fn forward_buffered(
    state: Arc<AppState>,
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Bytes,
    request_id: String,
) -> Response {
    let started = Instant::now();

    let sent = state
        .http_client
        .request(method, &url)
        .headers(forward_headers(&headers))
        .body(body)
        .send()
        .await;

    let response = match sent {
        Ok(response) => response,
        Err(e) => {
            return transport_failure(&state, &request_id, started, &e);
        }
    };

    let status = response.status();
    let response_headers = response.headers().clone();
    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            return transport_failure(&state, &request_id, started, &e);
        }
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let usage = extract_usage(&bytes);

    let mut payload = json!({
        "request_id": &request_id,
        "total_time_ms": elapsed_ms,
    });
    if let Some(usage) = usage {
        payload["token_usage"] = json!({
            "prompt": usage.prompt,
            "completion": usage.completion,
            "total": usage.total,
        });
    }
    state.bus.publish(events::INFERENCE_COMPLETE, payload);
    info!(request_id = %request_id, status = %status, elapsed_ms, "Proxied request completed");
    state.state.record_completed(request_id, elapsed_ms, usage);
    state.state.end_inference();

    relay_response(status, &response_headers, Body::from(bytes))
}

/// Forward a streaming request, piping backend chunks to the client
/// verbatim. The lifecycle guard guarantees exactly one terminal event
/// even when the client disconnects mid-stream.
async fn forward_streaming(
    state: Arc<AppState>,
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Bytes,
    request_id: String,
) -> Response {
    let started = Instant::now();

    let mut builder = state
        .stream_client
        .request(method, &url)
        .headers(forward_headers(&headers))
        .body(body);
    if state.config.proxy.stream_timeout_ms > 0 {
        builder = builder.timeout(Duration::from_millis(state.config.proxy.stream_timeout_ms));
    }

    let response = match builder.send().await {
        Ok(response) => response,
        Err(e) => {
            return transport_failure(&state, &request_id, started, &e);
        }
    };

    let status = response.status();
    let response_headers = response.headers().clone();

    // The backend refused the request; relay its answer as-is.
    if !status.is_success() {
        let bytes = response.bytes().await.unwrap_or_default();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        state.bus.publish(
            events::ERROR,
            json!({
                "request_id": &request_id,
                "error": format!("backend returned {}", status),
                "total_time_ms": elapsed_ms,
            }),
        );
        state.state.record_failed(request_id, Some(elapsed_ms));
        state.state.end_inference();
        return relay_response(status, &response_headers, Body::from(bytes));
    }

    let mut lifecycle = StreamLifecycle {
        state: Arc::clone(&state.state),
        bus: state.bus.clone(),
        request_id,
        started,
        finished: false,
    };
    let mut upstream = response.bytes_stream();

    let relay = async_stream::stream! {
        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => yield Ok::<Bytes, std::io::Error>(bytes),
                Err(e) => {
                    lifecycle.fail(&format!("upstream stream error: {}", e));
                    yield Err(std::io::Error::other(e.to_string()));
                    return;
                }
            }
        }
        lifecycle.complete();
    };

    relay_response(status, &response_headers, Body::from_stream(relay))
}

/// Terminal-event discipline for streaming relays. If the stream is
/// dropped before completing (client disconnect), the drop publishes the
/// `error` terminal event and the upstream connection is torn down with it.
struct StreamLifecycle {
    state: Arc<GatewayState>,
    bus: EventBus,
    request_id: String,
    started: Instant,
    finished: bool,
}

impl StreamLifecycle {
    fn complete(&mut self) {
        self.finished = true;
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        self.bus.publish(
            events::INFERENCE_COMPLETE,
            json!({
                "request_id": &self.request_id,
                "total_time_ms": elapsed_ms,
            }),
        );
        self.state
            .record_completed(self.request_id.clone(), elapsed_ms, None);
        self.state.end_inference();
    }

    fn fail(&mut self, error: &str) {
        self.finished = true;
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        warn!(request_id = %self.request_id, error, "Streaming request failed");
        self.bus.publish(
            events::ERROR,
            json!({
                "request_id": &self.request_id,
                "error": error,
                "total_time_ms": elapsed_ms,
            }),
        );
        self.state
            .record_failed(self.request_id.clone(), Some(elapsed_ms));
        self.state.end_inference();
    }
}

impl Drop for StreamLifecycle {
    fn drop(&mut self) {
        if !self.finished {
            self.fail("client closed connection");
        }
    }
}

/// Publish the error terminal event and map the transport failure to a
/// response: 504 on timeout, 503 otherwise.
fn transport_failure(
    state: &AppState,
    request_id: &str,
    started: Instant,
    error: &reqwest::Error,
) -> Response {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    warn!(request_id, error = %error, "Proxy transport failure");

    state.bus.publish(
        events::ERROR,
        json!({
            "request_id": request_id,
            "error": error.to_string(),
            "total_time_ms": elapsed_ms,
        }),
    );
    state
        .state
        .record_failed(request_id.to_string(), Some(elapsed_ms));
    state.state.end_inference();

    if error.is_timeout() {
        (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({"error": "Backend request timed out"})),
        )
            .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": format!("Backend unreachable: {}", error)})),
        )
            .into_response()
    }
}

/// Rewrite bare shorthand paths to their `/v1` form.
pub fn rewrite_path(path: &str) -> String {
    if path.starts_with("/v1/") {
        path.to_string()
    } else {
        format!("/v1{}", path)
    }
}

/// `req_<ms-since-epoch>_<rand6>`
pub fn mint_request_id() -> String {
    let ms = Utc::now().timestamp_millis();
    let uuid = Uuid::new_v4().simple().to_string();
    format!("req_{}_{}", ms, &uuid[..6])
}

/// Augment completion bodies and determine whether streaming was asked for.
fn prepare_body(method: &Method, path: &str, body: Bytes, active: &ActiveModel) -> (Bytes, bool) {
    let augmentable = method == Method::POST
        && (path == "/v1/chat/completions" || path == "/v1/completions");

    if augmentable {
        augment_body(body, active)
    } else {
        let stream = serde_json::from_slice::<Value>(&body)
            .ok()
            .and_then(|v| v.get("stream").and_then(Value::as_bool))
            .unwrap_or(false);
        (body, stream)
    }
}

/// Fill in the active model and its sampling defaults for fields the
/// client left unset. Client-provided fields always win.
fn augment_body(body: Bytes, active: &ActiveModel) -> (Bytes, bool) {
    let Ok(Value::Object(mut map)) = serde_json::from_slice::<Value>(&body) else {
        return (body, false);
    };

    if !map.contains_key("model") {
        if let Some(model) = active
            .instance_id
            .clone()
            .or_else(|| active.model_key.clone())
        {
            map.insert("model".to_string(), Value::String(model));
        }
    }

    let defaults = &active.default_inference;
    if let Some(v) = defaults.temperature {
        map.entry("temperature".to_string()).or_insert(json!(v));
    }
    if let Some(v) = defaults.max_tokens {
        map.entry("max_tokens".to_string()).or_insert(json!(v));
    }
    if let Some(v) = defaults.top_p {
        map.entry("top_p".to_string()).or_insert(json!(v));
    }
    if let Some(v) = defaults.top_k {
        map.entry("top_k".to_string()).or_insert(json!(v));
    }
    if let Some(v) = defaults.repeat_penalty {
        map.entry("repeat_penalty".to_string()).or_insert(json!(v));
    }
    if let Some(v) = &defaults.stop_strings {
        map.entry("stop".to_string()).or_insert(json!(v));
    }
    if let Some(v) = defaults.stream {
        map.entry("stream".to_string()).or_insert(json!(v));
    }

    let stream = map
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let bytes = serde_json::to_vec(&Value::Object(map))
        .map(Bytes::from)
        .unwrap_or(body);
    (bytes, stream)
}

fn forward_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if SKIP_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.append(name, value.clone());
    }
    out
}

fn relay_response(status: StatusCode, headers: &HeaderMap, body: Body) -> Response {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        if SKIP_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder.body(body).unwrap_or_else(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": format!("Failed to build response: {}", e)})),
        )
            .into_response()
    })
}

fn extract_usage(bytes: &[u8]) -> Option<TokenUsage> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    let usage = value.get("usage")?.as_object()?;
    let field = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
    Some(TokenUsage {
        prompt: field("prompt_tokens"),
        completion: field("completion_tokens"),
        total: field("total_tokens"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InferenceDefaults;

    fn active(instance: Option<&str>, key: Option<&str>, defaults: InferenceDefaults) -> ActiveModel {
        ActiveModel {
            model_key: key.map(String::from),
            instance_id: instance.map(String::from),
            default_inference: defaults,
        }
    }

    #[test]
    fn test_rewrite_path_shorthand() {
        assert_eq!(rewrite_path("/chat/completions"), "/v1/chat/completions");
        assert_eq!(rewrite_path("/models"), "/v1/models");
    }

    #[test]
    fn test_rewrite_path_v1_unchanged() {
        assert_eq!(rewrite_path("/v1/chat/completions"), "/v1/chat/completions");
    }

    #[test]
    fn test_request_id_shape() {
        let id = mint_request_id();
        assert!(id.starts_with("req_"));
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 6);
    }

    #[test]
    fn test_augment_injects_instance_id_over_model_key() {
        let body = Bytes::from(r#"{"messages":[]}"#);
        let model = active(Some("inst-1"), Some("key"), InferenceDefaults::default());
        let (out, stream) = augment_body(body, &model);
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["model"], "inst-1");
        assert!(!stream);
    }

    #[test]
    fn test_augment_falls_back_to_model_key() {
        let body = Bytes::from(r#"{"messages":[]}"#);
        let model = active(None, Some("qwen2-1.5b"), InferenceDefaults::default());
        let (out, _) = augment_body(body, &model);
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["model"], "qwen2-1.5b");
    }

    #[test]
    fn test_augment_never_overwrites_client_model() {
        let body = Bytes::from(r#"{"model":"client-choice"}"#);
        let model = active(Some("inst-1"), Some("key"), InferenceDefaults::default());
        let (out, _) = augment_body(body, &model);
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["model"], "client-choice");
    }

    #[test]
    fn test_augment_no_active_model_leaves_model_absent() {
        let body = Bytes::from(r#"{"messages":[]}"#);
        let model = active(None, None, InferenceDefaults::default());
        let (out, _) = augment_body(body, &model);
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert!(value.get("model").is_none());
    }

    #[test]
    fn test_augment_copies_defaults_without_overwriting() {
        let body = Bytes::from(r#"{"temperature":0.9}"#);
        let defaults = InferenceDefaults {
            temperature: Some(0.2),
            max_tokens: Some(256),
            stop_strings: Some(vec!["<END>".to_string()]),
            ..Default::default()
        };
        let model = active(None, Some("m"), defaults);
        let (out, _) = augment_body(body, &model);
        let value: Value = serde_json::from_slice(&out).unwrap();
        // Client value wins.
        assert_eq!(value["temperature"], 0.9);
        // Defaults fill the gaps, with stop_strings mapped to "stop".
        assert_eq!(value["max_tokens"], 256);
        assert_eq!(value["stop"][0], "<END>");
    }

    #[test]
    fn test_augment_stream_default_applies() {
        let body = Bytes::from(r#"{}"#);
        let defaults = InferenceDefaults {
            stream: Some(true),
            ..Default::default()
        };
        let (_, stream) = augment_body(body, &active(None, Some("m"), defaults));
        assert!(stream);
    }

    #[test]
    fn test_augment_non_json_body_passthrough() {
        let body = Bytes::from_static(b"not json at all");
        let (out, stream) = augment_body(body.clone(), &active(None, Some("m"), InferenceDefaults::default()));
        assert_eq!(out, body);
        assert!(!stream);
    }

    #[test]
    fn test_prepare_body_only_augments_completions() {
        let model = active(Some("inst"), None, InferenceDefaults::default());
        let (out, _) = prepare_body(
            &Method::POST,
            "/v1/embeddings",
            Bytes::from(r#"{"input":"hi"}"#),
            &model,
        );
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert!(value.get("model").is_none());
    }

    #[test]
    fn test_forward_headers_strips_sensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "gateway.local".parse().unwrap());
        headers.insert("x-api-key", "secret".parse().unwrap());
        headers.insert("content-length", "12".parse().unwrap());
        headers.insert("accept", "application/json".parse().unwrap());
        headers.insert("authorization", "Bearer tok".parse().unwrap());

        let out = forward_headers(&headers);
        assert!(out.get("host").is_none());
        assert!(out.get("x-api-key").is_none());
        assert!(out.get("content-length").is_none());
        assert_eq!(out.get("accept").unwrap(), "application/json");
        assert_eq!(out.get("authorization").unwrap(), "Bearer tok");
    }

    #[test]
    fn test_extract_usage() {
        let body = br#"{"id":"x","usage":{"prompt_tokens":9,"completion_tokens":12,"total_tokens":21}}"#;
        let usage = extract_usage(body).unwrap();
        assert_eq!(usage.prompt, 9);
        assert_eq!(usage.completion, 12);
        assert_eq!(usage.total, 21);
    }

    #[test]
    fn test_extract_usage_absent() {
        assert!(extract_usage(br#"{"id":"x"}"#).is_none());
        assert!(extract_usage(b"not json").is_none());
    }
}
