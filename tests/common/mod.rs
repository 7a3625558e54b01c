//! Shared test utilities for Portico integration tests.

#![allow(dead_code)]

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, Response};
use portico::api::{create_router, AppState};
use portico::config::PorticoConfig;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Default simulated peer address for router-level calls.
pub const TEST_PEER: &str = "127.0.0.1:40000";

/// Config pointing the proxy at the given backend URL, auth wide open.
pub fn test_config(backend_url: &str) -> PorticoConfig {
    let mut config = PorticoConfig::default();
    config.upstream.base_url = backend_url.to_string();
    config
}

/// Build the router plus a handle to its state.
pub fn build_app(config: PorticoConfig) -> (axum::Router, Arc<AppState>) {
    let state = Arc::new(AppState::new(Arc::new(config)));
    (create_router(Arc::clone(&state)), state)
}

/// Request with a simulated peer address (normally injected by the
/// listener's connect-info service).
pub fn request_from(peer: &str, method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match &body {
            Some(value) => Body::from(value.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    let addr: SocketAddr = peer.parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

pub fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    request_from(TEST_PEER, method, uri, body)
}

/// Read a full response body as JSON.
pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Receive bus events until one matches the wanted type, with a deadline.
pub async fn next_event_of(
    subscriber: &mut portico::bus::BusSubscriber,
    event_type: &str,
) -> Value {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            let message = subscriber
                .recv()
                .await
                .unwrap_or_else(|| panic!("bus closed while waiting for {}", event_type));
            if message.event_type == event_type {
                return serde_json::from_str(&message.data).unwrap();
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", event_type))
}
