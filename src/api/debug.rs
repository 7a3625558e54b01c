//! Debug surface: state snapshot, derived metrics, and the SSE stream.

use crate::api::AppState;
use crate::state::metrics;
use axum::{
    extract::State,
    http::{header, HeaderName, HeaderValue},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// GET /debug/status - snapshot with the last 10 request records.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<crate::state::StateSnapshot> {
    Json(state.state.snapshot(10))
}

/// GET /debug/metrics - derived-on-demand metrics report.
pub async fn metrics_report(State(state): State<Arc<AppState>>) -> Json<metrics::MetricsReport> {
    Json(metrics::build_report(&state.state, &state.bus))
}

/// GET /debug/stream - attach an SSE subscriber to the event bus.
///
/// Emits a synthetic `connected` event immediately, then every bus event
/// in publish order, with a keep-alive comment every 30 seconds. The
/// subscription is released when the client disconnects.
pub async fn stream(State(state): State<Arc<AppState>>) -> Response {
    let mut subscriber = state.bus.subscribe();
    debug!(subscriber_id = subscriber.id(), "Debug stream attached");

    let events = async_stream::stream! {
        let connected = json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "message": "Debug stream connected",
        });
        yield Ok::<Event, Infallible>(
            Event::default().event("connected").data(connected.to_string()),
        );

        while let Some(message) = subscriber.recv().await {
            yield Ok(Event::default()
                .event(message.event_type.clone())
                .data(message.data.clone()));
        }
    };

    let sse = Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    );

    let mut response = sse.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}
