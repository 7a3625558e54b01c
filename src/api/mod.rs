//! HTTP surface of the gateway
//!
//! One axum router carries three route families: the gateway's own
//! endpoints (`/health`, `/admin/*`, `/debug/*`), the proxied
//! OpenAI-compatible paths under `/v1`, and their bare shorthands. The
//! access filter runs ahead of everything.

pub mod admin;
pub mod debug;
pub mod health;
pub mod types;

pub use types::ApiError;

use crate::access;
use crate::bus::EventBus;
use crate::config::PorticoConfig;
use crate::control::ControlClient;
use crate::proxy;
use crate::state::GatewayState;
use axum::{
    middleware,
    routing::{any, get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;

/// Maximum request body size (10 MB).
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub config: Arc<PorticoConfig>,
    pub state: Arc<GatewayState>,
    pub bus: EventBus,
    pub control: Arc<ControlClient>,
    pub access: access::AccessPolicy,
    /// Client for non-streaming forwards, bounded by the proxy timeout.
    pub http_client: reqwest::Client,
    /// Client for streaming forwards; per-request timeouts only.
    pub stream_client: reqwest::Client,
}

impl AppState {
    /// Create new application state from frozen configuration.
    pub fn new(config: Arc<PorticoConfig>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.proxy.timeout_ms))
            .pool_max_idle_per_host(10)
            .build()
            .expect("Failed to create HTTP client");

        let stream_client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .build()
            .expect("Failed to create streaming HTTP client");

        let control = Arc::new(ControlClient::new(config.upstream.control_url()));
        let access = access::AccessPolicy::from_config(&config.auth);

        Self {
            config,
            state: Arc::new(GatewayState::new()),
            bus: EventBus::new(),
            control,
            access,
            http_client,
            stream_client,
        }
    }
}

/// Create the main router with all endpoints configured.
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health::handle))
        .route("/admin/models", get(admin::list_models))
        .route("/admin/models/load", post(admin::load_model))
        .route("/admin/models/unload", post(admin::unload_model))
        .route("/admin/models/activate", post(admin::activate_model))
        .route("/debug/status", get(debug::status))
        .route("/debug/metrics", get(debug::metrics_report))
        .route("/debug/stream", get(debug::stream))
        .route("/v1/{*path}", any(proxy::handle));

    for shorthand in proxy::SHORTHAND_PATHS {
        router = router.route(shorthand, any(proxy::handle));
    }

    router
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            access::enforce,
        ))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .with_state(state)
}
