//! Network and shared-secret access control
//!
//! Every request passes two gates in fixed order: a source-address check
//! against the configured allowlist, then a shared-secret check on the
//! `X-API-Key` header. Either gate failing is terminal for the request.

use crate::api::AppState;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use ipnet::IpNet;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::warn;

/// Header carrying the shared secret.
pub const API_KEY_HEADER: &str = "x-api-key";

/// One entry of the source-address allowlist.
#[derive(Debug, Clone, PartialEq)]
pub enum AllowRule {
    /// "*" — accept any source address.
    Any,
    /// A literal IP address.
    Ip(IpAddr),
    /// A CIDR block.
    Net(IpNet),
}

impl AllowRule {
    /// Parse a single allowlist entry. Returns None for anything that is
    /// not "*", an IP literal, or a CIDR.
    pub fn parse(entry: &str) -> Option<Self> {
        let entry = entry.trim();
        if entry == "*" {
            return Some(AllowRule::Any);
        }
        if let Ok(ip) = entry.parse::<IpAddr>() {
            return Some(AllowRule::Ip(ip));
        }
        if let Ok(net) = entry.parse::<IpNet>() {
            return Some(AllowRule::Net(net));
        }
        None
    }

    fn matches(&self, ip: IpAddr) -> bool {
        match self {
            AllowRule::Any => true,
            AllowRule::Ip(allowed) => *allowed == ip,
            AllowRule::Net(net) => net.contains(&ip),
        }
    }
}

/// Compiled access policy, built once at startup.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    rules: Vec<AllowRule>,
    shared_secret: String,
    require_auth_for_health: bool,
}

impl AccessPolicy {
    /// Build a policy from validated configuration. Entries that fail to
    /// parse are skipped; `PorticoConfig::validate` rejects them earlier.
    pub fn from_config(config: &crate::config::AuthConfig) -> Self {
        let rules = config
            .allowlist
            .iter()
            .filter_map(|entry| AllowRule::parse(entry))
            .collect();

        Self {
            rules,
            shared_secret: config.shared_secret.clone(),
            require_auth_for_health: config.require_auth_for_health,
        }
    }

    /// Whether a source address passes the allowlist. V4-mapped-v6
    /// addresses are canonicalized first.
    pub fn allows_ip(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.rules.iter().any(|rule| rule.matches(ip))
    }

    /// Whether the shared-secret gate applies to this path.
    pub fn secret_required(&self, path: &str) -> bool {
        if self.shared_secret.is_empty() {
            return false;
        }
        if path == "/health" && !self.require_auth_for_health {
            return false;
        }
        true
    }

    /// Constant-time comparison against the configured secret.
    pub fn secret_matches(&self, presented: &str) -> bool {
        constant_time_eq(presented, &self.shared_secret)
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    let max_len = a_bytes.len().max(b_bytes.len());

    let mut diff = a_bytes.len() ^ b_bytes.len();
    for i in 0..max_len {
        let a_byte = *a_bytes.get(i).unwrap_or(&0);
        let b_byte = *b_bytes.get(i).unwrap_or(&0);
        diff |= (a_byte ^ b_byte) as usize;
    }

    diff == 0
}

/// Axum middleware applying both gates to every request.
pub async fn enforce(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let policy = &state.access;
    let path = request.uri().path().to_string();
    let peer_ip = addr.ip().to_canonical();

    if !policy.allows_ip(peer_ip) {
        warn!(peer = %peer_ip, path = %path, "Rejected request from disallowed source address");
        return (StatusCode::FORBIDDEN, Json(json!({"error": "Forbidden"}))).into_response();
    }

    if policy.secret_required(&path) {
        let presented = request
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if !policy.secret_matches(presented) {
            warn!(peer = %peer_ip, path = %path, "Rejected request with missing or invalid API key");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Unauthorized"})),
            )
                .into_response();
        }
    }

    next.run(request).await
}
