//! Access control configuration

use serde::{Deserialize, Serialize};

/// Network and shared-secret access control.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret expected in the `X-API-Key` header. Empty disables
    /// the check entirely.
    pub shared_secret: String,
    /// Source addresses allowed to reach the gateway: literal IPs, CIDR
    /// blocks, or "*" to accept everyone.
    pub allowlist: Vec<String>,
    /// When false, `/health` is reachable without the shared secret.
    pub require_auth_for_health: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            shared_secret: String::new(),
            allowlist: vec!["*".to_string()],
            require_auth_for_health: false,
        }
    }
}
