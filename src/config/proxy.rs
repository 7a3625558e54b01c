//! Proxy timeout configuration

use serde::{Deserialize, Serialize};

/// Timeouts applied to forwarded requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Timeout for non-streaming requests, in milliseconds.
    pub timeout_ms: u64,
    /// Timeout for streaming requests, in milliseconds. 0 means unbounded.
    pub stream_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 120_000,
            stream_timeout_ms: 0,
        }
    }
}
