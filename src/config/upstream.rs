//! Upstream runtime endpoints

use serde::{Deserialize, Serialize};

/// Location of the backend runtime's two interfaces: the OpenAI-compatible
/// HTTP surface and the model-control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the backend HTTP API, e.g. "http://127.0.0.1:1234"
    pub base_url: String,
    /// Control channel URL override. When absent, derived from `base_url`
    /// by swapping the scheme (http -> ws, https -> wss).
    pub control_url: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:1234".to_string(),
            control_url: None,
        }
    }
}

impl UpstreamConfig {
    /// Effective control channel URL.
    pub fn control_url(&self) -> String {
        match &self.control_url {
            Some(url) => url.clone(),
            None => derive_control_url(&self.base_url),
        }
    }

    /// Base URL with any trailing slash removed, so paths can be appended.
    pub fn base_url_trimmed(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

fn derive_control_url(base: &str) -> String {
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    }
}
