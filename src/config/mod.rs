//! Configuration module for Portico
//!
//! Provides layered configuration loading from files, environment variables, and defaults.

pub mod auth;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod proxy;
pub mod server;
pub mod upstream;

pub use auth::AuthConfig;
pub use error::ConfigError;
pub use logging::{LogFormat, LoggingConfig};
pub use monitor::MonitorConfig;
pub use proxy::ProxyConfig;
pub use server::ServerConfig;
pub use upstream::UpstreamConfig;

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration struct that holds all sub-configurations
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PorticoConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub auth: AuthConfig,
    pub proxy: ProxyConfig,
    pub monitor: MonitorConfig,
    pub logging: LoggingConfig,
}

impl PorticoConfig {
    /// Load configuration from a TOML file
    ///
    /// If path is None, returns default configuration.
    /// If path doesn't exist, returns NotFound error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => {
                if !p.exists() {
                    return Err(ConfigError::NotFound(p.to_path_buf()));
                }
                let content = std::fs::read_to_string(p)?;
                toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
            }
            None => Ok(Self::default()),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supports PORTICO_* environment variables for common settings.
    /// Invalid values are silently ignored (defaults are kept).
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(port) = std::env::var("PORTICO_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }
        if let Ok(host) = std::env::var("PORTICO_HOST") {
            self.server.host = host;
        }

        if let Ok(url) = std::env::var("PORTICO_BACKEND_URL") {
            self.upstream.base_url = url;
        }
        if let Ok(url) = std::env::var("PORTICO_CONTROL_URL") {
            self.upstream.control_url = Some(url);
        }

        if let Ok(secret) = std::env::var("PORTICO_SHARED_SECRET") {
            self.auth.shared_secret = secret;
        }
        if let Ok(list) = std::env::var("PORTICO_ALLOWLIST") {
            self.auth.allowlist = list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = std::env::var("PORTICO_REQUIRE_AUTH_FOR_HEALTH") {
            self.auth.require_auth_for_health = v.to_lowercase() == "true";
        }

        if let Ok(ms) = std::env::var("PORTICO_PROXY_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                self.proxy.timeout_ms = ms;
            }
        }
        if let Ok(ms) = std::env::var("PORTICO_PROXY_STREAM_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                self.proxy.stream_timeout_ms = ms;
            }
        }

        if let Ok(dir) = std::env::var("PORTICO_LOG_DIR") {
            self.monitor.log_dir = Some(dir.into());
        }
        if let Ok(v) = std::env::var("PORTICO_LOG_MONITORING") {
            self.monitor.enabled = v.to_lowercase() == "true";
        }

        if let Ok(level) = std::env::var("PORTICO_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("PORTICO_LOG_FORMAT") {
            if let Ok(f) = format.parse() {
                self.logging.format = f;
            }
        }

        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Validation {
                field: "server.port".to_string(),
                message: "port must be non-zero".to_string(),
            });
        }

        if self.upstream.base_url.is_empty() {
            return Err(ConfigError::Validation {
                field: "upstream.base_url".to_string(),
                message: "backend base URL cannot be empty".to_string(),
            });
        }
        if !self.upstream.base_url.starts_with("http://")
            && !self.upstream.base_url.starts_with("https://")
        {
            return Err(ConfigError::Validation {
                field: "upstream.base_url".to_string(),
                message: "backend base URL must use the http or https scheme".to_string(),
            });
        }

        for entry in &self.auth.allowlist {
            if crate::access::AllowRule::parse(entry).is_none() {
                return Err(ConfigError::Validation {
                    field: "auth.allowlist".to_string(),
                    message: format!("'{}' is not an IP, CIDR, or '*'", entry),
                });
            }
        }

        if self.monitor.enabled && self.monitor.log_dir.is_none() {
            return Err(ConfigError::Validation {
                field: "monitor.log_dir".to_string(),
                message: "log monitoring is enabled but no log directory is set".to_string(),
            });
        }

        Ok(())
    }
}
