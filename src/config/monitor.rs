//! Backend log monitoring configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the backend log tailer.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MonitorConfig {
    /// Whether to tail the backend's rolling log files.
    pub enabled: bool,
    /// Root of the backend's log tree (contains YYYY-MM subdirectories).
    pub log_dir: Option<PathBuf>,
}
