//! Control channel data types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A model instance currently loaded in the backend runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadedModel {
    pub path: String,
    pub identifier: String,
}

/// A model present on disk but not necessarily loaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadedModel {
    pub path: String,
    pub size_bytes: u64,
    #[serde(rename = "type")]
    pub model_type: String,
}

/// Sparse GPU offload settings. Absent fields keep the backend default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GpuConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layers: Option<u32>,
}

/// Sparse load-time parameters passed through to the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoadConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_threads: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rope_frequency_base: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rope_frequency_scale: Option<f64>,
}

/// Control channel errors.
#[derive(Error, Debug)]
pub enum ControlError {
    /// Connect retries exhausted; the backend control channel is down.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Unload target not present in the loaded list.
    #[error("model not found: {0}")]
    NotFound(String),

    /// The session broke mid-call or the backend sent something unexpected.
    #[error("control protocol error: {0}")]
    Protocol(String),

    /// The backend answered with an error result.
    #[error("backend rejected operation: {0}")]
    Backend(String),

    /// A call exceeded its deadline.
    #[error("control call timed out: {0}")]
    Timeout(&'static str),
}
