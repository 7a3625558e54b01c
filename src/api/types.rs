//! Request/response types and the API error envelope.

use crate::control::{ControlError, LoadConfig};
use crate::state::InferenceDefaults;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

/// Body of `POST /admin/models/load`.
#[derive(Debug, Clone, Deserialize)]
pub struct LoadModelRequest {
    pub model_key: String,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub load_config: Option<LoadConfig>,
    #[serde(default)]
    pub default_inference: Option<InferenceDefaults>,
    #[serde(default = "default_true")]
    pub activate: bool,
}

fn default_true() -> bool {
    true
}

/// Body of `POST /admin/models/unload`.
#[derive(Debug, Clone, Deserialize)]
pub struct UnloadModelRequest {
    pub model_key: String,
    #[serde(default)]
    pub instance_id: Option<String>,
}

/// Body of `POST /admin/models/activate`.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivateModelRequest {
    pub model_key: String,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub default_inference: Option<InferenceDefaults>,
}

/// Validate a load request, returning human-readable violations.
pub fn validate_load_request(request: &LoadModelRequest) -> Vec<String> {
    let mut details = Vec::new();

    if request.model_key.trim().is_empty() {
        details.push("model_key must not be empty".to_string());
    }

    if let Some(config) = &request.load_config {
        if let Some(n) = config.context_length {
            if n == 0 {
                details.push("load_config.context_length must be positive".to_string());
            }
        }
        if let Some(gpu) = &config.gpu {
            if let Some(ratio) = gpu.ratio {
                if !(0.0..=1.0).contains(&ratio) {
                    details.push("load_config.gpu.ratio must be within [0, 1]".to_string());
                }
            }
        }
        if let Some(n) = config.cpu_threads {
            if n == 0 {
                details.push("load_config.cpu_threads must be positive".to_string());
            }
        }
        if let Some(v) = config.rope_frequency_base {
            if v <= 0.0 {
                details.push("load_config.rope_frequency_base must be positive".to_string());
            }
        }
        if let Some(v) = config.rope_frequency_scale {
            if v <= 0.0 {
                details.push("load_config.rope_frequency_scale must be positive".to_string());
            }
        }
    }

    details
}

/// API-level errors mapped onto the gateway's status taxonomy.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Validation failed")]
    Validation(Vec<String>),

    #[error("not found: {0}")]
    NotFound(String),

    /// Unload target not currently loaded.
    #[error("{0}")]
    UnloadNotFound(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl From<ControlError> for ApiError {
    fn from(error: ControlError) -> Self {
        match error {
            ControlError::Unavailable(msg) => ApiError::BackendUnavailable(msg),
            ControlError::NotFound(key) => {
                ApiError::UnloadNotFound(format!("Model '{}' is not loaded", key))
            }
            ControlError::Timeout(op) => {
                ApiError::BackendUnavailable(format!("control call '{}' timed out", op))
            }
            ControlError::Protocol(msg) | ControlError::Backend(msg) => ApiError::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(details) => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Validation failed", "details": details})),
            )
                .into_response(),
            ApiError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                Json(json!({"error": message})),
            )
                .into_response(),
            ApiError::UnloadNotFound(message) => (
                StatusCode::NOT_FOUND,
                Json(json!({"status": "not_found", "message": message})),
            )
                .into_response(),
            ApiError::BackendUnavailable(message) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": message})),
            )
                .into_response(),
            ApiError::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": message})),
            )
                .into_response(),
        }
    }
}
