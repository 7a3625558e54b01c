//! Model management endpoints.
//!
//! These handlers drive the backend control channel and mutate the
//! gateway's active-model record, publishing lifecycle events as they go.

use crate::api::types::{
    validate_load_request, ActivateModelRequest, ApiError, LoadModelRequest, UnloadModelRequest,
};
use crate::api::AppState;
use crate::bus::events;
use crate::control::ControlError;
use crate::state::{GatewayStatus, OperationKind};
use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// GET /admin/models - loaded and downloaded models from the backend.
pub async fn list_models(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let (loaded, downloaded) = state
        .control
        .list_models()
        .await
        .map_err(|e| ApiError::BackendUnavailable(e.to_string()))?;

    let downloaded: Vec<Value> = downloaded
        .into_iter()
        .map(|m| json!({"path": m.path, "size": m.size_bytes, "type": m.model_type}))
        .collect();

    Ok(Json(json!({
        "loaded": loaded,
        "downloaded": downloaded,
        "active_model": state.state.active_model(),
    })))
}

/// POST /admin/models/load - load a model, optionally activating it.
pub async fn load_model(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoadModelRequest>,
) -> Result<Json<Value>, ApiError> {
    let details = validate_load_request(&request);
    if !details.is_empty() {
        return Err(ApiError::Validation(details));
    }

    info!(model_key = %request.model_key, activate = request.activate, "Model load requested");
    let started = Instant::now();

    state.bus.publish(
        events::MODEL_LOAD_START,
        json!({
            "model_key": &request.model_key,
            "instance_id": &request.instance_id,
        }),
    );
    state
        .state
        .begin_operation(OperationKind::Load, Some(request.model_key.clone()));

    let result = state
        .control
        .load_model(
            &request.model_key,
            request.instance_id.as_deref(),
            request.load_config.as_ref(),
        )
        .await;

    let total_time_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(()) => {
            if request.activate {
                state.state.set_active_model(
                    request.model_key.clone(),
                    request.instance_id.clone(),
                    request.default_inference.clone().unwrap_or_default(),
                );
            }
            state.state.finish_operation(GatewayStatus::Idle);

            state.bus.publish(
                events::MODEL_LOAD_COMPLETE,
                json!({
                    "model_key": &request.model_key,
                    "instance_id": &request.instance_id,
                    "activated": request.activate,
                    "total_time_ms": total_time_ms,
                }),
            );

            let message = format!("Model '{}' loaded", request.model_key);
            Ok(Json(json!({
                "status": "loaded",
                "model_key": &request.model_key,
                "instance_id": &request.instance_id,
                "activated": request.activate,
                "total_time_ms": total_time_ms,
                "message": message,
            })))
        }
        Err(e) => {
            error!(model_key = %request.model_key, error = %e, "Model load failed");
            state.state.finish_operation(GatewayStatus::Error);
            state.state.count_error();
            state.bus.publish(
                events::ERROR,
                json!({
                    "error": e.to_string(),
                    "model_key": &request.model_key,
                    "total_time_ms": total_time_ms,
                }),
            );
            match e {
                ControlError::Unavailable(_) | ControlError::Timeout(_) => Err(e.into()),
                other => Err(ApiError::Internal(other.to_string())),
            }
        }
    }
}

/// POST /admin/models/unload - unload a model; clears the active record
/// when it pointed at the unloaded instance.
pub async fn unload_model(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UnloadModelRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.model_key.trim().is_empty() {
        return Err(ApiError::Validation(vec![
            "model_key must not be empty".to_string(),
        ]));
    }

    info!(model_key = %request.model_key, "Model unload requested");
    let started = Instant::now();

    state.bus.publish(
        events::MODEL_UNLOAD_START,
        json!({
            "model_key": &request.model_key,
            "instance_id": &request.instance_id,
        }),
    );
    state
        .state
        .begin_operation(OperationKind::Unload, Some(request.model_key.clone()));

    let result = state
        .control
        .unload_model(&request.model_key, request.instance_id.as_deref())
        .await;

    let total_time_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(target) => {
            if !state
                .state
                .clear_active_if_matches("", Some(&target.identifier))
            {
                state.state.clear_active_if_matches(&target.path, None);
            }
            state.state.finish_operation(GatewayStatus::Idle);

            state.bus.publish(
                events::MODEL_UNLOAD_COMPLETE,
                json!({
                    "model_key": &target.path,
                    "instance_id": &target.identifier,
                    "total_time_ms": total_time_ms,
                }),
            );

            Ok(Json(json!({
                "status": "unloaded",
                "model_key": target.path,
                "instance_id": target.identifier,
                "total_time_ms": total_time_ms,
            })))
        }
        Err(ControlError::NotFound(key)) => {
            state.state.finish_operation(GatewayStatus::Idle);
            Err(ControlError::NotFound(key).into())
        }
        Err(e) => {
            error!(model_key = %request.model_key, error = %e, "Model unload failed");
            state.state.finish_operation(GatewayStatus::Error);
            state.state.count_error();
            state.bus.publish(
                events::ERROR,
                json!({
                    "error": e.to_string(),
                    "model_key": &request.model_key,
                    "total_time_ms": total_time_ms,
                }),
            );
            match e {
                ControlError::Unavailable(_) | ControlError::Timeout(_) => Err(e.into()),
                other => Err(ApiError::Internal(other.to_string())),
            }
        }
    }
}

/// POST /admin/models/activate - set the active model without touching
/// the backend.
pub async fn activate_model(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ActivateModelRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.model_key.trim().is_empty() {
        return Err(ApiError::Validation(vec![
            "model_key must not be empty".to_string(),
        ]));
    }

    state.state.set_active_model(
        request.model_key.clone(),
        request.instance_id.clone(),
        request.default_inference.clone().unwrap_or_default(),
    );

    info!(model_key = %request.model_key, "Model activated");
    state.bus.publish(
        events::MODEL_ACTIVATE,
        json!({
            "model_key": &request.model_key,
            "instance_id": &request.instance_id,
        }),
    );

    Ok(Json(json!({
        "status": "activated",
        "model_key": request.model_key,
        "instance_id": request.instance_id,
    })))
}
