//! In-memory gateway state
//!
//! A single mutex-guarded value holding the active model, the current
//! long-running operation, a bounded ring of recent request records, and
//! error/request counters. Critical sections are short; no I/O happens
//! under the lock. Derived metrics live in [`metrics`].

pub mod metrics;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

/// Maximum number of request records retained; oldest-evicted.
pub const RECENT_REQUESTS_CAPACITY: usize = 100;

/// Sparse sampling defaults carried by the active model and copied into
/// requests that leave the field unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InferenceDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_strings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

/// The model identity requests are augmented with. A None `model_key`
/// means no model is active.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActiveModel {
    pub model_key: Option<String>,
    pub instance_id: Option<String>,
    #[serde(default)]
    pub default_inference: InferenceDefaults,
}

/// Gateway-level status gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    Idle,
    LoadingModel,
    ProcessingInference,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Load,
    Unload,
    Inference,
}

/// Present while a long operation is live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationInfo {
    pub kind: OperationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Completed,
    Failed,
}

/// Token counts reported by the backend for one request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

/// One terminal request outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of everything the debug surface reports.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub status: GatewayStatus,
    pub active_model: ActiveModel,
    pub current_operation: Option<OperationInfo>,
    pub recent_requests: Vec<RequestRecord>,
    pub total_requests: u64,
    pub total_errors: u64,
    pub uptime_seconds: u64,
}

struct StateInner {
    status: GatewayStatus,
    active_model: ActiveModel,
    current_operation: Option<OperationInfo>,
    recent_requests: VecDeque<RequestRecord>,
    total_requests: u64,
    total_errors: u64,
}

/// Exclusively-owned gateway state behind one mutex.
pub struct GatewayState {
    inner: Mutex<StateInner>,
    started_at: Instant,
}

impl GatewayState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StateInner {
                status: GatewayStatus::Idle,
                active_model: ActiveModel::default(),
                current_operation: None,
                recent_requests: VecDeque::with_capacity(RECENT_REQUESTS_CAPACITY),
                total_requests: 0,
                total_errors: 0,
            }),
            started_at: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Overwrite the active model record.
    pub fn set_active_model(
        &self,
        model_key: String,
        instance_id: Option<String>,
        default_inference: InferenceDefaults,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.active_model = ActiveModel {
            model_key: Some(model_key),
            instance_id,
            default_inference,
        };
    }

    /// Clear the active model if it matches the given target, by instance
    /// id when present, otherwise by model key. Returns whether it cleared.
    pub fn clear_active_if_matches(&self, model_key: &str, instance_id: Option<&str>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let matches = match instance_id {
            Some(id) => inner.active_model.instance_id.as_deref() == Some(id),
            None => inner.active_model.model_key.as_deref() == Some(model_key),
        };
        if matches {
            inner.active_model = ActiveModel::default();
        }
        matches
    }

    pub fn active_model(&self) -> ActiveModel {
        self.inner.lock().unwrap().active_model.clone()
    }

    /// Begin a long operation. Any previous operation is cleared first.
    pub fn begin_operation(&self, kind: OperationKind, model_key: Option<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.current_operation = Some(OperationInfo {
            kind,
            model_key,
            progress: match kind {
                OperationKind::Load => Some(0),
                _ => None,
            },
            started_at: Utc::now(),
        });
        inner.status = match kind {
            OperationKind::Load | OperationKind::Unload => GatewayStatus::LoadingModel,
            OperationKind::Inference => GatewayStatus::ProcessingInference,
        };
    }

    /// Mark an inference in flight, unless a model operation already owns
    /// the gauge.
    pub fn begin_inference(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.current_operation.is_none() {
            inner.current_operation = Some(OperationInfo {
                kind: OperationKind::Inference,
                model_key: None,
                progress: None,
                started_at: Utc::now(),
            });
            inner.status = GatewayStatus::ProcessingInference;
        }
    }

    /// Clear the gauge only if an inference owns it; model operations in
    /// progress are left untouched.
    pub fn end_inference(&self) {
        let mut inner = self.inner.lock().unwrap();
        if matches!(
            inner.current_operation,
            Some(OperationInfo {
                kind: OperationKind::Inference,
                ..
            })
        ) {
            inner.current_operation = None;
            inner.status = GatewayStatus::Idle;
        }
    }

    /// Clear the current operation and settle on the given status.
    pub fn finish_operation(&self, status: GatewayStatus) {
        let mut inner = self.inner.lock().unwrap();
        inner.current_operation = None;
        inner.status = status;
    }

    pub fn set_operation_progress(&self, progress: u8) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(op) = inner.current_operation.as_mut() {
            op.progress = Some(progress.min(100));
        }
    }

    /// Record a completed request: appended to the ring, counted.
    pub fn record_completed(&self, request_id: String, time_ms: u64, token_usage: Option<TokenUsage>) {
        let mut inner = self.inner.lock().unwrap();
        push_record(
            &mut inner.recent_requests,
            RequestRecord {
                request_id,
                status: RequestStatus::Completed,
                time_ms: Some(time_ms),
                token_usage,
                timestamp: Utc::now(),
            },
        );
        inner.total_requests += 1;
    }

    /// Record a failed request: appended to the ring, counted as both a
    /// terminal request and an error.
    pub fn record_failed(&self, request_id: String, time_ms: Option<u64>) {
        let mut inner = self.inner.lock().unwrap();
        push_record(
            &mut inner.recent_requests,
            RequestRecord {
                request_id,
                status: RequestStatus::Failed,
                time_ms,
                token_usage: None,
                timestamp: Utc::now(),
            },
        );
        inner.total_requests += 1;
        inner.total_errors += 1;
    }

    /// Count an error that produced no request record (admin failures,
    /// stream teardown after the record was written).
    pub fn count_error(&self) {
        self.inner.lock().unwrap().total_errors += 1;
    }

    pub fn total_errors(&self) -> u64 {
        self.inner.lock().unwrap().total_errors
    }

    /// Snapshot for `/debug/status`, with `recent_requests` truncated to
    /// the most recent `recent_limit` entries.
    pub fn snapshot(&self, recent_limit: usize) -> StateSnapshot {
        let inner = self.inner.lock().unwrap();
        let skip = inner.recent_requests.len().saturating_sub(recent_limit);
        StateSnapshot {
            status: inner.status,
            active_model: inner.active_model.clone(),
            current_operation: inner.current_operation.clone(),
            recent_requests: inner.recent_requests.iter().skip(skip).cloned().collect(),
            total_requests: inner.total_requests,
            total_errors: inner.total_errors,
            uptime_seconds: self.uptime_seconds(),
        }
    }

    /// Full copy of the ring plus counters, for metrics derivation.
    pub(crate) fn metrics_view(&self) -> (Vec<RequestRecord>, u64, u64, ActiveModel) {
        let inner = self.inner.lock().unwrap();
        (
            inner.recent_requests.iter().cloned().collect(),
            inner.total_requests,
            inner.total_errors,
            inner.active_model.clone(),
        )
    }
}

impl Default for GatewayState {
    fn default() -> Self {
        Self::new()
    }
}

fn push_record(ring: &mut VecDeque<RequestRecord>, record: RequestRecord) {
    if ring.len() >= RECENT_REQUESTS_CAPACITY {
        ring.pop_front();
    }
    ring.push_back(record);
}
