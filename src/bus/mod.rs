//! In-process event bus
//!
//! Fan-out point for gateway lifecycle events and backend telemetry. Each
//! subscriber owns a bounded queue; a full queue drops events for that
//! subscriber only, so a slow SSE client can never stall a publisher.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Event type tags published by the gateway and the log tailer.
pub mod events {
    pub const INFERENCE_START: &str = "inference_start";
    pub const INFERENCE_COMPLETE: &str = "inference_complete";
    pub const MODEL_LOAD_START: &str = "model_load_start";
    pub const MODEL_LOAD_PROGRESS: &str = "model_load_progress";
    pub const MODEL_LOAD_COMPLETE: &str = "model_load_complete";
    pub const MODEL_UNLOAD_START: &str = "model_unload_start";
    pub const MODEL_UNLOAD_COMPLETE: &str = "model_unload_complete";
    pub const MODEL_ACTIVATE: &str = "model_activate";
    pub const ERROR: &str = "error";

    pub const DEBUG_LOG: &str = "debug_log";
    pub const CHAT_START: &str = "lmstudio_chat_start";
    pub const SAMPLING_PARAMS: &str = "lmstudio_sampling_params";
    pub const PROMPT_PROGRESS: &str = "lmstudio_prompt_progress";
    pub const CACHE_STATS: &str = "lmstudio_cache_stats";
    pub const TOKEN_INFO: &str = "lmstudio_token_info";
    pub const PROCESSING_START: &str = "lmstudio_processing_start";
    pub const MONTH_TRANSITION: &str = "lmstudio_month_transition";
}

/// Capacity of each subscriber's outbound queue.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 512;

/// An event as delivered to subscribers: the type tag plus the payload
/// serialized exactly once at publish time.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub event_type: String,
    pub data: String,
}

struct SubscriberSlot {
    tx: mpsc::Sender<Arc<BusMessage>>,
    dropped: AtomicU64,
}

struct BusInner {
    subscribers: DashMap<u64, SubscriberSlot>,
    next_id: AtomicU64,
    dropped_total: AtomicU64,
}

/// Multi-producer fan-out bus. Cloning shares the same bus; publish never
/// blocks on a slow subscriber.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
                dropped_total: AtomicU64::new(0),
            }),
        }
    }

    /// Publish an event to every current subscriber.
    ///
    /// Stamps a timestamp into the payload, serializes once, and offers the
    /// encoded event to each subscriber's queue. A full queue drops the
    /// event for that subscriber only and records the overflow.
    pub fn publish(&self, event_type: &str, payload: Value) {
        let mut payload = payload;
        if let Value::Object(ref mut map) = payload {
            map.insert(
                "timestamp".to_string(),
                Value::String(Utc::now().to_rfc3339()),
            );
        }

        let message = Arc::new(BusMessage {
            event_type: event_type.to_string(),
            data: payload.to_string(),
        });

        // Snapshot the registry so queue offers happen outside any shard lock.
        let targets: Vec<(u64, mpsc::Sender<Arc<BusMessage>>)> = self
            .inner
            .subscribers
            .iter()
            .map(|entry| (*entry.key(), entry.value().tx.clone()))
            .collect();

        let mut closed = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(Arc::clone(&message)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.inner.dropped_total.fetch_add(1, Ordering::Relaxed);
                    if let Some(slot) = self.inner.subscribers.get(&id) {
                        slot.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    debug!(subscriber_id = id, event_type, "Dropped event for slow subscriber");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
            }
        }

        for id in closed {
            self.unsubscribe(id);
        }
    }

    /// Register a new subscriber with a bounded outbound queue. The
    /// subscriber unregisters itself when dropped.
    pub fn subscribe(&self) -> BusSubscriber {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        self.inner.subscribers.insert(
            id,
            SubscriberSlot {
                tx,
                dropped: AtomicU64::new(0),
            },
        );
        debug!(subscriber_id = id, "Subscriber attached");
        BusSubscriber {
            id,
            rx,
            bus: self.clone(),
        }
    }

    /// Remove a subscriber and release its queue. Idempotent.
    pub fn unsubscribe(&self, id: u64) {
        if self.inner.subscribers.remove(&id).is_some() {
            debug!(subscriber_id = id, "Subscriber detached");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Total events dropped across all subscribers since startup.
    pub fn dropped_total(&self) -> u64 {
        self.inner.dropped_total.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription. Lifetime matches one SSE connection; dropping it
/// unregisters from the bus.
pub struct BusSubscriber {
    id: u64,
    rx: mpsc::Receiver<Arc<BusMessage>>,
    bus: EventBus,
}

impl BusSubscriber {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next event in publish order. Returns None once the
    /// subscription has been removed from the bus.
    pub async fn recv(&mut self) -> Option<Arc<BusMessage>> {
        self.rx.recv().await
    }
}

impl Drop for BusSubscriber {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}
