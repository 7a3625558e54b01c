//! Backend control channel client
//!
//! Maintains one logical WebSocket session to the runtime's control
//! channel for model listing, loading, and unloading. The session is
//! lazily connected on first use and shared across all HTTP handlers.
//! Frames carry correlation ids; a background reader routes each response
//! to the caller that sent the matching request, so listing and health
//! probes can be in flight concurrently. Load/unload are serialized so at
//! most one mutating operation is outstanding per process.
//!
//! Wire binding: JSON text frames with correlation ids. Request
//! `{"id":N,"op":"list_loaded"|"list_downloaded"|"load"|"unload",...}`,
//! response `{"id":N,"ok":true,...}` or `{"id":N,"ok":false,"error":"…"}`.

pub mod types;

pub use types::{ControlError, DownloadedModel, GpuConfig, LoadConfig, LoadedModel};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;
type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<WireResponse>>>>;

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_RETRY_GAP: Duration = Duration::from_secs(2);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const LIST_TIMEOUT: Duration = Duration::from_secs(10);
const LOAD_TIMEOUT: Duration = Duration::from_secs(60);
const UNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    id: u64,
    op: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<&'a LoadConfig>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    id: u64,
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    loaded: Option<Vec<LoadedModel>>,
    #[serde(default)]
    downloaded: Option<Vec<DownloadedModel>>,
}

/// One live connection: the write half plus a background reader routing
/// responses to waiting callers by correlation id.
struct Session {
    writer: WsWriter,
    pending: Pending,
    reader: JoinHandle<()>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reader.abort();
        // Wake any caller still waiting on this connection.
        self.pending.lock().unwrap().clear();
    }
}

/// Persistent control-channel session handle.
pub struct ControlClient {
    url: String,
    /// Guards connecting and frame writes. Held only while a frame is
    /// sent, so non-mutating calls await their responses concurrently;
    /// concurrent callers of a fresh connect queue here and share the
    /// single attempt.
    session: Mutex<Option<Session>>,
    /// Serializes load/unload so only one mutating operation is
    /// outstanding at a time.
    op_lock: Mutex<()>,
    next_id: AtomicU64,
}

impl ControlClient {
    pub fn new(url: String) -> Self {
        Self {
            url,
            session: Mutex::new(None),
            op_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    /// List loaded and downloaded models.
    pub async fn list_models(
        &self,
    ) -> Result<(Vec<LoadedModel>, Vec<DownloadedModel>), ControlError> {
        let loaded = self.list_loaded().await?;
        let response = self.call("list_downloaded", None, None, None, LIST_TIMEOUT).await?;
        let downloaded = response.downloaded.unwrap_or_default();
        Ok((loaded, downloaded))
    }

    /// Load a model into the runtime. Fields absent from `config` keep
    /// backend defaults.
    pub async fn load_model(
        &self,
        model_key: &str,
        instance_id: Option<&str>,
        config: Option<&LoadConfig>,
    ) -> Result<(), ControlError> {
        let _op = self.op_lock.lock().await;
        self.call("load", Some(model_key), instance_id, config, LOAD_TIMEOUT)
            .await?;
        info!(model_key, "Model loaded via control channel");
        Ok(())
    }

    /// Unload a model. Resolution rule: match `instance_id` against loaded
    /// identifiers when present, otherwise match `model_key` against
    /// loaded paths. No match fails with `NotFound`.
    pub async fn unload_model(
        &self,
        model_key: &str,
        instance_id: Option<&str>,
    ) -> Result<LoadedModel, ControlError> {
        let _op = self.op_lock.lock().await;

        let loaded = self.list_loaded().await?;
        let target = resolve_unload_target(&loaded, model_key, instance_id)
            .ok_or_else(|| ControlError::NotFound(model_key.to_string()))?
            .clone();

        self.call(
            "unload",
            Some(&target.path),
            Some(&target.identifier),
            None,
            UNLOAD_TIMEOUT,
        )
        .await?;
        info!(model_key = %target.path, instance_id = %target.identifier, "Model unloaded via control channel");
        Ok(target)
    }

    /// Cheap liveness probe. A failure invalidates the stored session so
    /// the next call reconnects.
    pub async fn health(&self) -> bool {
        self.list_loaded().await.is_ok()
    }

    async fn list_loaded(&self) -> Result<Vec<LoadedModel>, ControlError> {
        let response = self.call("list_loaded", None, None, None, LIST_TIMEOUT).await?;
        Ok(response.loaded.unwrap_or_default())
    }

    /// One request/response round trip, connecting first if needed. The
    /// session lock is released as soon as the frame is written; the
    /// response is awaited through the reader's correlation map.
    async fn call(
        &self,
        op: &'static str,
        model_key: Option<&str>,
        instance_id: Option<&str>,
        config: Option<&LoadConfig>,
        timeout: Duration,
    ) -> Result<WireResponse, ControlError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = WireRequest {
            id,
            op,
            model_key,
            instance_id,
            config,
        };
        let text = serde_json::to_string(&request)
            .map_err(|e| ControlError::Protocol(e.to_string()))?;

        let (rx, pending) = {
            let mut session = self.session.lock().await;
            if session.is_none() {
                *session = Some(self.connect().await?);
            }

            let pending = Arc::clone(&session.as_ref().expect("session populated above").pending);
            let (tx, rx) = oneshot::channel();
            pending.lock().unwrap().insert(id, tx);

            let sent = session
                .as_mut()
                .expect("session populated above")
                .writer
                .send(Message::Text(text.into()))
                .await;
            if let Err(e) = sent {
                warn!(op, error = %e, "Control send failed, dropping session");
                pending.lock().unwrap().remove(&id);
                *session = None;
                return Err(ControlError::Protocol(e.to_string()));
            }
            (rx, pending)
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                if response.ok {
                    Ok(response)
                } else {
                    let message = response.error.unwrap_or_else(|| "unknown error".to_string());
                    // A refused operation leaves the session healthy.
                    Err(ControlError::Backend(message))
                }
            }
            Ok(Err(_)) => {
                warn!(op, "Control connection closed mid-call");
                self.invalidate(&pending).await;
                Err(ControlError::Protocol("connection closed".to_string()))
            }
            Err(_) => {
                warn!(op, "Control call timed out, dropping session");
                pending.lock().unwrap().remove(&id);
                self.invalidate(&pending).await;
                Err(ControlError::Timeout(op))
            }
        }
    }

    /// Drop the stored session, but only if it is still the connection
    /// the failed call used; a reconnect that raced in stays.
    async fn invalidate(&self, stale: &Pending) {
        let mut session = self.session.lock().await;
        if let Some(current) = session.as_ref() {
            if Arc::ptr_eq(&current.pending, stale) {
                *session = None;
            }
        }
    }

    /// Connect with retry and validate the fresh session with one
    /// list-loaded round trip.
    async fn connect(&self) -> Result<Session, ControlError> {
        let mut last_error = String::new();

        for attempt in 1..=CONNECT_ATTEMPTS {
            debug!(url = %self.url, attempt, "Connecting to backend control channel");

            match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str())).await {
                Ok(Ok((ws, _))) => {
                    let (writer, reader) = ws.split();
                    let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));
                    let reader = tokio::spawn(read_loop(reader, Arc::clone(&pending)));
                    let mut candidate = Session {
                        writer,
                        pending,
                        reader,
                    };
                    match self.validate(&mut candidate).await {
                        Ok(()) => {
                            info!(url = %self.url, "Control channel connected");
                            return Ok(candidate);
                        }
                        // Dropping the candidate stops its reader.
                        Err(e) => last_error = e.to_string(),
                    }
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = "connect timed out".to_string(),
            }

            if attempt < CONNECT_ATTEMPTS {
                tokio::time::sleep(CONNECT_RETRY_GAP).await;
            }
        }

        Err(ControlError::Unavailable(format!(
            "{} after {} attempts: {}",
            self.url, CONNECT_ATTEMPTS, last_error
        )))
    }

    async fn validate(&self, session: &mut Session) -> Result<(), ControlError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = WireRequest {
            id,
            op: "list_loaded",
            model_key: None,
            instance_id: None,
            config: None,
        };
        let text = serde_json::to_string(&request)
            .map_err(|e| ControlError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        session.pending.lock().unwrap().insert(id, tx);

        tokio::time::timeout(LIST_TIMEOUT, async {
            session
                .writer
                .send(Message::Text(text.into()))
                .await
                .map_err(|e| ControlError::Protocol(e.to_string()))?;
            rx.await
                .map_err(|_| ControlError::Protocol("connection closed".to_string()))
        })
        .await
        .map_err(|_| ControlError::Timeout("validate"))?
        .map(|_| ())
    }
}

/// Route inbound frames to whichever caller registered the matching
/// correlation id. Runs until the connection closes; waiters left behind
/// are woken by clearing the map, which drops their senders.
async fn read_loop(mut reader: WsReader, pending: Pending) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<WireResponse>(text.as_str()) {
                Ok(response) => {
                    let waiter = pending.lock().unwrap().remove(&response.id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(response);
                        }
                        None => debug!(id = response.id, "Dropping control frame with no waiter"),
                    }
                }
                Err(e) => warn!(error = %e, "Ignoring malformed control frame"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Control connection error");
                break;
            }
        }
    }
    pending.lock().unwrap().clear();
}

/// Unload resolution: `instance_id` matches identifiers, otherwise
/// `model_key` matches paths.
pub fn resolve_unload_target<'a>(
    loaded: &'a [LoadedModel],
    model_key: &str,
    instance_id: Option<&str>,
) -> Option<&'a LoadedModel> {
    match instance_id {
        Some(id) => loaded.iter().find(|m| m.identifier == id),
        None => loaded.iter().find(|m| m.path == model_key),
    }
}
