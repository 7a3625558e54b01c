//! Backend log tailer
//!
//! Follows the runtime's rolling log tree (`<root>/YYYY-MM/YYYY-MM-DD.N.log`)
//! and turns appended lines into bus events. Filesystem notifications are a
//! best-effort latency signal; a short polling loop is the correctness
//! signal, with a slower periodic scan for month-directory transitions.
//!
//! The tailer owns its read cursor exclusively, never holds a lock across
//! I/O, and never terminates the process: errors are logged and retried.

pub mod parser;

use crate::bus::{events, EventBus};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use serde_json::json;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static MONTH_DIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}$").expect("valid month regex"));

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const MONTH_SCAN_INTERVAL: Duration = Duration::from_secs(600);

/// Position within the currently-followed log file.
struct ActiveFile {
    dir: PathBuf,
    path: PathBuf,
    position: u64,
    /// Carry-over of a trailing line fragment not yet terminated by '\n'.
    partial: String,
}

/// Follows the backend's rolling logs and publishes parsed events.
pub struct LogTailer {
    root: PathBuf,
    bus: EventBus,
    poll_interval: Duration,
    month_scan_interval: Duration,
    active: Option<ActiveFile>,
}

impl LogTailer {
    pub fn new(root: PathBuf, bus: EventBus) -> Self {
        Self {
            root,
            bus,
            poll_interval: DEFAULT_POLL_INTERVAL,
            month_scan_interval: MONTH_SCAN_INTERVAL,
            active: None,
        }
    }

    /// Shorten the timers (tests).
    pub fn with_intervals(mut self, poll: Duration, month_scan: Duration) -> Self {
        self.poll_interval = poll;
        self.month_scan_interval = month_scan;
        self
    }

    /// Run the tailer until cancelled.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(mut self, cancel: CancellationToken) {
        let (watch_tx, mut watch_rx) = mpsc::channel::<()>(16);
        let _watcher = start_watcher(&self.root, watch_tx);

        self.bootstrap().await;

        let mut poll_tick = tokio::time::interval(self.poll_interval);
        poll_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut month_tick = tokio::time::interval(self.month_scan_interval);
        month_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first interval tick fires immediately; consume it.
        poll_tick.tick().await;
        month_tick.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Log tailer stopping");
                    return;
                }
                _ = poll_tick.tick() => {
                    self.poll().await;
                }
                _ = month_tick.tick() => {
                    self.check_month_transition().await;
                    self.poll().await;
                }
                Some(()) = watch_rx.recv() => {
                    // Coalesce bursts before reacting.
                    while watch_rx.try_recv().is_ok() {}
                    self.check_month_transition().await;
                    self.poll().await;
                }
            }
        }
    }

    /// Locate the latest month directory and its newest log file, placing
    /// the cursor at end-of-file so history is not replayed.
    async fn bootstrap(&mut self) {
        let Some(dir) = latest_month_dir(&self.root) else {
            warn!(root = %self.root.display(), "No month directory found, tailer idle");
            return;
        };
        let Some((path, _mtime)) = newest_log(&dir) else {
            warn!(dir = %dir.display(), "No log file found, tailer idle");
            return;
        };

        let position = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Failed to stat log file");
                return;
            }
        };

        info!(file = %path.display(), position, "Tailing backend log");
        self.active = Some(ActiveFile {
            dir,
            path,
            position,
            partial: String::new(),
        });
    }

    async fn poll(&mut self) {
        if self.active.is_none() {
            self.bootstrap().await;
            if self.active.is_none() {
                return;
            }
        }

        self.check_rotation().await;
        self.drain_active().await;
    }

    /// Switch to a newer log file appearing in the active directory.
    async fn check_rotation(&mut self) {
        let Some(active) = &self.active else { return };

        let Some((candidate, candidate_mtime)) = newest_log(&active.dir) else {
            return;
        };
        if candidate == active.path {
            return;
        }

        let active_mtime = match std::fs::metadata(&active.path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => SystemTime::UNIX_EPOCH,
        };

        if candidate_mtime > active_mtime {
            info!(file = %candidate.display(), "Switched to rotated log file");
            let active = self.active.as_mut().expect("checked above");
            active.path = candidate;
            active.position = 0;
            active.partial.clear();
        }
    }

    /// Detect a lexicographically newer `YYYY-MM` sibling directory and
    /// move to its newest log file.
    async fn check_month_transition(&mut self) {
        let Some(latest) = latest_month_dir(&self.root) else {
            if self.active.is_some() {
                warn!(root = %self.root.display(), "Log root disappeared, tailer idle");
                self.active = None;
            }
            return;
        };

        let Some(active) = &self.active else {
            self.bootstrap().await;
            return;
        };

        if dir_name(&latest) <= dir_name(&active.dir) {
            return;
        }

        // A new month directory only becomes active once it has a log file.
        let Some((new_file, _)) = newest_log(&latest) else {
            debug!(dir = %latest.display(), "New month directory has no log file yet");
            return;
        };

        info!(
            old = %active.dir.display(),
            new = %latest.display(),
            "Backend log month transition"
        );
        self.bus.publish(
            events::MONTH_TRANSITION,
            json!({
                "old_directory": active.dir.display().to_string(),
                "new_directory": latest.display().to_string(),
                "new_log_file": new_file.display().to_string(),
            }),
        );

        self.active = Some(ActiveFile {
            dir: latest,
            path: new_file,
            position: 0,
            partial: String::new(),
        });
    }

    /// Read any bytes past the cursor and emit events for complete lines.
    async fn drain_active(&mut self) {
        let Some(active) = self.active.as_mut() else { return };

        let len = match tokio::fs::metadata(&active.path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(file = %active.path.display(), error = %e, "Active log file unreadable");
                self.active = None;
                return;
            }
        };

        // Truncated in place: start over from the top.
        if len < active.position {
            active.position = 0;
            active.partial.clear();
        }
        if len == active.position {
            return;
        }

        let mut file = match tokio::fs::File::open(&active.path).await {
            Ok(f) => f,
            Err(e) => {
                warn!(file = %active.path.display(), error = %e, "Failed to open log file");
                return;
            }
        };
        if let Err(e) = file.seek(SeekFrom::Start(active.position)).await {
            warn!(file = %active.path.display(), error = %e, "Failed to seek log file");
            return;
        }

        let mut buf = Vec::with_capacity((len - active.position) as usize);
        let read = match file.take(len - active.position).read_to_end(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                warn!(file = %active.path.display(), error = %e, "Failed to read log file");
                return;
            }
        };
        active.position += read as u64;
        active.partial.push_str(&String::from_utf8_lossy(&buf));

        while let Some(newline) = active.partial.find('\n') {
            let line: String = active.partial.drain(..=newline).collect();
            emit_line(&self.bus, line.trim_end_matches(['\n', '\r']));
        }
    }
}

fn emit_line(bus: &EventBus, line: &str) {
    let Some(parsed) = parser::parse_line(line) else {
        return;
    };

    bus.publish(
        events::DEBUG_LOG,
        json!({
            "timestamp": &parsed.timestamp,
            "level": &parsed.level,
            "message": &parsed.message,
            "raw": line,
        }),
    );

    for (event_type, payload) in parser::extract_events(&parsed.message) {
        bus.publish(event_type, payload);
    }
}

/// Latest `YYYY-MM` directory under the root, by lexicographic name.
fn latest_month_dir(root: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(root).ok()?;
    entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter(|e| {
            e.file_name()
                .to_str()
                .map(|name| MONTH_DIR_RE.is_match(name))
                .unwrap_or(false)
        })
        .max_by_key(|e| e.file_name())
        .map(|e| e.path())
}

/// Newest `*.log` in a directory by modification time.
fn newest_log(dir: &Path) -> Option<(PathBuf, SystemTime)> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().map(|ext| ext == "log").unwrap_or(false))
        .filter_map(|p| {
            let mtime = std::fs::metadata(&p).and_then(|m| m.modified()).ok()?;
            Some((p, mtime))
        })
        .max_by_key(|(_, mtime)| *mtime)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}

/// Best-effort filesystem watcher over the log root. Poll timers remain
/// the correctness signal when this fails or misses events.
fn start_watcher(root: &Path, tx: mpsc::Sender<()>) -> Option<RecommendedWatcher> {
    let mut watcher = match RecommendedWatcher::new(
        move |result: Result<notify::Event, notify::Error>| {
            if result.is_ok() {
                let _ = tx.try_send(());
            }
        },
        notify::Config::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, "Filesystem watcher unavailable, polling only");
            return None;
        }
    };

    if let Err(e) = watcher.watch(root, RecursiveMode::Recursive) {
        warn!(root = %root.display(), error = %e, "Failed to watch log root, polling only");
        return None;
    }

    Some(watcher)
}
