//! Position sources - platform subscriptions that deliver location samples
//!
//! A source pushes samples (or failures) into the sink it was given until
//! `clear_watch` is called with the returned `WatchId`.
//!
//! `ReplaySource` plays back a JSON-lines recording, one sample per line:
//! `{"lat": 52.3791, "lng": 4.9003, "accuracy": 8.0, "delay_ms": 1000}`

use crate::domain::LocationFix;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Location could not be obtained
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeoError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable: {0}")]
    PositionUnavailable(String),
    #[error("no position within {0} ms")]
    Timeout(u64),
}

/// One delivery from a position source
pub type GeoEvent = Result<LocationFix, GeoError>;

/// Subscription options passed to the platform
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoOptions {
    pub high_accuracy: bool,
    /// Emit a timeout error when no sample arrives for this long; 0 disables
    pub timeout_ms: u64,
    /// Oldest cached sample the platform may hand back
    pub max_fix_age_ms: u64,
}

impl Default for GeoOptions {
    fn default() -> Self {
        Self { high_accuracy: true, timeout_ms: 5000, max_fix_age_ms: 0 }
    }
}

/// Handle of an active platform subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// Platform location service
pub trait PositionSource: Send + Sync {
    /// Begin delivering samples into `sink`
    fn watch(&self, options: &GeoOptions, sink: mpsc::Sender<GeoEvent>) -> WatchId;

    /// Release the subscription; unknown IDs are ignored
    fn clear_watch(&self, id: WatchId);
}

/// One recorded sample
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayEntry {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    /// Wait before delivering this sample
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_delay_ms() -> u64 {
    1000
}

/// Parse a JSON-lines recording, skipping blank lines and `#` comments
pub fn parse_replay(content: &str) -> Result<Vec<ReplayEntry>, String> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(n, line)| {
            serde_json::from_str(line).map_err(|e| format!("line {}: {}", n + 1, e))
        })
        .collect()
}

/// Plays a recorded track back, each watch from the beginning
pub struct ReplaySource {
    path: PathBuf,
    next_id: AtomicU64,
    watches: Mutex<HashMap<WatchId, JoinHandle<()>>>,
}

impl ReplaySource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            next_id: AtomicU64::new(1),
            watches: Mutex::new(HashMap::new()),
        }
    }

    async fn play(path: PathBuf, sink: mpsc::Sender<GeoEvent>) {
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(content) => parse_replay(&content),
            Err(e) => Err(e.to_string()),
        };
        let entries = match entries {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "replay_load_failed");
                let _ = sink.send(Err(GeoError::PositionUnavailable(e))).await;
                return;
            }
        };

        info!(path = %path.display(), samples = entries.len(), "replay_started");
        for entry in entries {
            tokio::time::sleep(Duration::from_millis(entry.delay_ms)).await;
            let fix = LocationFix::new(entry.lat, entry.lng, entry.accuracy);
            if sink.send(Ok(fix)).await.is_err() {
                return;
            }
        }
        info!(path = %path.display(), "replay_finished");
    }
}

impl PositionSource for ReplaySource {
    fn watch(&self, options: &GeoOptions, sink: mpsc::Sender<GeoEvent>) -> WatchId {
        let id = WatchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(watch_id = id.0, high_accuracy = options.high_accuracy, "replay_watch");
        let handle = tokio::spawn(Self::play(self.path.clone(), sink));
        self.watches.lock().insert(id, handle);
        id
    }

    fn clear_watch(&self, id: WatchId) {
        if let Some(handle) = self.watches.lock().remove(&id) {
            handle.abort();
        }
    }
}

impl Drop for ReplaySource {
    fn drop(&mut self) {
        for (_, handle) in self.watches.lock().drain() {
            handle.abort();
        }
    }
}
