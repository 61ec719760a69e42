//! Cancellable stream of location fixes
//!
//! Wraps a `PositionSource` subscription. Adds the guarantees the platform
//! does not give: identical re-deliveries are suppressed, silence longer than
//! the configured timeout surfaces as `GeoError::Timeout`, and nothing is
//! delivered after `stop()`.

use crate::io::position::{GeoError, GeoEvent, GeoOptions, PositionSource, WatchId};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

const SINK_CAPACITY: usize = 16;

pub struct GeoStream {
    source: Arc<dyn PositionSource>,
    watch_id: Option<WatchId>,
    rx: mpsc::Receiver<GeoEvent>,
    timeout: Option<Duration>,
    deadline: Instant,
    /// Coordinates and capture time of the last delivered sample
    last_sample: Option<(f64, f64, DateTime<Utc>)>,
}

impl GeoStream {
    /// Subscribe to `source`; samples flow until `stop()` or drop
    pub fn start(source: Arc<dyn PositionSource>, options: GeoOptions) -> Self {
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        let watch_id = source.watch(&options, tx);
        let timeout = (options.timeout_ms > 0).then(|| Duration::from_millis(options.timeout_ms));
        info!(watch_id = watch_id.0, timeout_ms = options.timeout_ms, "geo_stream_started");
        Self {
            source,
            watch_id: Some(watch_id),
            rx,
            timeout,
            deadline: Instant::now() + timeout.unwrap_or_default(),
            last_sample: None,
        }
    }

    /// Next fix or failure. `None` once stopped or the source closed.
    ///
    /// Cancel safe: dropping the future loses no sample.
    pub async fn next(&mut self) -> Option<GeoEvent> {
        loop {
            self.watch_id?;

            let received = match self.timeout {
                Some(timeout) => {
                    match tokio::time::timeout_at(self.deadline, self.rx.recv()).await {
                        Ok(received) => received,
                        Err(_) => {
                            self.deadline = Instant::now() + timeout;
                            return Some(Err(GeoError::Timeout(timeout.as_millis() as u64)));
                        }
                    }
                }
                None => self.rx.recv().await,
            };

            let Some(event) = received else {
                info!("geo_source_closed");
                self.watch_id = None;
                return None;
            };

            if let Some(timeout) = self.timeout {
                self.deadline = Instant::now() + timeout;
            }

            if let Ok(fix) = &event {
                let sample = (fix.latitude, fix.longitude, fix.captured_at);
                if self.last_sample == Some(sample) {
                    debug!("geo_duplicate_suppressed");
                    continue;
                }
                self.last_sample = Some(sample);
            }
            return Some(event);
        }
    }

    /// Release the subscription and discard anything buffered
    pub fn stop(&mut self) {
        if let Some(id) = self.watch_id.take() {
            self.source.clear_watch(id);
            info!(watch_id = id.0, "geo_stream_stopped");
        }
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }

    pub fn is_active(&self) -> bool {
        self.watch_id.is_some()
    }
}

impl Drop for GeoStream {
    fn drop(&mut self) {
        self.stop();
    }
}
