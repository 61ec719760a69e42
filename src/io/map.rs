//! Typed channel for map renderer commands
//!
//! The renderer is write-only from the engine's side: commands go out over a
//! bounded mpsc channel and nothing is read back. A full channel drops the
//! command rather than blocking the coordinator.

use crate::domain::{BoundingBox, LatLng};
use crate::infra::metrics::Metrics;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Identity of a marker owned by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerId {
    CurrentPosition,
    Destination,
    /// Numbered navigation step marker (0-based step index)
    RouteStep(usize),
    /// Numbered tour point marker (0-based position in the tour)
    TourPoint(usize),
}

/// Identity of a polyline owned by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolylineId {
    Route,
    Tour,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MapCommand {
    /// Create or move a marker
    UpsertMarker {
        id: MarkerId,
        position: LatLng,
        label: Option<String>,
        title: String,
        /// Accuracy circle radius, drawn around the current position
        accuracy_m: Option<f64>,
    },
    RemoveMarker(MarkerId),
    DrawPolyline { id: PolylineId, path: Vec<LatLng> },
    RemovePolyline(PolylineId),
    FitBounds(BoundingBox),
    Center(LatLng),
}

/// Sending half of the map channel. Clone to share.
#[derive(Clone)]
pub struct MapSender {
    tx: mpsc::Sender<MapCommand>,
    metrics: Arc<Metrics>,
}

impl MapSender {
    pub fn new(tx: mpsc::Sender<MapCommand>, metrics: Arc<Metrics>) -> Self {
        Self { tx, metrics }
    }

    /// Queue a command without blocking; dropped if the renderer is behind
    pub fn send(&self, cmd: MapCommand) {
        if let Err(e) = self.tx.try_send(cmd) {
            self.metrics.record_map_command_dropped();
            log_map_command_dropped(&e);
        }
    }
}

#[cold]
fn log_map_command_dropped(e: &mpsc::error::TrySendError<MapCommand>) {
    warn!(error = %e, "map_command_dropped");
}

/// Create a new map channel pair
pub fn create_map_channel(
    buffer_size: usize,
    metrics: Arc<Metrics>,
) -> (MapSender, mpsc::Receiver<MapCommand>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (MapSender::new(tx, metrics), rx)
}

/// Renderer for headless runs: writes every command to the debug log
pub async fn run_log_renderer(mut rx: mpsc::Receiver<MapCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            MapCommand::UpsertMarker { id, position, label, accuracy_m, .. } => {
                debug!(
                    marker = ?id,
                    lat = position.lat,
                    lng = position.lng,
                    label = label.as_deref().unwrap_or(""),
                    accuracy_m = accuracy_m.unwrap_or(0.0),
                    "map_marker"
                );
            }
            MapCommand::RemoveMarker(id) => debug!(marker = ?id, "map_marker_removed"),
            MapCommand::DrawPolyline { id, path } => {
                debug!(polyline = ?id, points = path.len(), "map_polyline")
            }
            MapCommand::RemovePolyline(id) => debug!(polyline = ?id, "map_polyline_removed"),
            MapCommand::FitBounds(b) => debug!(
                ne_lat = b.northeast.lat,
                ne_lng = b.northeast.lng,
                sw_lat = b.southwest.lat,
                sw_lng = b.southwest.lng,
                "map_fit_bounds"
            ),
            MapCommand::Center(p) => debug!(lat = p.lat, lng = p.lng, "map_center"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_channel_drops_and_counts() {
        let metrics = Arc::new(Metrics::new());
        let (sender, mut rx) = create_map_channel(1, metrics.clone());

        sender.send(MapCommand::Center(LatLng::new(52.0, 4.0)));
        sender.send(MapCommand::Center(LatLng::new(53.0, 5.0)));

        assert_eq!(metrics.report().map_commands_dropped, 1);
        assert_eq!(rx.try_recv().unwrap(), MapCommand::Center(LatLng::new(52.0, 4.0)));
        assert!(rx.try_recv().is_err());
    }
}
