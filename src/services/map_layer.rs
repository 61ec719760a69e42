//! Map resources owned by the engine
//!
//! Every marker and polyline drawn is remembered so it can be disposed when
//! the route changes or the session ends.

use crate::domain::{BoundingBox, LatLng, LocationFix, Route, TourPoint};
use crate::io::map::{MapCommand, MapSender, MarkerId, PolylineId};
use std::collections::HashSet;

pub struct MapLayer {
    sink: MapSender,
    markers: HashSet<MarkerId>,
    polylines: HashSet<PolylineId>,
}

impl MapLayer {
    pub fn new(sink: MapSender) -> Self {
        Self { sink, markers: HashSet::new(), polylines: HashSet::new() }
    }

    fn upsert(&mut self, id: MarkerId, position: LatLng, label: Option<String>, title: String) {
        self.markers.insert(id);
        self.sink.send(MapCommand::UpsertMarker { id, position, label, title, accuracy_m: None });
    }

    fn draw(&mut self, id: PolylineId, path: Vec<LatLng>) {
        self.polylines.insert(id);
        self.sink.send(MapCommand::DrawPolyline { id, path });
    }

    /// Move the "you are here" marker; recenter unless a route is on screen
    pub fn show_position(&mut self, fix: &LocationFix, follow: bool) {
        let position = fix.position();
        self.markers.insert(MarkerId::CurrentPosition);
        self.sink.send(MapCommand::UpsertMarker {
            id: MarkerId::CurrentPosition,
            position,
            label: None,
            title: "Your location".to_string(),
            accuracy_m: fix.accuracy_m,
        });
        if follow {
            self.sink.send(MapCommand::Center(position));
        }
    }

    /// Replace whatever route or tour is drawn with `route`
    pub fn show_route(&mut self, route: &Route, destination: LatLng) {
        self.clear_overlays();
        self.draw(PolylineId::Route, route.path());
        for (i, step) in route.steps.iter().enumerate() {
            self.upsert(
                MarkerId::RouteStep(i),
                step.start,
                Some((i + 1).to_string()),
                format!("Step {}", i + 1),
            );
        }
        self.upsert(MarkerId::Destination, destination, None, route.end_address.clone());
        self.sink.send(MapCommand::FitBounds(route.bounds));
    }

    /// Replace whatever route or tour is drawn with the tour points
    pub fn show_tour(&mut self, points: &[TourPoint]) {
        self.clear_overlays();
        if points.is_empty() {
            return;
        }
        self.draw(PolylineId::Tour, points.iter().map(TourPoint::position).collect());
        for (i, point) in points.iter().enumerate() {
            self.upsert(
                MarkerId::TourPoint(i),
                point.position(),
                Some((i + 1).to_string()),
                point.name.clone(),
            );
        }
        if let Some(bounds) = BoundingBox::from_points(points.iter().map(TourPoint::position)) {
            self.sink.send(MapCommand::FitBounds(bounds));
        }
    }

    /// Dispose everything, including the position marker
    pub fn clear(&mut self) {
        self.clear_overlays();
        if self.markers.remove(&MarkerId::CurrentPosition) {
            self.sink.send(MapCommand::RemoveMarker(MarkerId::CurrentPosition));
        }
    }

    /// Dispose route/tour drawings, keeping the position marker
    fn clear_overlays(&mut self) {
        let markers: Vec<MarkerId> =
            self.markers.iter().copied().filter(|m| *m != MarkerId::CurrentPosition).collect();
        for id in markers {
            self.markers.remove(&id);
            self.sink.send(MapCommand::RemoveMarker(id));
        }
        for id in self.polylines.drain() {
            self.sink.send(MapCommand::RemovePolyline(id));
        }
    }

    /// Resources currently on the map
    pub fn resource_count(&self) -> usize {
        self.markers.len() + self.polylines.len()
    }
}
