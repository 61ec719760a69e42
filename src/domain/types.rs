//! Shared types for the tour guide

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Newtype wrapper for backend tour session IDs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for tour route IDs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteId(pub String);

impl std::fmt::Display for RouteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for tour point IDs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PointId(pub String);

impl std::fmt::Display for PointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// WGS84 coordinate pair in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    #[inline]
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

impl std::str::FromStr for LatLng {
    type Err = String;

    /// Parse `"lat,lng"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lat, lng) = s.split_once(',').ok_or_else(|| format!("expected LAT,LNG, got {s}"))?;
        let lat: f64 = lat.trim().parse().map_err(|e| format!("invalid latitude: {e}"))?;
        let lng: f64 = lng.trim().parse().map_err(|e| format!("invalid longitude: {e}"))?;
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
            return Err(format!("coordinate out of range: {lat},{lng}"));
        }
        Ok(Self { lat, lng })
    }
}

/// A single position sample. Superseded by the next one, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius; `None` when the platform did not report one
    pub accuracy_m: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

impl LocationFix {
    /// Create a fix captured now
    pub fn new(latitude: f64, longitude: f64, accuracy_m: Option<f64>) -> Self {
        Self { latitude, longitude, accuracy_m, captured_at: Utc::now() }
    }

    #[inline]
    pub fn position(&self) -> LatLng {
        LatLng::new(self.latitude, self.longitude)
    }

    /// Age of the fix relative to `now`, clamped at zero for clock skew
    #[inline]
    pub fn age_ms(&self, now: DateTime<Utc>) -> u64 {
        u64::try_from((now - self.captured_at).num_milliseconds()).unwrap_or(0)
    }
}

/// Rectangular viewport, as returned by the directions provider
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub northeast: LatLng,
    pub southwest: LatLng,
}

impl BoundingBox {
    /// Smallest box containing every point, or `None` for an empty input
    pub fn from_points<I: IntoIterator<Item = LatLng>>(points: I) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut bounds = Self { northeast: first, southwest: first };
        for p in iter {
            bounds.extend(p);
        }
        Some(bounds)
    }

    pub fn extend(&mut self, p: LatLng) {
        self.northeast.lat = self.northeast.lat.max(p.lat);
        self.northeast.lng = self.northeast.lng.max(p.lng);
        self.southwest.lat = self.southwest.lat.min(p.lat);
        self.southwest.lng = self.southwest.lng.min(p.lng);
    }
}

/// One turn-by-turn instruction of a route
#[derive(Debug, Clone, PartialEq)]
pub struct RouteStep {
    pub start: LatLng,
    pub end: LatLng,
    /// Display text, may contain simple markup (`<b>`, `<div>`)
    pub instruction: String,
    pub distance_m: u32,
    pub distance_text: String,
    pub duration_s: u32,
    pub duration_text: String,
    pub maneuver: Option<String>,
}

/// A computed driving/walking route
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub steps: Vec<RouteStep>,
    pub bounds: BoundingBox,
    pub total_distance_text: String,
    pub total_duration_text: String,
    pub start_address: String,
    pub end_address: String,
}

impl Route {
    /// Polyline path through every step's start and end point
    pub fn path(&self) -> Vec<LatLng> {
        self.steps.iter().flat_map(|s| [s.start, s.end]).collect()
    }
}

/// Travel mode accepted by the directions provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TravelMode {
    #[default]
    Driving,
    Walking,
    Bicycling,
    Transit,
}

impl TravelMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TravelMode::Driving => "driving",
            TravelMode::Walking => "walking",
            TravelMode::Bicycling => "bicycling",
            TravelMode::Transit => "transit",
        }
    }
}

impl std::str::FromStr for TravelMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "driving" => Ok(TravelMode::Driving),
            "walking" => Ok(TravelMode::Walking),
            "bicycling" => Ok(TravelMode::Bicycling),
            "transit" => Ok(TravelMode::Transit),
            other => Err(format!("unknown travel mode: {other}")),
        }
    }
}

/// Directions request issued on `calculate_route`
#[derive(Debug, Clone, PartialEq)]
pub struct RouteRequest {
    pub origin: LatLng,
    pub destination: LatLng,
    pub travel_mode: TravelMode,
    pub language: String,
}

/// A point of interest on a tour route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TourPoint {
    pub id: PointId,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub order: i32,
    #[serde(rename = "trigger_radius", default = "default_trigger_radius")]
    pub trigger_radius_m: f64,
}

fn default_trigger_radius() -> f64 {
    50.0
}

impl TourPoint {
    #[inline]
    pub fn position(&self) -> LatLng {
        LatLng::new(self.latitude, self.longitude)
    }
}

/// A selectable tour, listing its points by ID
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TourRoute {
    pub id: RouteId,
    pub name: String,
    #[serde(default)]
    pub description: HashMap<String, String>,
    #[serde(rename = "tour_points", default)]
    pub point_ids: Vec<PointId>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl TourRoute {
    /// Description in `language`, falling back to English
    pub fn description_for(&self, language: &str) -> Option<&str> {
        self.description.get(language).or_else(|| self.description.get("en")).map(String::as_str)
    }
}

/// Backend tour session; its ID keys every session call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TourSession {
    pub id: SessionId,
    pub route_id: RouteId,
    pub user_id: String,
    #[serde(rename = "current_language")]
    pub language: String,
    #[serde(rename = "started_at", default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Current-content response: the point the backend considers current
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentContent {
    /// 1-based position of the current point
    pub progress: u32,
    pub total_points: u32,
    #[serde(default)]
    pub point: Option<TourPoint>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub audio_content: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl CurrentContent {
    /// Narration text, if the backend supplied any
    pub fn narration_text(&self) -> Option<&str> {
        self.audio_content.as_deref().filter(|s| !s.trim().is_empty())
    }

    /// The backend has no further point to present
    pub fn is_complete(&self) -> bool {
        self.point.is_none() && self.progress >= self.total_points
    }
}

/// Which kind of progression is active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    Idle,
    Navigation,
    Tour,
    /// Terminal: the last step or point was reached
    Arrived,
}

impl ProgressMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressMode::Idle => "idle",
            ProgressMode::Navigation => "navigation",
            ProgressMode::Tour => "tour",
            ProgressMode::Arrived => "arrived",
        }
    }
}

/// Snapshot of where the user is along the active route or tour
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressState {
    pub mode: ProgressMode,
    pub current_index: usize,
    pub total_count: usize,
    pub current_content: Option<CurrentContent>,
}

impl ProgressState {
    pub fn idle() -> Self {
        Self { mode: ProgressMode::Idle, current_index: 0, total_count: 0, current_content: None }
    }
}

/// Narration playback flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaybackState {
    pub is_playing: bool,
    pub is_muted: bool,
}

/// A language the backend can narrate in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Language {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub flag: String,
}
