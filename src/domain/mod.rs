//! Domain models - core types shared by every component
//!
//! This module contains the canonical data types used throughout the system:
//! - `LocationFix` - a single position sample
//! - `Route` / `RouteStep` - turn-by-turn navigation geometry
//! - `TourRoute` / `TourPoint` / `TourSession` - guided tour model
//! - `ProgressState` / `PlaybackState` - observable engine state
//! - `geo` - distance helpers

pub mod geo;
pub mod types;

pub use types::{
    BoundingBox, CurrentContent, Language, LatLng, LocationFix, PlaybackState, PointId,
    ProgressMode, ProgressState, Route, RouteId, RouteRequest, RouteStep, SessionId, TourPoint,
    TourRoute, TourSession, TravelMode,
};
