//! IO modules - external system interfaces
//!
//! This module contains every collaborator the engine talks to:
//! - `backend` - REST client for tours, sessions, directions and languages
//! - `position` - Platform location subscriptions (replay from file)
//! - `speech` - Text-to-speech engines (log, external command)
//! - `map` - Typed channel for map renderer commands
//! - `mock_backend` - Local HTTP tour backend serving bundled sample data

pub mod backend;
pub mod map;
pub mod mock_backend;
pub mod position;
pub mod speech;

pub use backend::{BackendError, DirectionsProvider, HttpBackend, TourBackend};
pub use map::{create_map_channel, MapCommand, MapSender, MarkerId, PolylineId};
pub use position::{GeoError, GeoEvent, GeoOptions, PositionSource, ReplaySource, WatchId};
pub use speech::{CommandSpeechEngine, LogSpeechEngine, SpeechEngine, SpeechError, Utterance};
