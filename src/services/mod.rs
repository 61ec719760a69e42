//! Services - progression logic and state management
//!
//! This module contains the engine components:
//! - `geo_stream` - Filtered location subscription with timeouts
//! - `progress` - Step and tour point progression
//! - `narration` - Speech playback control
//! - `map_layer` - Map resources for routes, tours and the user position
//! - `coordinator` - Session lifecycle and the event loop tying it together

pub mod coordinator;
pub mod geo_stream;
pub mod map_layer;
pub mod narration;
pub mod progress;
#[cfg(test)]
pub mod testing;

// Re-export commonly used types
pub use coordinator::{
    Collaborators, CoordinatorCommand, CoordinatorError, CoordinatorEvent, SessionState,
    TourSessionCoordinator,
};
pub use geo_stream::GeoStream;
pub use map_layer::MapLayer;
pub use narration::{NarrationConfig, NarrationController};
pub use progress::{FixQuality, ProgressConfig, ProgressTracker};
