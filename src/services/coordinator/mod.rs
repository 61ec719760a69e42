//! Tour session coordination and the engine event loop
//!
//! The coordinator ties everything together:
//! - Session lifecycle against the backend (create, push, fetch, end)
//! - GeoStream → ProgressTracker → NarrationController per fix
//! - Map resources for the active route or tour
//!
//! It is the only owner of progress and playback state. Backend calls run on
//! spawned tasks and report back through a channel; every reply carries the
//! session generation it was issued under, and replies from an older
//! generation are dropped.

mod handlers;
#[cfg(test)]
mod tests;

use crate::domain::{
    CurrentContent, LatLng, LocationFix, PlaybackState, PointId, ProgressState, RouteId,
    SessionId, TourSession, TravelMode,
};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::backend::{BackendError, DirectionsProvider, TourBackend};
use crate::io::map::MapSender;
use crate::io::position::{GeoError, GeoEvent, GeoOptions, PositionSource};
use crate::io::speech::{SpeechEngine, SpeechError};
use crate::services::geo_stream::GeoStream;
use crate::services::map_layer::MapLayer;
use crate::services::narration::{NarrationConfig, NarrationController, SpeechDone};
use crate::services::progress::{FixQuality, ProgressConfig, ProgressTracker};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

const REPLY_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NoSession,
    Starting,
    Active,
    Ended,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::NoSession => "no_session",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Ended => "ended",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoordinatorError {
    #[error("location unavailable: {0}")]
    LocationUnavailable(#[from] GeoError),
    #[error("{0}")]
    Precondition(&'static str),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[from] BackendError),
    #[error("speech unavailable: {0}")]
    SpeechUnavailable(#[from] SpeechError),
}

/// Requests from the user interface
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorCommand {
    SelectRoute(RouteId),
    /// Start a tour on the selected route from the current position
    StartTour,
    SelectDestination(LatLng),
    /// Navigate from the current position to the selected destination
    CalculateRoute { travel_mode: TravelMode },
    TogglePlay,
    ToggleMute,
    SetLanguage(String),
    EndTour,
    Shutdown,
}

/// Observable changes, for presentation
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    SessionStarted { session_id: SessionId, total_points: usize },
    SessionEnded,
    NavigationStarted { steps: usize, distance: String, duration: String },
    Position(LocationFix),
    Progress(ProgressState),
    Playback(PlaybackState),
    Arrived,
    Error(CoordinatorError),
}

/// External services the coordinator drives
#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn TourBackend>,
    pub directions: Arc<dyn DirectionsProvider>,
    pub source: Arc<dyn PositionSource>,
    pub speech: Arc<dyn SpeechEngine>,
    pub map: MapSender,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyKind {
    /// Location push followed by a content fetch
    Sync,
    /// Content fetch without a push (session start, language change)
    Refresh,
}

#[derive(Debug)]
pub(crate) struct BackendReply {
    pub(crate) generation: u64,
    pub(crate) kind: ReplyKind,
    /// Narration language the content was requested in
    pub(crate) language: String,
    pub(crate) result: Result<CurrentContent, BackendError>,
}

/// One unit of internal work for the event loop
#[derive(Debug)]
pub(crate) enum Work {
    Geo(Option<GeoEvent>),
    Reply(BackendReply),
    Speech(SpeechDone),
    InitialFetch,
}

pub struct TourSessionCoordinator {
    pub(crate) config: Config,
    pub(crate) backend: Arc<dyn TourBackend>,
    pub(crate) directions: Arc<dyn DirectionsProvider>,
    pub(crate) source: Arc<dyn PositionSource>,
    pub(crate) tracker: ProgressTracker,
    pub(crate) narration: NarrationController,
    pub(crate) map: MapLayer,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) geo: Option<GeoStream>,
    pub(crate) state: SessionState,
    pub(crate) session: Option<TourSession>,
    pub(crate) selected_route: Option<RouteId>,
    pub(crate) destination: Option<LatLng>,
    /// Bumped whenever a session starts or ends
    pub(crate) generation: u64,
    /// A push+fetch is outstanding
    pub(crate) sync_in_flight: bool,
    /// Newest reliable fix waiting for the outstanding sync
    pub(crate) pending_fix: Option<LocationFix>,
    pub(crate) initial_fetch_at: Option<Instant>,
    /// Point whose narration was last announced
    pub(crate) narrated_point: Option<PointId>,
    pub(crate) session_tasks: Vec<JoinHandle<()>>,
    pub(crate) reply_tx: mpsc::Sender<BackendReply>,
    reply_rx: mpsc::Receiver<BackendReply>,
    speech_rx: mpsc::Receiver<SpeechDone>,
    events: Option<mpsc::Sender<CoordinatorEvent>>,
}

impl TourSessionCoordinator {
    pub fn new(
        config: Config,
        collaborators: Collaborators,
        metrics: Arc<Metrics>,
        events: Option<mpsc::Sender<CoordinatorEvent>>,
    ) -> Self {
        let (narration, speech_rx) = NarrationController::new(
            collaborators.speech,
            NarrationConfig::from(&config),
            metrics.clone(),
        );
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_CAPACITY);
        Self {
            tracker: ProgressTracker::new(ProgressConfig::from(&config)),
            narration,
            map: MapLayer::new(collaborators.map),
            backend: collaborators.backend,
            directions: collaborators.directions,
            source: collaborators.source,
            metrics,
            config,
            geo: None,
            state: SessionState::NoSession,
            session: None,
            selected_route: None,
            destination: None,
            generation: 0,
            sync_in_flight: false,
            pending_fix: None,
            initial_fetch_at: None,
            narrated_point: None,
            session_tasks: Vec::new(),
            reply_tx,
            reply_rx,
            speech_rx,
            events,
        }
    }

    /// Process commands and internal work until `Shutdown` or the command
    /// channel closes
    pub async fn run(&mut self, mut cmd_rx: mpsc::Receiver<CoordinatorCommand>) {
        info!(config = %self.config.config_file(), "coordinator_started");
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(CoordinatorCommand::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }
                work = self.next_work() => {
                    self.handle_work(work).await;
                }
            }
        }
        self.shutdown();
    }

    /// Wait for the next piece of internal work. Cancel safe.
    pub(crate) async fn next_work(&mut self) -> Work {
        tokio::select! {
            event = next_geo_event(self.geo.as_mut()) => Work::Geo(event),
            Some(reply) = self.reply_rx.recv() => Work::Reply(reply),
            Some(done) = self.speech_rx.recv() => Work::Speech(done),
            _ = grace_elapsed(self.initial_fetch_at) => Work::InitialFetch,
        }
    }

    pub(crate) async fn handle_work(&mut self, work: Work) {
        match work {
            Work::Geo(Some(event)) => self.handle_geo_event(event),
            Work::Geo(None) => {
                self.geo = None;
            }
            Work::Reply(reply) => self.handle_reply(reply),
            Work::Speech(done) => {
                if let Some(err) = self.narration.on_finished(done) {
                    self.emit(CoordinatorEvent::Error(err.into()));
                }
            }
            Work::InitialFetch => {
                self.initial_fetch_at = None;
                self.spawn_refresh();
            }
        }
    }

    async fn handle_command(&mut self, cmd: CoordinatorCommand) {
        let result = match cmd {
            CoordinatorCommand::SelectRoute(route_id) => {
                info!(route_id = %route_id, "route_selected");
                self.selected_route = Some(route_id);
                Ok(())
            }
            CoordinatorCommand::StartTour => match self.selected_route.clone() {
                None => Err(CoordinatorError::Precondition("no tour route selected")),
                Some(route_id) => match self.current_fix().await {
                    Ok(fix) => self.start_tour(Some(route_id), Some(fix)).await,
                    Err(e) => Err(e),
                },
            },
            CoordinatorCommand::SelectDestination(destination) => {
                self.destination = Some(destination);
                Ok(())
            }
            CoordinatorCommand::CalculateRoute { travel_mode } => match self.destination {
                None => Err(CoordinatorError::Precondition("no destination selected")),
                Some(destination) => match self.current_fix().await {
                    Ok(fix) => self.calculate_route(Some(fix), Some(destination), travel_mode).await,
                    Err(e) => Err(e),
                },
            },
            CoordinatorCommand::TogglePlay => {
                let playback = self.narration.toggle_play();
                self.emit(CoordinatorEvent::Playback(playback));
                Ok(())
            }
            CoordinatorCommand::ToggleMute => {
                let playback = self.narration.toggle_mute();
                self.emit(CoordinatorEvent::Playback(playback));
                Ok(())
            }
            CoordinatorCommand::SetLanguage(code) => {
                self.set_language(&code);
                Ok(())
            }
            CoordinatorCommand::EndTour => {
                self.end_tour();
                Ok(())
            }
            CoordinatorCommand::Shutdown => {
                self.shutdown();
                Ok(())
            }
        };
        if let Err(e) = result {
            log_command_failed(&e);
            self.emit(CoordinatorEvent::Error(e));
        }
    }

    /// Last known fix unless it is stale, else a fresh one from a one-off
    /// subscription
    pub async fn current_fix(&mut self) -> Result<LocationFix, CoordinatorError> {
        if let Some(fix) = self.tracker.last_fix() {
            if self.tracker.classify(fix, Utc::now()) != FixQuality::Stale {
                return Ok(fix.clone());
            }
        }
        self.locate().await
    }

    /// First fix from a temporary subscription
    pub async fn locate(&mut self) -> Result<LocationFix, CoordinatorError> {
        let mut stream = GeoStream::start(self.source.clone(), self.geo_options());
        let event = stream.next().await;
        stream.stop();
        match event {
            Some(Ok(fix)) => {
                self.metrics.record_fix_received();
                self.tracker.advance(&fix);
                self.map.show_position(&fix, true);
                self.emit(CoordinatorEvent::Position(fix.clone()));
                Ok(fix)
            }
            Some(Err(e)) => Err(e.into()),
            None => Err(GeoError::PositionUnavailable("position source closed".to_string()).into()),
        }
    }

    pub(crate) fn geo_options(&self) -> GeoOptions {
        GeoOptions {
            high_accuracy: self.config.geo_high_accuracy(),
            timeout_ms: self.config.geo_timeout_ms(),
            max_fix_age_ms: self.config.max_fix_age_ms(),
        }
    }

    pub(crate) fn start_geo(&mut self) {
        if self.geo.as_ref().is_some_and(GeoStream::is_active) {
            return;
        }
        self.geo = Some(GeoStream::start(self.source.clone(), self.geo_options()));
    }

    pub(crate) fn stop_geo(&mut self) {
        if let Some(mut geo) = self.geo.take() {
            geo.stop();
        }
    }

    pub(crate) fn emit(&self, event: CoordinatorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.try_send(event);
        }
    }

    pub fn session_state(&self) -> SessionState {
        self.state
    }

    pub fn session(&self) -> Option<&TourSession> {
        self.session.as_ref()
    }

    pub fn progress(&self) -> &ProgressState {
        self.tracker.state()
    }

    pub fn playback(&self) -> PlaybackState {
        self.narration.state()
    }

    pub fn is_tracking(&self) -> bool {
        self.geo.as_ref().is_some_and(GeoStream::is_active)
    }

    pub fn language(&self) -> &str {
        self.narration.language()
    }
}

async fn next_geo_event(geo: Option<&mut GeoStream>) -> Option<GeoEvent> {
    match geo {
        Some(geo) => geo.next().await,
        None => std::future::pending().await,
    }
}

async fn grace_elapsed(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cold]
fn log_command_failed(e: &CoordinatorError) {
    warn!(error = %e, "command_failed");
}
