//! Session operations and event handlers for the coordinator
//!
//! Each handler runs on the coordinator loop and never blocks it on the
//! backend except where the operation itself must wait (session creation,
//! directions).

use super::{
    BackendReply, CoordinatorError, CoordinatorEvent, ReplyKind, SessionState,
    TourSessionCoordinator,
};
use crate::domain::{
    CurrentContent, LatLng, LocationFix, ProgressMode, RouteId, RouteRequest, TourPoint,
    TourSession, TravelMode,
};
use crate::io::backend::BackendError;
use crate::io::position::{GeoError, GeoEvent};
use crate::services::progress::FixQuality;
use chrono::Utc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

impl TourSessionCoordinator {
    /// Create a backend session for `route_id` and start tracking
    ///
    /// On failure the coordinator returns to the state it was in and the
    /// call may be retried. An active session is ended first.
    pub async fn start_tour(
        &mut self,
        route_id: Option<RouteId>,
        fix: Option<LocationFix>,
    ) -> Result<(), CoordinatorError> {
        let route_id = route_id.ok_or(CoordinatorError::Precondition("no tour route selected"))?;
        let fix = fix.ok_or(CoordinatorError::Precondition("current location unknown"))?;
        if self.state == SessionState::Starting {
            return Err(CoordinatorError::Precondition("tour is already starting"));
        }
        if self.state == SessionState::Active {
            self.end_tour();
        }

        let previous = self.state;
        self.state = SessionState::Starting;
        let user_id = format!("{}_{}", self.config.user_prefix(), Utc::now().timestamp_millis());
        let language = self.narration.language().to_string();

        let started = Instant::now();
        let result = self.open_session(&route_id, &user_id, &language).await;
        self.metrics.record_backend_request(started.elapsed().as_millis() as u64, result.is_ok());

        let (session, points) = match result {
            Ok(opened) => opened,
            Err(e) => {
                self.state = previous;
                warn!(route_id = %route_id, error = %e, "tour_start_failed");
                return Err(e.into());
            }
        };

        self.generation += 1;
        self.state = SessionState::Active;
        self.selected_route = Some(route_id.clone());
        self.sync_in_flight = false;
        self.pending_fix = None;
        self.narrated_point = None;

        if self.tracker.route().is_some() {
            info!("navigation_replaced_by_tour");
            self.destination = None;
        }
        self.tracker.start_tour(points.len());
        self.tracker.advance(&fix);
        self.map.show_tour(&points);
        self.map.show_position(&fix, false);
        self.narration.stop();
        self.narration.set_playing(true);
        self.start_geo();
        self.initial_fetch_at = Some(
            tokio::time::Instant::now()
                + Duration::from_millis(self.config.initial_fetch_grace_ms()),
        );

        info!(
            session_id = %session.id,
            route_id = %route_id,
            user_id = %session.user_id,
            points = points.len(),
            "tour_started"
        );
        self.emit(CoordinatorEvent::SessionStarted {
            session_id: session.id.clone(),
            total_points: points.len(),
        });
        self.emit(CoordinatorEvent::Playback(self.narration.state()));
        self.emit(CoordinatorEvent::Progress(self.tracker.state().clone()));
        self.session = Some(session);
        Ok(())
    }

    async fn open_session(
        &self,
        route_id: &RouteId,
        user_id: &str,
        language: &str,
    ) -> Result<(TourSession, Vec<TourPoint>), BackendError> {
        let session = self.backend.create_session(route_id, user_id, language).await?;
        let points = self.backend.fetch_route_points(route_id).await?;
        Ok((session, points))
    }

    /// Request directions and switch to turn-by-turn navigation
    ///
    /// A running tour is ended once the route is known; a failed request
    /// leaves everything as it was.
    pub async fn calculate_route(
        &mut self,
        origin: Option<LocationFix>,
        destination: Option<LatLng>,
        travel_mode: TravelMode,
    ) -> Result<(), CoordinatorError> {
        let origin = origin.ok_or(CoordinatorError::Precondition("current location unknown"))?;
        let destination =
            destination.ok_or(CoordinatorError::Precondition("no destination selected"))?;

        let request = RouteRequest {
            origin: origin.position(),
            destination,
            travel_mode,
            language: self.narration.language().to_string(),
        };
        let started = Instant::now();
        let result = self.directions.calculate_route(&request).await;
        self.metrics.record_backend_request(started.elapsed().as_millis() as u64, result.is_ok());
        let route = result?;

        if self.state == SessionState::Active {
            self.end_tour();
        }
        self.stop_geo();
        self.destination = Some(destination);

        self.map.show_route(&route, destination);
        self.map.show_position(&origin, false);
        let first_instruction = route.steps.first().map(|s| s.instruction.clone());
        let (steps, distance, duration) =
            (route.steps.len(), route.total_distance_text.clone(), route.total_duration_text.clone());
        self.tracker.start_navigation(route);

        self.narration.set_current(None);
        self.narration.set_playing(true);
        if let Some(text) = first_instruction {
            self.narration.announce(&text);
        }
        self.start_geo();

        info!(
            steps = steps,
            distance = %distance,
            duration = %duration,
            mode = travel_mode.as_str(),
            "navigation_route_ready"
        );
        self.emit(CoordinatorEvent::NavigationStarted { steps, distance, duration });
        self.emit(CoordinatorEvent::Playback(self.narration.state()));
        self.emit(CoordinatorEvent::Progress(self.tracker.state().clone()));
        if self.tracker.state().mode == ProgressMode::Arrived {
            self.emit(CoordinatorEvent::Arrived);
        }
        Ok(())
    }

    /// Stop tracking and narration, dispose the map, and drop the session.
    /// Replies still in flight are discarded when they arrive.
    pub fn end_tour(&mut self) {
        self.stop_geo();
        self.narration.stop();
        for task in self.session_tasks.drain(..) {
            task.abort();
        }
        self.generation += 1;
        self.sync_in_flight = false;
        self.pending_fix = None;
        self.initial_fetch_at = None;
        self.narrated_point = None;
        self.tracker.reset();
        self.map.clear();

        let session = self.session.take();
        if matches!(self.state, SessionState::Active | SessionState::Starting) {
            self.state = SessionState::Ended;
        }
        info!(
            session_id = %session.as_ref().map(|s| s.id.0.as_str()).unwrap_or("none"),
            state = self.state.as_str(),
            "tour_ended"
        );
        self.emit(CoordinatorEvent::SessionEnded);
        self.emit(CoordinatorEvent::Playback(self.narration.state()));
        self.emit(CoordinatorEvent::Progress(self.tracker.state().clone()));
    }

    /// End everything; safe to call more than once
    pub fn shutdown(&mut self) {
        if self.session.is_some() || self.geo.is_some() || self.narration.is_speaking() {
            self.end_tour();
        }
        info!("coordinator_shutdown");
    }

    /// Switch narration language; an active tour refetches its content
    pub fn set_language(&mut self, code: &str) {
        if code == self.narration.language() {
            return;
        }
        self.narration.set_language(code);
        info!(language = %code, "language_changed");
        if self.state == SessionState::Active && self.initial_fetch_at.is_none() {
            self.spawn_refresh();
        }
    }

    pub(crate) fn handle_geo_event(&mut self, event: GeoEvent) {
        match event {
            Ok(fix) => self.handle_fix(fix),
            Err(e) => {
                log_geo_error(&e);
                self.emit(CoordinatorEvent::Error(e.into()));
            }
        }
    }

    fn handle_fix(&mut self, fix: LocationFix) {
        self.metrics.record_fix_received();
        let quality = self.tracker.classify(&fix, Utc::now());
        if quality != FixQuality::Reliable {
            self.metrics.record_fix_unreliable();
        }

        let before = self.tracker.state().clone();
        let after = self.tracker.advance(&fix).clone();
        let navigating = self.tracker.route().is_some();
        self.map.show_position(&fix, !navigating);
        self.emit(CoordinatorEvent::Position(fix.clone()));

        if navigating {
            if after.mode == ProgressMode::Arrived && before.mode != ProgressMode::Arrived {
                self.metrics.record_step_advanced();
                info!("destination_reached");
                self.emit(CoordinatorEvent::Progress(after));
                self.emit(CoordinatorEvent::Arrived);
            } else if after.current_index != before.current_index {
                self.metrics.record_step_advanced();
                if let Some(step) = self.tracker.current_step() {
                    let text = step.instruction.clone();
                    self.narration.announce(&text);
                }
                self.emit(CoordinatorEvent::Progress(after));
            }
            return;
        }

        if self.state == SessionState::Active
            && after.mode == ProgressMode::Tour
            && quality == FixQuality::Reliable
        {
            self.enqueue_sync(fix);
        }
    }

    /// Push `fix` now, or hold it until the outstanding sync completes
    fn enqueue_sync(&mut self, fix: LocationFix) {
        if self.sync_in_flight {
            if self.pending_fix.replace(fix).is_some() {
                self.metrics.record_fix_dropped();
                debug!("pending_fix_superseded");
            }
            return;
        }
        self.spawn_sync(fix);
    }

    fn spawn_sync(&mut self, fix: LocationFix) {
        let Some(session) = &self.session else {
            return;
        };
        self.sync_in_flight = true;

        let backend = self.backend.clone();
        let metrics = self.metrics.clone();
        let reply_tx = self.reply_tx.clone();
        let session_id = session.id.clone();
        let language = self.narration.language().to_string();
        let generation = self.generation;

        self.prune_tasks();
        self.session_tasks.push(tokio::spawn(async move {
            let started = Instant::now();
            let pushed = backend.push_location(&session_id, &fix).await;
            metrics.record_backend_request(started.elapsed().as_millis() as u64, pushed.is_ok());
            let result = match pushed {
                Ok(()) => {
                    let started = Instant::now();
                    let fetched = backend.fetch_current_content(&session_id, &language).await;
                    metrics.record_backend_request(
                        started.elapsed().as_millis() as u64,
                        fetched.is_ok(),
                    );
                    fetched
                }
                Err(e) => Err(e),
            };
            let _ = reply_tx
                .send(BackendReply { generation, kind: ReplyKind::Sync, language, result })
                .await;
        }));
    }

    /// Fetch current content without pushing a location
    pub(crate) fn spawn_refresh(&mut self) {
        let Some(session) = &self.session else {
            return;
        };

        let backend = self.backend.clone();
        let metrics = self.metrics.clone();
        let reply_tx = self.reply_tx.clone();
        let session_id = session.id.clone();
        let language = self.narration.language().to_string();
        let generation = self.generation;

        self.prune_tasks();
        self.session_tasks.push(tokio::spawn(async move {
            let started = Instant::now();
            let result = backend.fetch_current_content(&session_id, &language).await;
            metrics.record_backend_request(started.elapsed().as_millis() as u64, result.is_ok());
            let _ = reply_tx
                .send(BackendReply { generation, kind: ReplyKind::Refresh, language, result })
                .await;
        }));
    }

    fn prune_tasks(&mut self) {
        self.session_tasks.retain(|task| !task.is_finished());
    }

    pub(crate) fn handle_reply(&mut self, reply: BackendReply) {
        if reply.generation != self.generation {
            debug!(
                reply_generation = reply.generation,
                generation = self.generation,
                "stale_reply_discarded"
            );
            return;
        }
        if reply.kind == ReplyKind::Sync {
            self.sync_in_flight = false;
        }

        match reply.result {
            Ok(content) => {
                let current_language = reply.language == self.narration.language();
                self.apply_content(content, current_language);
            }
            Err(e) => {
                log_backend_error(&e);
                self.emit(CoordinatorEvent::Error(e.into()));
            }
        }

        if reply.kind == ReplyKind::Sync
            && self.state == SessionState::Active
            && self.tracker.state().mode == ProgressMode::Tour
        {
            if let Some(fix) = self.pending_fix.take() {
                self.spawn_sync(fix);
            }
        }
    }

    /// Apply backend content; text requested in a language other than the
    /// current one updates progress only
    fn apply_content(&mut self, content: CurrentContent, current_language: bool) {
        let point_id = content.point.as_ref().map(|p| p.id.clone());
        let point_name = content.point.as_ref().map(|p| p.name.clone());
        let text = content.narration_text().map(str::to_string);
        let was_arrived = self.tracker.state().mode == ProgressMode::Arrived;

        if !self.tracker.apply_content(content) {
            return;
        }
        let state = self.tracker.state().clone();

        if point_id.is_some() && point_id != self.narrated_point && !current_language {
            // New point in the old language; narrate it once refetched
            debug!(language = %self.narration.language(), "content_language_outdated");
            self.spawn_refresh();
        } else if point_id.is_some() && point_id != self.narrated_point {
            if self.narrated_point.is_some() {
                self.metrics.record_step_advanced();
            }
            info!(
                point = %point_name.as_deref().unwrap_or(""),
                progress = state.current_index + 1,
                total = state.total_count,
                "tour_point_current"
            );
            self.narrated_point = point_id;
            match text {
                Some(text) => {
                    self.narration.announce(&text);
                }
                None => self.narration.set_current(None),
            }
        } else if text.is_some() && current_language {
            // Same point, possibly in another language
            self.narration.set_current(text);
        }

        self.emit(CoordinatorEvent::Progress(state.clone()));
        if state.mode == ProgressMode::Arrived && !was_arrived {
            self.emit(CoordinatorEvent::Arrived);
        }
    }
}

#[cold]
fn log_geo_error(e: &GeoError) {
    warn!(error = %e, "location_unavailable");
}

#[cold]
fn log_backend_error(e: &BackendError) {
    warn!(error = %e, "backend_request_failed");
}
