//! In-memory collaborators and fixtures for unit tests

use crate::domain::{
    BoundingBox, CurrentContent, Language, LatLng, LocationFix, PointId, Route, RouteId,
    RouteRequest, RouteStep, SessionId, TourPoint, TourRoute, TourSession,
};
use crate::io::backend::{BackendError, DirectionsProvider, TourBackend};
use crate::io::position::{GeoError, GeoEvent, GeoOptions, PositionSource, WatchId};
use crate::io::speech::{SpeechEngine, SpeechError, Utterance};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{mpsc, Semaphore};

pub fn fix(lat: f64, lng: f64, accuracy_m: Option<f64>) -> LocationFix {
    LocationFix::new(lat, lng, accuracy_m)
}

/// Route whose steps end at the given points, each starting where the
/// previous one ended
pub fn route_with_steps(ends: &[(f64, f64)]) -> Route {
    let mut start = ends.first().map(|&(lat, lng)| LatLng::new(lat - 0.001, lng)).unwrap_or(
        LatLng::new(0.0, 0.0),
    );
    let steps: Vec<RouteStep> = ends
        .iter()
        .enumerate()
        .map(|(i, &(lat, lng))| {
            let end = LatLng::new(lat, lng);
            let step = RouteStep {
                start,
                end,
                instruction: format!("Step <b>{}</b>", i + 1),
                distance_m: 100,
                distance_text: "0.1 km".to_string(),
                duration_s: 60,
                duration_text: "1 min".to_string(),
                maneuver: None,
            };
            start = end;
            step
        })
        .collect();
    let bounds = BoundingBox::from_points(steps.iter().flat_map(|s| [s.start, s.end]))
        .unwrap_or(BoundingBox { northeast: start, southwest: start });
    Route {
        steps,
        bounds,
        total_distance_text: "0.2 km".to_string(),
        total_duration_text: "2 mins".to_string(),
        start_address: "Start".to_string(),
        end_address: "End".to_string(),
    }
}

pub fn tour_points(n: usize) -> Vec<TourPoint> {
    (0..n)
        .map(|i| TourPoint {
            id: PointId(format!("p{}", i + 1)),
            name: format!("Point {}", i + 1),
            latitude: 52.37 + i as f64 * 0.001,
            longitude: 4.88,
            order: i as i32 + 1,
            trigger_radius_m: 50.0,
        })
        .collect()
}

/// Content for the 1-based `progress`, with a point and narration
pub fn content(progress: u32, total: u32) -> CurrentContent {
    let index = progress.max(1) as usize - 1;
    let point = tour_points(total.max(progress) as usize).into_iter().nth(index);
    CurrentContent {
        progress,
        total_points: total,
        description: Some(format!("Description {progress}")),
        audio_content: Some(format!("Narration {progress}")),
        point,
        message: None,
    }
}

/// Position source driven by the test
pub struct FakeSource {
    next_id: AtomicUsize,
    sinks: Mutex<Vec<(WatchId, mpsc::Sender<GeoEvent>)>>,
    watch_count: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(1),
            sinks: Mutex::new(Vec::new()),
            watch_count: AtomicUsize::new(0),
        }
    }

    fn deliver(&self, event: GeoEvent) -> bool {
        let sinks = self.sinks.lock();
        match sinks.last() {
            Some((_, tx)) => tx.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Deliver to the newest watch; false when nobody is watching
    pub fn emit(&self, fix: LocationFix) -> bool {
        self.deliver(Ok(fix))
    }

    pub fn emit_error(&self, err: GeoError) -> bool {
        self.deliver(Err(err))
    }

    pub fn active_watches(&self) -> usize {
        self.sinks.lock().len()
    }

    /// Watches ever opened
    pub fn watch_count(&self) -> usize {
        self.watch_count.load(Ordering::SeqCst)
    }
}

impl PositionSource for FakeSource {
    fn watch(&self, _options: &GeoOptions, sink: mpsc::Sender<GeoEvent>) -> WatchId {
        let id = WatchId(self.next_id.fetch_add(1, Ordering::SeqCst) as u64);
        self.watch_count.fetch_add(1, Ordering::SeqCst);
        self.sinks.lock().push((id, sink));
        id
    }

    fn clear_watch(&self, id: WatchId) {
        self.sinks.lock().retain(|(w, _)| *w != id);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    ListRoutes,
    FetchPoints(RouteId),
    CreateSession { route_id: RouteId, user_id: String, language: String },
    PushLocation(SessionId, LatLng),
    FetchContent(SessionId, String),
    Languages,
}

/// Scripted tour backend recording every call
pub struct FakeBackend {
    calls: Mutex<Vec<BackendCall>>,
    points: Vec<TourPoint>,
    contents: Mutex<VecDeque<CurrentContent>>,
    fail_next_create: Mutex<Option<BackendError>>,
    push_permits: Semaphore,
    sessions: AtomicUsize,
}

impl FakeBackend {
    pub fn new(points: Vec<TourPoint>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            points,
            contents: Mutex::new(VecDeque::new()),
            fail_next_create: Mutex::new(None),
            push_permits: Semaphore::new(Semaphore::MAX_PERMITS),
            sessions: AtomicUsize::new(0),
        }
    }

    /// Pushes wait until `release_push` is called
    pub fn with_blocked_pushes(mut self) -> Self {
        self.push_permits = Semaphore::new(0);
        self
    }

    pub fn release_push(&self) {
        self.push_permits.add_permits(1);
    }

    /// Queue a content response; the last one repeats when the queue runs dry
    pub fn queue_content(&self, content: CurrentContent) {
        self.contents.lock().push_back(content);
    }

    pub fn fail_next_create(&self, err: BackendError) {
        *self.fail_next_create.lock() = Some(err);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    pub fn pushes(&self) -> usize {
        self.calls.lock().iter().filter(|c| matches!(c, BackendCall::PushLocation(..))).count()
    }

    pub fn fetches(&self) -> usize {
        self.calls.lock().iter().filter(|c| matches!(c, BackendCall::FetchContent(..))).count()
    }

    fn record(&self, call: BackendCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl TourBackend for FakeBackend {
    async fn list_routes(&self) -> Result<Vec<TourRoute>, BackendError> {
        self.record(BackendCall::ListRoutes);
        Ok(vec![TourRoute {
            id: RouteId("r1".to_string()),
            name: "Canal Tour".to_string(),
            description: Default::default(),
            point_ids: self.points.iter().map(|p| p.id.clone()).collect(),
            is_active: true,
        }])
    }

    async fn fetch_route_points(&self, route_id: &RouteId) -> Result<Vec<TourPoint>, BackendError> {
        self.record(BackendCall::FetchPoints(route_id.clone()));
        Ok(self.points.clone())
    }

    async fn create_session(
        &self,
        route_id: &RouteId,
        user_id: &str,
        language: &str,
    ) -> Result<TourSession, BackendError> {
        self.record(BackendCall::CreateSession {
            route_id: route_id.clone(),
            user_id: user_id.to_string(),
            language: language.to_string(),
        });
        let fail = self.fail_next_create.lock().take();
        if let Some(err) = fail {
            return Err(err);
        }
        let n = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TourSession {
            id: SessionId(format!("s{n}")),
            route_id: route_id.clone(),
            user_id: user_id.to_string(),
            language: language.to_string(),
            created_at: Utc::now(),
        })
    }

    async fn push_location(
        &self,
        session_id: &SessionId,
        fix: &LocationFix,
    ) -> Result<(), BackendError> {
        self.record(BackendCall::PushLocation(session_id.clone(), fix.position()));
        if let Ok(permit) = self.push_permits.acquire().await {
            permit.forget();
        }
        Ok(())
    }

    async fn fetch_current_content(
        &self,
        session_id: &SessionId,
        language: &str,
    ) -> Result<CurrentContent, BackendError> {
        self.record(BackendCall::FetchContent(session_id.clone(), language.to_string()));
        let mut contents = self.contents.lock();
        let next = if contents.len() > 1 { contents.pop_front() } else { contents.front().cloned() };
        next.ok_or_else(|| BackendError::Status { status: 404, body: "no content".to_string() })
    }

    async fn languages(&self) -> Result<Vec<Language>, BackendError> {
        self.record(BackendCall::Languages);
        Ok(vec![Language { code: "en".to_string(), name: "English".to_string(), flag: String::new() }])
    }
}

/// Directions provider returning a fixed route
pub struct FakeDirections {
    route: Route,
    requests: Mutex<Vec<RouteRequest>>,
}

impl FakeDirections {
    pub fn new(route: Route) -> Self {
        Self { route, requests: Mutex::new(Vec::new()) }
    }

    pub fn requests(&self) -> Vec<RouteRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl DirectionsProvider for FakeDirections {
    async fn calculate_route(&self, request: &RouteRequest) -> Result<Route, BackendError> {
        self.requests.lock().push(request.clone());
        Ok(self.route.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpeechCall {
    Speak(String),
    Cancel,
}

/// Speech engine whose utterances never finish on their own
pub struct FakeSpeech {
    calls: Mutex<Vec<SpeechCall>>,
    utterances: Mutex<Vec<Utterance>>,
    active: AtomicUsize,
    fail: Mutex<Option<SpeechError>>,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeSpeech {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            utterances: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            fail: Mutex::new(None),
        }
    }

    pub fn fail_with(&self, err: SpeechError) {
        *self.fail.lock() = Some(err);
    }

    pub fn calls(&self) -> Vec<SpeechCall> {
        self.calls.lock().clone()
    }

    pub fn spoken(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                SpeechCall::Speak(text) => Some(text.clone()),
                SpeechCall::Cancel => None,
            })
            .collect()
    }

    /// Utterances currently being spoken
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn last_utterance(&self) -> Option<Utterance> {
        self.utterances.lock().last().cloned()
    }
}

#[async_trait]
impl SpeechEngine for FakeSpeech {
    async fn speak(&self, utterance: &Utterance) -> Result<(), SpeechError> {
        self.calls.lock().push(SpeechCall::Speak(utterance.text.clone()));
        self.utterances.lock().push(utterance.clone());
        let fail = self.fail.lock().clone();
        if let Some(err) = fail {
            return Err(err);
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);
        std::future::pending::<()>().await;
        Ok(())
    }

    fn cancel(&self) {
        self.calls.lock().push(SpeechCall::Cancel);
    }
}
