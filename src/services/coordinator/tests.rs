//! Tests for the coordinator

use super::*;
use crate::domain::{LatLng, ProgressMode, RouteId};
use crate::infra::config::Config;
use crate::io::map::{create_map_channel, MapCommand};
use crate::services::testing::{
    content, fix, route_with_steps, tour_points, BackendCall, FakeBackend, FakeDirections,
    FakeSource, FakeSpeech, SpeechCall,
};
use std::time::Duration;

/// Test harness that keeps the fakes and receivers alive
struct TestCoordinator {
    coordinator: TourSessionCoordinator,
    source: Arc<FakeSource>,
    backend: Arc<FakeBackend>,
    directions: Arc<FakeDirections>,
    speech: Arc<FakeSpeech>,
    #[allow(dead_code)]
    map_rx: mpsc::Receiver<MapCommand>,
    events_rx: mpsc::Receiver<CoordinatorEvent>,
}

impl std::ops::Deref for TestCoordinator {
    type Target = TourSessionCoordinator;
    fn deref(&self) -> &Self::Target {
        &self.coordinator
    }
}

impl std::ops::DerefMut for TestCoordinator {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.coordinator
    }
}

impl TestCoordinator {
    /// Handle exactly one piece of internal work
    async fn pump(&mut self) {
        let work = tokio::time::timeout(Duration::from_secs(30), self.coordinator.next_work())
            .await
            .expect("coordinator had no work");
        self.coordinator.handle_work(work).await;
    }

    /// Let spawned speech and backend tasks run
    async fn settle(&self) {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn events(&mut self) -> Vec<CoordinatorEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            out.push(event);
        }
        out
    }

    /// Start a tour and apply its first content
    async fn start_active_tour(&mut self) {
        let here = fix(52.37, 4.88, Some(5.0));
        self.coordinator.start_tour(Some(route_id()), Some(here)).await.unwrap();
        self.pump().await; // grace period elapses
        self.pump().await; // first content
    }
}

fn route_id() -> RouteId {
    RouteId("r1".to_string())
}

fn test_config() -> Config {
    Config::default().with_initial_fetch_grace_ms(1000).with_geo_timeout_ms(0)
}

fn create_test_coordinator(backend: FakeBackend) -> TestCoordinator {
    create_test_coordinator_with_config(backend, test_config())
}

fn create_test_coordinator_with_config(backend: FakeBackend, config: Config) -> TestCoordinator {
    let metrics = Arc::new(Metrics::new());
    let source = Arc::new(FakeSource::new());
    let backend = Arc::new(backend);
    let directions =
        Arc::new(FakeDirections::new(route_with_steps(&[(52.0, 4.0), (52.001, 4.0)])));
    let speech = Arc::new(FakeSpeech::new());
    let (map, map_rx) = create_map_channel(1024, metrics.clone());
    let (events_tx, events_rx) = mpsc::channel(1024);

    let collaborators = Collaborators {
        backend: backend.clone(),
        directions: directions.clone(),
        source: source.clone(),
        speech: speech.clone(),
        map,
    };
    let coordinator =
        TourSessionCoordinator::new(config, collaborators, metrics, Some(events_tx));
    TestCoordinator { coordinator, source, backend, directions, speech, map_rx, events_rx }
}

fn three_point_backend() -> FakeBackend {
    let backend = FakeBackend::new(tour_points(3));
    backend.queue_content(content(1, 3));
    backend.queue_content(content(2, 3));
    backend
}

#[tokio::test(start_paused = true)]
async fn test_start_tour_preconditions() {
    let mut t = create_test_coordinator(three_point_backend());

    let err = t.start_tour(None, Some(fix(52.0, 4.0, Some(5.0)))).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Precondition(_)));
    let err = t.start_tour(Some(route_id()), None).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Precondition(_)));

    assert_eq!(t.session_state(), SessionState::NoSession);
    assert!(t.backend.calls().is_empty());
    assert!(!t.is_tracking());
}

#[tokio::test(start_paused = true)]
async fn test_start_tour_failure_restores_state_and_retry_succeeds() {
    let mut t = create_test_coordinator(three_point_backend());
    t.backend.fail_next_create(BackendError::Request("connection refused".to_string()));

    let here = fix(52.37, 4.88, Some(5.0));
    let err = t.start_tour(Some(route_id()), Some(here.clone())).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::BackendUnavailable(_)));
    assert_eq!(t.session_state(), SessionState::NoSession);
    assert!(!t.is_tracking());
    assert_eq!(t.source.active_watches(), 0);

    t.start_tour(Some(route_id()), Some(here)).await.unwrap();
    assert_eq!(t.session_state(), SessionState::Active);
    assert!(t.is_tracking());
    assert!(t.playback().is_playing);
    assert_eq!(t.progress().mode, ProgressMode::Tour);
    assert_eq!(t.progress().total_count, 3);
}

#[tokio::test(start_paused = true)]
async fn test_session_created_with_prefixed_user_and_language() {
    let mut t = create_test_coordinator(three_point_backend());
    t.set_language("zh");
    t.start_tour(Some(route_id()), Some(fix(52.37, 4.88, Some(5.0)))).await.unwrap();

    match &t.backend.calls()[0] {
        BackendCall::CreateSession { route_id: r, user_id, language } => {
            assert_eq!(r, &route_id());
            assert!(user_id.starts_with("user_"), "{user_id}");
            assert_eq!(language, "zh");
        }
        other => panic!("unexpected first call {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_tour_scenario_backend_drives_progress() {
    let mut t = create_test_coordinator(three_point_backend());
    t.start_tour(Some(route_id()), Some(fix(52.37, 4.88, Some(5.0)))).await.unwrap();
    assert_eq!(t.progress().current_index, 0);
    assert_eq!(t.backend.fetches(), 0);

    // Initial fetch only after the grace period
    t.pump().await;
    t.pump().await;
    assert_eq!(t.backend.fetches(), 1);
    assert_eq!(t.progress().current_index, 0);

    // Reliable fix: pushed, then content says point 2 of 3
    assert!(t.source.emit(fix(52.371, 4.88, Some(5.0))));
    t.pump().await;
    t.pump().await;
    assert_eq!(t.backend.pushes(), 1);
    assert_eq!(t.progress().current_index, 1);
    assert_eq!(t.progress().total_count, 3);

    t.settle().await;
    assert_eq!(t.speech.spoken(), vec!["Narration 1".to_string(), "Narration 2".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_same_point_is_not_narrated_twice() {
    let backend = FakeBackend::new(tour_points(3));
    backend.queue_content(content(1, 3));
    let mut t = create_test_coordinator(backend);
    t.start_active_tour().await;

    assert!(t.source.emit(fix(52.3701, 4.88, Some(5.0))));
    t.pump().await;
    t.pump().await;

    t.settle().await;
    assert_eq!(t.speech.spoken(), vec!["Narration 1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_unreliable_fix_not_pushed() {
    let config = test_config().with_max_accuracy_m(20.0);
    let mut t = create_test_coordinator_with_config(three_point_backend(), config);
    t.start_active_tour().await;

    assert!(t.source.emit(fix(52.371, 4.88, Some(50.0))));
    t.pump().await;
    assert!(t.source.emit(fix(52.372, 4.88, None)));
    t.pump().await;

    assert_eq!(t.backend.pushes(), 0);
    assert_eq!(t.metrics.fixes_unreliable(), 2);
    assert_eq!(t.progress().current_index, 0);
}

#[tokio::test(start_paused = true)]
async fn test_one_sync_in_flight_latest_fix_wins() {
    let mut t = create_test_coordinator(three_point_backend().with_blocked_pushes());
    t.start_active_tour().await;

    assert!(t.source.emit(fix(52.3711, 4.88, Some(5.0))));
    t.pump().await;
    assert!(t.source.emit(fix(52.3712, 4.88, Some(5.0))));
    t.pump().await;
    assert!(t.source.emit(fix(52.3713, 4.88, Some(5.0))));
    t.pump().await;
    t.settle().await;

    assert_eq!(t.backend.pushes(), 1);
    assert_eq!(t.metrics.fixes_dropped(), 1);

    t.backend.release_push();
    t.pump().await; // first sync completes, newest held fix dispatched
    t.backend.release_push();
    t.pump().await;

    let pushed: Vec<LatLng> = t
        .backend
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            BackendCall::PushLocation(_, at) => Some(at),
            _ => None,
        })
        .collect();
    assert_eq!(pushed, vec![LatLng::new(52.3711, 4.88), LatLng::new(52.3713, 4.88)]);
}

#[tokio::test(start_paused = true)]
async fn test_end_tour_stops_all_activity() {
    let mut t = create_test_coordinator(three_point_backend());
    t.start_active_tour().await;

    assert!(t.source.emit(fix(52.371, 4.88, Some(5.0))));
    t.pump().await; // sync spawned but not yet complete
    t.end_tour();

    assert_eq!(t.session_state(), SessionState::Ended);
    assert!(!t.is_tracking());
    assert_eq!(t.source.active_watches(), 0);
    assert!(!t.playback().is_playing);
    assert_eq!(t.progress().mode, ProgressMode::Idle);

    let calls_after_end = t.backend.calls().len();
    assert!(!t.source.emit(fix(52.372, 4.88, Some(5.0))));
    t.settle().await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(t.backend.calls().len(), calls_after_end);
    assert!(t.events().contains(&CoordinatorEvent::SessionEnded));
}

#[tokio::test(start_paused = true)]
async fn test_stale_reply_discarded() {
    let mut t = create_test_coordinator(three_point_backend());
    t.start_active_tour().await;
    let old_generation = t.generation;

    t.end_tour();
    t.start_tour(Some(route_id()), Some(fix(52.37, 4.88, Some(5.0)))).await.unwrap();
    t.handle_reply(BackendReply {
        generation: old_generation,
        kind: ReplyKind::Sync,
        language: "en".to_string(),
        result: Ok(content(3, 3)),
    });

    assert_eq!(t.progress().current_index, 0);
    assert!(t.progress().current_content.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_restart_ends_previous_session() {
    let mut t = create_test_coordinator(three_point_backend());
    t.start_active_tour().await;
    let first = t.session().unwrap().id.clone();

    t.start_tour(Some(route_id()), Some(fix(52.37, 4.88, Some(5.0)))).await.unwrap();
    assert_ne!(t.session().unwrap().id, first);
    assert_eq!(t.source.active_watches(), 1);
    assert_eq!(t.progress().current_index, 0);
}

#[tokio::test(start_paused = true)]
async fn test_backend_error_surfaced_and_state_kept() {
    // No content queued: every fetch fails
    let mut t = create_test_coordinator(FakeBackend::new(tour_points(2)));
    t.start_tour(Some(route_id()), Some(fix(52.37, 4.88, Some(5.0)))).await.unwrap();
    t.pump().await;
    t.pump().await;

    assert_eq!(t.session_state(), SessionState::Active);
    assert!(t
        .events()
        .iter()
        .any(|e| matches!(e, CoordinatorEvent::Error(CoordinatorError::BackendUnavailable(_)))));
}

#[tokio::test(start_paused = true)]
async fn test_tour_completion_emits_arrived() {
    let backend = FakeBackend::new(tour_points(2));
    backend.queue_content(CurrentContent {
        progress: 2,
        total_points: 2,
        point: None,
        description: None,
        audio_content: None,
        message: Some("Tour completed".to_string()),
    });
    let mut t = create_test_coordinator(backend);
    t.start_active_tour().await;

    assert_eq!(t.progress().mode, ProgressMode::Arrived);
    assert!(t.events().contains(&CoordinatorEvent::Arrived));

    // Completed tours stop pushing
    assert!(t.source.emit(fix(52.371, 4.88, Some(5.0))));
    t.pump().await;
    assert_eq!(t.backend.pushes(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_navigation_scenario() {
    let mut t = create_test_coordinator(three_point_backend());
    let origin = fix(51.999, 4.0, Some(5.0));

    t.calculate_route(Some(origin), Some(LatLng::new(52.001, 4.0)), TravelMode::Walking)
        .await
        .unwrap();
    assert_eq!(t.progress().mode, ProgressMode::Navigation);
    assert_eq!(t.progress().current_index, 0);
    assert!(t.is_tracking());
    assert!(t.playback().is_playing);
    assert_eq!(t.directions.requests()[0].travel_mode, TravelMode::Walking);
    t.settle().await;

    // ~11 m from the first step's end
    assert!(t.source.emit(fix(52.0001, 4.0, Some(5.0))));
    t.pump().await;
    assert_eq!(t.progress().current_index, 1);
    t.settle().await;

    assert!(t.source.emit(fix(52.001, 4.0, Some(5.0))));
    t.pump().await;
    assert_eq!(t.progress().mode, ProgressMode::Arrived);
    assert!(t.events().contains(&CoordinatorEvent::Arrived));

    assert_eq!(t.speech.spoken(), vec!["Step 1".to_string(), "Step 2".to_string()]);
    // Navigation never talks to the tour backend
    assert!(t.backend.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_calculate_route_preconditions() {
    let mut t = create_test_coordinator(three_point_backend());
    let err = t
        .calculate_route(Some(fix(52.0, 4.0, Some(5.0))), None, TravelMode::Driving)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::Precondition(_)));
    assert!(t.directions.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_navigation_replaces_tour() {
    let mut t = create_test_coordinator(three_point_backend());
    t.start_active_tour().await;

    t.calculate_route(
        Some(fix(51.999, 4.0, Some(5.0))),
        Some(LatLng::new(52.001, 4.0)),
        TravelMode::Driving,
    )
    .await
    .unwrap();

    assert_eq!(t.session_state(), SessionState::Ended);
    assert!(t.session().is_none());
    assert_eq!(t.progress().mode, ProgressMode::Navigation);
    assert_eq!(t.source.active_watches(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_set_language_refetches_content() {
    let mut t = create_test_coordinator(three_point_backend());
    t.start_active_tour().await;

    t.set_language("nl");
    t.pump().await;

    assert_eq!(t.language(), "nl");
    let last_fetch = t.backend.calls().into_iter().rev().find_map(|c| match c {
        BackendCall::FetchContent(_, language) => Some(language),
        _ => None,
    });
    assert_eq!(last_fetch.as_deref(), Some("nl"));
}

#[tokio::test(start_paused = true)]
async fn test_reply_in_previous_language_keeps_new_narration() {
    let mut welkom = content(1, 3);
    welkom.audio_content = Some("Welkom bij punt 1".to_string());
    let backend = FakeBackend::new(tour_points(3)).with_blocked_pushes();
    backend.queue_content(content(1, 3));
    backend.queue_content(welkom);
    backend.queue_content(content(1, 3));
    let mut t = create_test_coordinator(backend);
    t.start_active_tour().await;

    // Sync issued in English, held at the push
    assert!(t.source.emit(fix(52.3701, 4.88, Some(5.0))));
    t.pump().await;
    t.settle().await;

    t.set_language("nl");
    t.pump().await; // Dutch refresh
    t.backend.release_push();
    t.pump().await; // English sync reply
    assert_eq!(t.progress().current_index, 0);

    t.narration.toggle_play();
    t.narration.toggle_play();
    t.settle().await;
    assert_eq!(t.speech.last_utterance().unwrap().text, "Welkom bij punt 1");
}

#[tokio::test(start_paused = true)]
async fn test_new_point_in_previous_language_is_refetched() {
    let mut punt = content(2, 3);
    punt.audio_content = Some("Punt 2".to_string());
    let backend = FakeBackend::new(tour_points(3));
    backend.queue_content(content(1, 3));
    backend.queue_content(content(2, 3));
    backend.queue_content(punt);
    let mut t = create_test_coordinator(backend);
    t.start_active_tour().await;

    // English sync completes before the language switch is handled
    assert!(t.source.emit(fix(52.371, 4.88, Some(5.0))));
    t.pump().await;
    t.settle().await;
    t.set_language("nl");

    t.pump().await; // English sync reply: progress only
    assert_eq!(t.progress().current_index, 1);
    t.pump().await; // Dutch refresh
    t.settle().await;

    assert_eq!(t.speech.spoken(), vec!["Narration 1".to_string(), "Punt 2".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_stale_last_fix_is_relocated() {
    let mut t = create_test_coordinator(three_point_backend());
    let mut old = fix(52.0, 4.0, Some(5.0));
    old.captured_at = Utc::now() - chrono::Duration::hours(1);
    t.tracker.advance(&old);

    let source = t.source.clone();
    tokio::spawn(async move {
        tokio::task::yield_now().await;
        source.emit(fix(52.3791, 4.9003, Some(8.0)));
    });

    let here = t.current_fix().await.unwrap();
    assert_eq!(here.latitude, 52.3791);
    assert_eq!(t.source.watch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_tour_start_cancels_navigation() {
    let mut t = create_test_coordinator(three_point_backend());
    t.calculate_route(
        Some(fix(51.999, 4.0, Some(5.0))),
        Some(LatLng::new(52.001, 4.0)),
        TravelMode::Walking,
    )
    .await
    .unwrap();
    t.settle().await;
    assert_eq!(t.speech.active(), 1);

    t.start_tour(Some(route_id()), Some(fix(52.37, 4.88, Some(5.0)))).await.unwrap();
    t.settle().await;

    assert_eq!(t.speech.active(), 0);
    assert!(t.speech.calls().contains(&SpeechCall::Cancel));
    assert!(t.destination.is_none());
    assert!(t.playback().is_playing);
    assert_eq!(t.progress().mode, ProgressMode::Tour);
}

#[tokio::test(start_paused = true)]
async fn test_speech_failure_keeps_playing() {
    let mut t = create_test_coordinator(three_point_backend());
    t.speech.fail_with(SpeechError::Unavailable("no voices".to_string()));
    t.start_active_tour().await;
    t.pump().await; // speech completion

    assert!(t.playback().is_playing);
    assert!(t
        .events()
        .iter()
        .any(|e| matches!(e, CoordinatorEvent::Error(CoordinatorError::SpeechUnavailable(_)))));
}

#[tokio::test(start_paused = true)]
async fn test_geo_error_surfaced_stream_kept() {
    let mut t = create_test_coordinator(three_point_backend());
    t.start_active_tour().await;

    assert!(t.source.emit_error(GeoError::PositionUnavailable("no signal".to_string())));
    t.pump().await;

    assert!(t.is_tracking());
    assert!(t.events().iter().any(|e| matches!(
        e,
        CoordinatorEvent::Error(CoordinatorError::LocationUnavailable(_))
    )));
}

#[tokio::test(start_paused = true)]
async fn test_locate_returns_first_fix() {
    let mut t = create_test_coordinator(three_point_backend());
    let source = t.source.clone();
    tokio::spawn(async move {
        tokio::task::yield_now().await;
        source.emit(fix(52.3791, 4.9003, Some(8.0)));
    });

    let here = t.locate().await.unwrap();
    assert_eq!(here.latitude, 52.3791);
    assert_eq!(t.source.active_watches(), 0);
    assert_eq!(t.current_fix().await.unwrap(), here);
}

#[tokio::test(start_paused = true)]
async fn test_locate_permission_denied() {
    let mut t = create_test_coordinator(three_point_backend());
    let source = t.source.clone();
    tokio::spawn(async move {
        tokio::task::yield_now().await;
        source.emit_error(GeoError::PermissionDenied);
    });

    let err = t.locate().await.unwrap_err();
    assert_eq!(err, CoordinatorError::LocationUnavailable(GeoError::PermissionDenied));
}

#[tokio::test(start_paused = true)]
async fn test_run_loop_commands() {
    let mut t = create_test_coordinator(three_point_backend());
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    cmd_tx.send(CoordinatorCommand::ToggleMute).await.unwrap();
    cmd_tx.send(CoordinatorCommand::TogglePlay).await.unwrap();
    cmd_tx.send(CoordinatorCommand::StartTour).await.unwrap();
    cmd_tx.send(CoordinatorCommand::Shutdown).await.unwrap();

    t.coordinator.run(cmd_rx).await;

    let playback = t.playback();
    assert!(playback.is_muted);
    assert!(playback.is_playing);
    let events = t.events();
    assert!(events.contains(&CoordinatorEvent::Playback(PlaybackState {
        is_playing: false,
        is_muted: true
    })));
    // No route selected: rejected before any location request
    assert!(events
        .iter()
        .any(|e| matches!(e, CoordinatorEvent::Error(CoordinatorError::Precondition(_)))));
    assert_eq!(t.source.watch_count(), 0);
}
