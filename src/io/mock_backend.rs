//! In-process tour backend for local runs and integration tests
//!
//! Serves the REST layout `HttpBackend` consumes from a JSON data file.
//! Sessions advance by geofence: a location inside the next point's
//! trigger radius makes it current, and leaving the last point once it
//! was reached completes the tour. Directions are straight lines split
//! into equal legs.

use crate::domain::geo::{haversine_m, interpolate};
use crate::domain::{
    BoundingBox, Language, LatLng, PointId, RouteId, SessionId, TourPoint, TourRoute, TourSession,
    TravelMode,
};
use crate::io::backend::{DirectionsRequestDto, LanguagesDto, RouteResponseDto, RouteStepDto};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Amsterdam canal tour bundled with the crate
pub const SAMPLE_TOUR: &str = include_str!("../../config/sample_tour.json");

const DIRECTION_LEGS: usize = 3;

const LANGUAGES: [(&str, &str, &str); 16] = [
    ("en", "English", "🇬🇧"),
    ("nl", "Nederlands", "🇳🇱"),
    ("si", "සිංහල", "🇱🇰"),
    ("ta", "தமிழ்", "🇱🇰"),
    ("ja", "日本語", "🇯🇵"),
    ("zh", "中文", "🇨🇳"),
    ("es", "Español", "🇪🇸"),
    ("fr", "Français", "🇫🇷"),
    ("de", "Deutsch", "🇩🇪"),
    ("it", "Italiano", "🇮🇹"),
    ("pt", "Português", "🇵🇹"),
    ("ru", "Русский", "🇷🇺"),
    ("ar", "العربية", "🇸🇦"),
    ("hi", "हिन्दी", "🇮🇳"),
    ("th", "ไทย", "🇹🇭"),
    ("ko", "한국어", "🇰🇷"),
];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MockError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl MockError {
    fn status(&self) -> StatusCode {
        match self {
            MockError::NotFound(_) => StatusCode::NOT_FOUND,
            MockError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// A tour point with its narration per language
#[derive(Debug, Clone, Deserialize)]
pub struct PointContent {
    #[serde(flatten)]
    pub point: TourPoint,
    #[serde(default)]
    pub description: HashMap<String, String>,
    #[serde(default)]
    pub audio_content: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TourData {
    pub routes: Vec<TourRoute>,
    pub points: Vec<PointContent>,
}

impl TourData {
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn sample() -> Result<Self, serde_json::Error> {
        Self::parse(SAMPLE_TOUR)
    }

    fn route(&self, id: &RouteId) -> Option<&TourRoute> {
        self.routes.iter().find(|r| &r.id == id)
    }

    /// Points of a route in tour order; unknown IDs are skipped
    fn route_points(&self, route: &TourRoute) -> Vec<&PointContent> {
        let mut points: Vec<&PointContent> = route
            .point_ids
            .iter()
            .filter_map(|id| self.points.iter().find(|p| &p.point.id == id))
            .collect();
        points.sort_by_key(|p| p.point.order);
        points
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub route_id: RouteId,
    pub user_id: String,
    #[serde(default = "default_language")]
    pub current_language: String,
}

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Deserialize)]
pub struct LocationUpdate {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Current-content body as served
#[derive(Debug, Serialize)]
pub struct ContentResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub point: Option<TourPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub progress: usize,
    pub total_points: usize,
}

#[derive(Debug)]
struct MockSession {
    session: TourSession,
    points: Vec<PointId>,
    index: usize,
    /// The user has been inside the current point's radius
    reached_current: bool,
    complete: bool,
}

/// Routes, points and live sessions
pub struct MockBackend {
    data: TourData,
    sessions: Mutex<HashMap<SessionId, MockSession>>,
}

impl MockBackend {
    pub fn new(data: TourData) -> Self {
        Self { data, sessions: Mutex::new(HashMap::new()) }
    }

    pub fn routes(&self) -> Vec<TourRoute> {
        self.data.routes.iter().filter(|r| r.is_active).cloned().collect()
    }

    pub fn route_points(&self, route_id: &RouteId) -> Result<Vec<TourPoint>, MockError> {
        let route = self
            .data
            .route(route_id)
            .ok_or_else(|| MockError::NotFound(format!("route {route_id}")))?;
        Ok(self.data.route_points(route).into_iter().map(|p| p.point.clone()).collect())
    }

    pub fn create_session(&self, req: CreateSessionRequest) -> Result<TourSession, MockError> {
        let route = self
            .data
            .route(&req.route_id)
            .ok_or_else(|| MockError::NotFound(format!("route {}", req.route_id)))?;
        let points: Vec<PointId> =
            self.data.route_points(route).into_iter().map(|p| p.point.id.clone()).collect();
        if points.is_empty() {
            return Err(MockError::BadRequest(format!("route {} has no points", route.id)));
        }

        let session = TourSession {
            id: SessionId(Uuid::now_v7().to_string()),
            route_id: req.route_id,
            user_id: req.user_id,
            language: req.current_language,
            created_at: Utc::now(),
        };
        info!(
            session_id = %session.id,
            route_id = %session.route_id,
            user_id = %session.user_id,
            "mock_session_created"
        );
        self.sessions.lock().insert(
            session.id.clone(),
            MockSession {
                session: session.clone(),
                points,
                index: 0,
                reached_current: false,
                complete: false,
            },
        );
        Ok(session)
    }

    /// Apply a location; returns the 0-based current index afterwards
    pub fn update_location(
        &self,
        session_id: &SessionId,
        update: &LocationUpdate,
    ) -> Result<usize, MockError> {
        let here = LatLng::new(update.latitude, update.longitude);
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| MockError::NotFound(format!("session {session_id}")))?;
        if session.complete {
            return Ok(session.index);
        }

        let within = |id: &PointId| {
            self.data
                .points
                .iter()
                .find(|p| &p.point.id == id)
                .is_some_and(|p| haversine_m(here, p.point.position()) <= p.point.trigger_radius_m)
        };

        let next = session.points.get(session.index + 1);
        if next.is_some_and(|id| within(id)) {
            session.index += 1;
            session.reached_current = true;
            info!(session_id = %session_id, index = session.index, "mock_point_reached");
        } else if within(&session.points[session.index]) {
            session.reached_current = true;
        } else if session.index + 1 == session.points.len() && session.reached_current {
            session.complete = true;
            info!(session_id = %session_id, "mock_tour_completed");
        }

        debug!(
            session_id = %session_id,
            lat = update.latitude,
            lng = update.longitude,
            accuracy = update.accuracy.unwrap_or(-1.0),
            index = session.index,
            "mock_location"
        );
        Ok(session.index)
    }

    pub fn current_content(
        &self,
        session_id: &SessionId,
        language: Option<&str>,
    ) -> Result<ContentResponse, MockError> {
        let sessions = self.sessions.lock();
        let session = sessions
            .get(session_id)
            .ok_or_else(|| MockError::NotFound(format!("session {session_id}")))?;
        let total = session.points.len();

        if session.complete {
            return Ok(ContentResponse {
                point: None,
                description: None,
                audio_content: None,
                message: Some("Tour completed".to_string()),
                progress: total,
                total_points: total,
            });
        }

        let language = language.unwrap_or(session.session.language.as_str());
        let content = self
            .data
            .points
            .iter()
            .find(|p| p.point.id == session.points[session.index])
            .ok_or_else(|| MockError::NotFound(format!("point {}", session.points[session.index])))?;
        let localized = |texts: &HashMap<String, String>| {
            texts.get(language).or_else(|| texts.get("en")).cloned()
        };

        Ok(ContentResponse {
            point: Some(content.point.clone()),
            description: localized(&content.description),
            audio_content: localized(&content.audio_content),
            message: None,
            progress: session.index + 1,
            total_points: total,
        })
    }

    pub fn languages(&self) -> LanguagesDto {
        let languages: Vec<Language> = LANGUAGES
            .iter()
            .map(|(code, name, flag)| Language {
                code: code.to_string(),
                name: name.to_string(),
                flag: flag.to_string(),
            })
            .collect();
        LanguagesDto { status: "success".to_string(), total: languages.len(), languages }
    }
}

/// Straight-line route split into equal legs
pub fn straight_route(req: &DirectionsRequestDto) -> Result<RouteResponseDto, MockError> {
    let mode: TravelMode = req.travel_mode.parse().map_err(MockError::BadRequest)?;
    let origin = LatLng::new(req.origin_lat, req.origin_lng);
    let destination = LatLng::new(req.destination_lat, req.destination_lng);
    let speed_mps = match mode {
        TravelMode::Walking => 1.4,
        TravelMode::Bicycling => 4.5,
        TravelMode::Transit => 8.0,
        TravelMode::Driving => 11.0,
    };

    let mut steps = Vec::with_capacity(DIRECTION_LEGS);
    let mut start = origin;
    for leg in 1..=DIRECTION_LEGS {
        let end = interpolate(origin, destination, leg as f64 / DIRECTION_LEGS as f64);
        let distance = haversine_m(start, end).round() as u32;
        let duration = (distance as f64 / speed_mps).round() as u32;
        let instruction = if leg == DIRECTION_LEGS {
            "Arrive at your <b>destination</b>".to_string()
        } else {
            format!("Continue <b>{}</b> for {}", heading(start, end), distance_text(distance))
        };
        steps.push(RouteStepDto {
            instruction,
            distance_text: distance_text(distance),
            distance_value: distance,
            duration_text: duration_text(duration),
            duration_value: duration,
            start_lat: start.lat,
            start_lng: start.lng,
            end_lat: end.lat,
            end_lng: end.lng,
            maneuver: (leg == 1).then(|| "straight".to_string()),
            polyline: String::new(),
        });
        start = end;
    }

    let total_distance: u32 = steps.iter().map(|s| s.distance_value).sum();
    let total_duration: u32 = steps.iter().map(|s| s.duration_value).sum();
    let bounds = BoundingBox::from_points([origin, destination])
        .unwrap_or(BoundingBox { northeast: origin, southwest: origin });

    Ok(RouteResponseDto {
        total_distance_text: distance_text(total_distance),
        total_distance_value: total_distance,
        total_duration_text: duration_text(total_duration),
        total_duration_value: total_duration,
        start_address: format!("{:.5}, {:.5}", origin.lat, origin.lng),
        end_address: format!("{:.5}, {:.5}", destination.lat, destination.lng),
        overview_polyline: String::new(),
        steps,
        bounds,
    })
}

fn heading(from: LatLng, to: LatLng) -> &'static str {
    let dlat = to.lat - from.lat;
    let dlng = (to.lng - from.lng) * from.lat.to_radians().cos();
    if dlat.abs() >= dlng.abs() {
        if dlat >= 0.0 {
            "north"
        } else {
            "south"
        }
    } else if dlng >= 0.0 {
        "east"
    } else {
        "west"
    }
}

fn distance_text(meters: u32) -> String {
    if meters >= 1000 {
        format!("{:.1} km", meters as f64 / 1000.0)
    } else {
        format!("{meters} m")
    }
}

fn duration_text(seconds: u32) -> String {
    let mins = (seconds + 59) / 60;
    if mins == 1 {
        "1 min".to_string()
    } else {
        format!("{mins} mins")
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .header("Access-Control-Allow-Origin", "*")
            .body(Full::new(Bytes::from(bytes)))
            .expect("static response should not fail"),
        Err(e) => {
            error!(error = %e, "mock_encode_failed");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Full::new(Bytes::from("encode failed")))
                .expect("static response should not fail")
        }
    }
}

fn error_response(e: &MockError) -> Response<Full<Bytes>> {
    json_response(e.status(), &serde_json::json!({ "detail": e.to_string() }))
}

fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

async fn read_json<T: for<'de> Deserialize<'de>>(
    req: Request<hyper::body::Incoming>,
) -> Result<T, MockError> {
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| MockError::BadRequest(e.to_string()))?
        .to_bytes();
    serde_json::from_slice(&body).map_err(|e| MockError::BadRequest(e.to_string()))
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    backend: Arc<MockBackend>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    debug!(method = %method, path = %path, "mock_request");

    let result = match (&method, segments.as_slice()) {
        (&Method::GET, ["health"]) => Ok(json_response(StatusCode::OK, &"ok")),
        (&Method::GET, ["api", "tour-routes"]) => {
            Ok(json_response(StatusCode::OK, &backend.routes()))
        }
        (&Method::GET, ["api", "tour-routes", id, "points"]) => backend
            .route_points(&RouteId(id.to_string()))
            .map(|points| json_response(StatusCode::OK, &points)),
        (&Method::POST, ["api", "tour-sessions"]) => match read_json(req).await {
            Ok(body) => backend
                .create_session(body)
                .map(|session| json_response(StatusCode::OK, &session)),
            Err(e) => Err(e),
        },
        (&Method::PUT, ["api", "tour-sessions", id, "location"]) => {
            let session_id = SessionId(id.to_string());
            match read_json::<LocationUpdate>(req).await {
                Ok(update) => backend.update_location(&session_id, &update).map(|index| {
                    json_response(
                        StatusCode::OK,
                        &serde_json::json!({ "status": "updated", "current_point_index": index }),
                    )
                }),
                Err(e) => Err(e),
            }
        }
        (&Method::GET, ["api", "tour-sessions", id, "current-content"]) => backend
            .current_content(
                &SessionId(id.to_string()),
                query_param(query.as_deref(), "language"),
            )
            .map(|content| json_response(StatusCode::OK, &content)),
        (&Method::POST, ["api", "directions", "calculate"]) => {
            match read_json::<DirectionsRequestDto>(req).await {
                Ok(body) => straight_route(&body).map(|route| json_response(StatusCode::OK, &route)),
                Err(e) => Err(e),
            }
        }
        (&Method::GET, ["api", "languages"]) => {
            Ok(json_response(StatusCode::OK, &backend.languages()))
        }
        _ => Err(MockError::NotFound(format!("{method} {path}"))),
    };

    Ok(result.unwrap_or_else(|e| error_response(&e)))
}

/// Serve `backend` on `listener` until shutdown is signalled
pub async fn serve(
    listener: TcpListener,
    backend: Arc<MockBackend>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!(addr = %listener.local_addr()?, "mock_backend_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let backend = backend.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let backend = backend.clone();
                                async move { handle_request(req, backend).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "mock_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "mock_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mock_backend_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
