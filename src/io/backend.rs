//! Tour backend and directions provider over HTTP
//!
//! REST layout, all under `{base_url}/api`:
//! - `GET  /tour-routes`
//! - `GET  /tour-routes/{id}/points`
//! - `POST /tour-sessions`
//! - `PUT  /tour-sessions/{id}/location`
//! - `GET  /tour-sessions/{id}/current-content?language=`
//! - `POST /directions/calculate`
//! - `GET  /languages`

use crate::domain::{
    BoundingBox, CurrentContent, Language, LatLng, LocationFix, Route, RouteId, RouteRequest,
    RouteStep, SessionId, TourPoint, TourRoute, TourSession,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Backend call failed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            BackendError::Decode(e.to_string())
        } else {
            BackendError::Request(e.to_string())
        }
    }
}

/// Tour content service
#[async_trait]
pub trait TourBackend: Send + Sync {
    async fn list_routes(&self) -> Result<Vec<TourRoute>, BackendError>;

    /// Points of a route, sorted by `order`
    async fn fetch_route_points(&self, route_id: &RouteId) -> Result<Vec<TourPoint>, BackendError>;

    async fn create_session(
        &self,
        route_id: &RouteId,
        user_id: &str,
        language: &str,
    ) -> Result<TourSession, BackendError>;

    async fn push_location(
        &self,
        session_id: &SessionId,
        fix: &LocationFix,
    ) -> Result<(), BackendError>;

    async fn fetch_current_content(
        &self,
        session_id: &SessionId,
        language: &str,
    ) -> Result<CurrentContent, BackendError>;

    async fn languages(&self) -> Result<Vec<Language>, BackendError>;
}

/// Turn-by-turn directions service
#[async_trait]
pub trait DirectionsProvider: Send + Sync {
    async fn calculate_route(&self, request: &RouteRequest) -> Result<Route, BackendError>;
}

#[derive(Serialize)]
struct CreateSessionBody<'a> {
    route_id: &'a str,
    user_id: &'a str,
    current_language: &'a str,
}

#[derive(Serialize)]
struct LocationBody {
    latitude: f64,
    longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    accuracy: Option<f64>,
    timestamp: DateTime<Utc>,
}

/// Wire shape of a directions request
#[derive(Debug, Serialize, Deserialize)]
pub struct DirectionsRequestDto {
    pub origin_lat: f64,
    pub origin_lng: f64,
    pub destination_lat: f64,
    pub destination_lng: f64,
    pub travel_mode: String,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avoid: Option<Vec<String>>,
}

impl From<&RouteRequest> for DirectionsRequestDto {
    fn from(req: &RouteRequest) -> Self {
        Self {
            origin_lat: req.origin.lat,
            origin_lng: req.origin.lng,
            destination_lat: req.destination.lat,
            destination_lng: req.destination.lng,
            travel_mode: req.travel_mode.as_str().to_string(),
            language: req.language.clone(),
            avoid: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RouteStepDto {
    pub instruction: String,
    pub distance_text: String,
    pub distance_value: u32,
    pub duration_text: String,
    pub duration_value: u32,
    pub start_lat: f64,
    pub start_lng: f64,
    pub end_lat: f64,
    pub end_lng: f64,
    #[serde(default)]
    pub maneuver: Option<String>,
    #[serde(default)]
    pub polyline: String,
}

/// Wire shape of a directions response
#[derive(Debug, Serialize, Deserialize)]
pub struct RouteResponseDto {
    pub total_distance_text: String,
    pub total_distance_value: u32,
    pub total_duration_text: String,
    pub total_duration_value: u32,
    pub start_address: String,
    pub end_address: String,
    #[serde(default)]
    pub overview_polyline: String,
    pub steps: Vec<RouteStepDto>,
    pub bounds: BoundingBox,
}

impl From<RouteResponseDto> for Route {
    fn from(dto: RouteResponseDto) -> Self {
        let steps = dto
            .steps
            .into_iter()
            .map(|s| RouteStep {
                start: LatLng::new(s.start_lat, s.start_lng),
                end: LatLng::new(s.end_lat, s.end_lng),
                instruction: s.instruction,
                distance_m: s.distance_value,
                distance_text: s.distance_text,
                duration_s: s.duration_value,
                duration_text: s.duration_text,
                maneuver: s.maneuver,
            })
            .collect();
        Route {
            steps,
            bounds: dto.bounds,
            total_distance_text: dto.total_distance_text,
            total_duration_text: dto.total_duration_text,
            start_address: dto.start_address,
            end_address: dto.end_address,
        }
    }
}

/// Wire shape of the languages listing
#[derive(Debug, Serialize, Deserialize)]
pub struct LanguagesDto {
    #[serde(default)]
    pub status: String,
    pub languages: Vec<Language>,
    #[serde(default)]
    pub total: usize,
}

/// REST client for both the tour backend and the directions endpoint
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BackendError> {
        // One client for the lifetime of the process (connection pooling)
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string() })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(BackendError::Status { status: status.as_u16(), body })
    }
}

#[async_trait]
impl TourBackend for HttpBackend {
    async fn list_routes(&self) -> Result<Vec<TourRoute>, BackendError> {
        let resp = self.client.get(self.url("/tour-routes")).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn fetch_route_points(&self, route_id: &RouteId) -> Result<Vec<TourPoint>, BackendError> {
        let resp =
            self.client.get(self.url(&format!("/tour-routes/{}/points", route_id))).send().await?;
        let mut points: Vec<TourPoint> = Self::check(resp).await?.json().await?;
        points.sort_by_key(|p| p.order);
        Ok(points)
    }

    async fn create_session(
        &self,
        route_id: &RouteId,
        user_id: &str,
        language: &str,
    ) -> Result<TourSession, BackendError> {
        let body =
            CreateSessionBody { route_id: &route_id.0, user_id, current_language: language };
        let resp = self.client.post(self.url("/tour-sessions")).json(&body).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn push_location(
        &self,
        session_id: &SessionId,
        fix: &LocationFix,
    ) -> Result<(), BackendError> {
        let body = LocationBody {
            latitude: fix.latitude,
            longitude: fix.longitude,
            accuracy: fix.accuracy_m,
            timestamp: fix.captured_at,
        };
        let resp = self
            .client
            .put(self.url(&format!("/tour-sessions/{}/location", session_id)))
            .json(&body)
            .send()
            .await?;
        Self::check(resp).await?;
        debug!(session_id = %session_id, "location_pushed");
        Ok(())
    }

    async fn fetch_current_content(
        &self,
        session_id: &SessionId,
        language: &str,
    ) -> Result<CurrentContent, BackendError> {
        let resp = self
            .client
            .get(self.url(&format!("/tour-sessions/{}/current-content", session_id)))
            .query(&[("language", language)])
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn languages(&self) -> Result<Vec<Language>, BackendError> {
        let resp = self.client.get(self.url("/languages")).send().await?;
        let dto: LanguagesDto = Self::check(resp).await?.json().await?;
        Ok(dto.languages)
    }
}

#[async_trait]
impl DirectionsProvider for HttpBackend {
    async fn calculate_route(&self, request: &RouteRequest) -> Result<Route, BackendError> {
        let body = DirectionsRequestDto::from(request);
        let resp = self.client.post(self.url("/directions/calculate")).json(&body).send().await?;
        let dto: RouteResponseDto = Self::check(resp).await?.json().await?;
        if dto.steps.is_empty() {
            return Err(BackendError::Decode("route has no steps".to_string()));
        }
        Ok(dto.into())
    }
}
