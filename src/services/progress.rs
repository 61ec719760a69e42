//! Progress tracking along a navigation route or a guided tour
//!
//! Navigation progress is computed here from distances to step end points.
//! Tour progress is decided by the backend; the tracker only applies the
//! content it returns, keeping the index monotonic.

use crate::domain::geo::haversine_m;
use crate::domain::{CurrentContent, LocationFix, ProgressMode, ProgressState, Route, RouteStep};
use crate::infra::config::Config;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressConfig {
    pub arrival_threshold_m: f64,
    pub max_accuracy_m: f64,
    /// 0 disables the staleness check
    pub max_fix_age_ms: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self { arrival_threshold_m: 30.0, max_accuracy_m: 100.0, max_fix_age_ms: 10_000 }
    }
}

impl From<&Config> for ProgressConfig {
    fn from(config: &Config) -> Self {
        Self {
            arrival_threshold_m: config.arrival_threshold_m(),
            max_accuracy_m: config.max_accuracy_m(),
            max_fix_age_ms: config.max_fix_age_ms(),
        }
    }
}

/// Whether a fix may drive progression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixQuality {
    Reliable,
    /// Accuracy unknown or worse than the ceiling
    Inaccurate,
    Stale,
}

pub struct ProgressTracker {
    config: ProgressConfig,
    state: ProgressState,
    route: Option<Route>,
    last_fix: Option<LocationFix>,
}

impl ProgressTracker {
    pub fn new(config: ProgressConfig) -> Self {
        Self { config, state: ProgressState::idle(), route: None, last_fix: None }
    }

    /// Begin turn-by-turn progression at step 0
    pub fn start_navigation(&mut self, route: Route) -> &ProgressState {
        let total = route.steps.len();
        let mode = if total == 0 { ProgressMode::Arrived } else { ProgressMode::Navigation };
        self.state =
            ProgressState { mode, current_index: 0, total_count: total, current_content: None };
        self.route = Some(route);
        info!(steps = total, "navigation_started");
        &self.state
    }

    /// Begin tour progression; the backend moves the index
    pub fn start_tour(&mut self, total_points: usize) -> &ProgressState {
        self.route = None;
        self.state = ProgressState {
            mode: ProgressMode::Tour,
            current_index: 0,
            total_count: total_points,
            current_content: None,
        };
        info!(points = total_points, "tour_progress_started");
        &self.state
    }

    /// Back to Idle, forgetting the route and last fix
    pub fn reset(&mut self) {
        self.state = ProgressState::idle();
        self.route = None;
        self.last_fix = None;
    }

    pub fn classify(&self, fix: &LocationFix, now: DateTime<Utc>) -> FixQuality {
        if self.config.max_fix_age_ms > 0 && fix.age_ms(now) > self.config.max_fix_age_ms {
            return FixQuality::Stale;
        }
        match fix.accuracy_m {
            Some(acc) if acc <= self.config.max_accuracy_m => FixQuality::Reliable,
            _ => FixQuality::Inaccurate,
        }
    }

    pub fn advance(&mut self, fix: &LocationFix) -> &ProgressState {
        self.advance_at(fix, Utc::now())
    }

    /// Record `fix` and, in navigation, move to the next step when the
    /// current step's end point is within the arrival threshold. At most one
    /// step per call.
    pub fn advance_at(&mut self, fix: &LocationFix, now: DateTime<Utc>) -> &ProgressState {
        self.last_fix = Some(fix.clone());

        if self.state.mode != ProgressMode::Navigation {
            return &self.state;
        }

        let quality = self.classify(fix, now);
        if quality != FixQuality::Reliable {
            debug!(quality = ?quality, accuracy_m = ?fix.accuracy_m, "fix_not_reliable");
            return &self.state;
        }

        let Some(step) = self.current_step() else {
            return &self.state;
        };
        let distance = haversine_m(fix.position(), step.end);
        if distance.is_nan() || distance > self.config.arrival_threshold_m {
            return &self.state;
        }

        let next = self.state.current_index + 1;
        if next >= self.state.total_count {
            self.state.mode = ProgressMode::Arrived;
            info!(step = self.state.current_index, "navigation_arrived");
        } else {
            self.state.current_index = next;
            info!(step = next, total = self.state.total_count, "navigation_step_advanced");
        }
        &self.state
    }

    /// Apply backend content in tour mode. Returns `false` when the content
    /// was discarded.
    pub fn apply_content(&mut self, content: CurrentContent) -> bool {
        if self.state.mode != ProgressMode::Tour {
            debug!(mode = self.state.mode.as_str(), "content_ignored");
            return false;
        }

        let total = content.total_points as usize;
        if total == 0 {
            self.state.total_count = 0;
            self.state.mode = ProgressMode::Arrived;
            self.state.current_content = Some(content);
            return true;
        }

        // Backend progress is 1-based
        let index = (content.progress.max(1) as usize - 1).min(total - 1);
        if index < self.state.current_index {
            log_regression(self.state.current_index, index);
            return false;
        }

        let complete = content.is_complete();
        self.state.current_index = index;
        self.state.total_count = total;
        self.state.current_content = Some(content);
        if complete {
            self.state.mode = ProgressMode::Arrived;
            info!(total = total, "tour_completed");
        }
        true
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    pub fn current_step(&self) -> Option<&RouteStep> {
        self.route.as_ref()?.steps.get(self.state.current_index)
    }

    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    pub fn last_fix(&self) -> Option<&LocationFix> {
        self.last_fix.as_ref()
    }
}

#[cold]
fn log_regression(current: usize, received: usize) {
    warn!(current_index = current, received_index = received, "content_regression_discarded");
}
