//! Tour guide - location-driven tour and navigation engine
//!
//! Plays a recorded position track against the tour backend and narrates
//! tour points or turn-by-turn instructions as the user progresses.
//!
//! Module structure:
//! - `domain/` - Core types (fixes, routes, tours, progress)
//! - `io/` - External interfaces (backend, position, speech, map)
//! - `services/` - Engine components (GeoStream, progress, narration, coordinator)
//! - `infra/` - Infrastructure (Config, Metrics)
//!
//! Usage:
//!   tour-guide routes
//!   tour-guide tour --fixes config/canal_walk.jsonl
//!   tour-guide navigate --to 52.3752,4.8840 --mode walking --fixes config/canal_walk.jsonl
//!
//! While a session runs, stdin accepts `p` (play/pause), `m` (mute),
//! `l <code>` (language), `e` (end tour) and `q` (quit).

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tour_guide::domain::{LatLng, RouteId, TravelMode};
use tour_guide::infra::{Config, Metrics, SpeechEngineKind};
use tour_guide::io::map::run_log_renderer;
use tour_guide::io::{
    create_map_channel, CommandSpeechEngine, HttpBackend, LogSpeechEngine, ReplaySource,
    SpeechEngine, TourBackend,
};
use tour_guide::services::{
    Collaborators, CoordinatorCommand, CoordinatorEvent, TourSessionCoordinator,
};
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

const COMMAND_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 256;
const MAP_CAPACITY: usize = 256;

/// Tour guide - location-driven tours and navigation
#[derive(Parser, Debug)]
#[command(name = "tour-guide", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Narration language code (overrides config)
    #[arg(short, long, global = true)]
    language: Option<String>,

    /// Backend base URL (overrides config)
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List tour routes
    Routes,
    /// List narration languages
    Languages,
    /// Run a guided tour against a recorded position track
    Tour {
        /// Route ID (default: first route listed)
        #[arg(long)]
        route: Option<String>,
        /// JSON-lines position recording
        #[arg(long)]
        fixes: PathBuf,
    },
    /// Navigate to a destination against a recorded position track
    Navigate {
        /// Destination as LAT,LNG
        #[arg(long)]
        to: LatLng,
        /// driving, walking, bicycling or transit
        #[arg(long, default_value = "driving")]
        mode: TravelMode,
        /// JSON-lines position recording
        #[arg(long)]
        fixes: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Default: INFO, use RUST_LOG=debug to see map commands
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_timer(UtcTime::rfc_3339())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(UtcTime::rfc_3339())
            .with_target(false)
            .init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), git = env!("GIT_HASH"), "tour_guide_starting");

    let config_path = args.config.clone().unwrap_or_else(|| Config::resolve_config_path(&[]));
    let mut config = Config::load_from_path(&config_path);
    if let Some(language) = &args.language {
        config = config.with_language(language);
    }
    if let Some(url) = &args.backend {
        config = config.with_backend_url(url);
    }

    info!(
        config_file = %config.config_file(),
        backend = %config.backend_url(),
        language = %config.language(),
        speech = ?config.speech_engine(),
        arrival_threshold_m = config.arrival_threshold_m(),
        max_accuracy_m = config.max_accuracy_m(),
        "config_loaded"
    );

    let backend = Arc::new(
        HttpBackend::new(config.backend_url(), Duration::from_millis(config.backend_timeout_ms()))
            .context("failed to build backend client")?,
    );

    match args.command {
        Command::Routes => list_routes(backend.as_ref(), config.language()).await,
        Command::Languages => list_languages(backend.as_ref()).await,
        Command::Tour { route, fixes } => {
            let route_id = match route {
                Some(id) => RouteId(id),
                None => default_route(backend.as_ref()).await?,
            };
            let setup =
                vec![CoordinatorCommand::SelectRoute(route_id), CoordinatorCommand::StartTour];
            run_session(config, backend, fixes, setup).await;
            Ok(())
        }
        Command::Navigate { to, mode, fixes } => {
            let setup = vec![
                CoordinatorCommand::SelectDestination(to),
                CoordinatorCommand::CalculateRoute { travel_mode: mode },
            ];
            run_session(config, backend, fixes, setup).await;
            Ok(())
        }
    }
}

async fn list_routes(backend: &dyn TourBackend, language: &str) -> anyhow::Result<()> {
    let routes = backend.list_routes().await.context("failed to list routes")?;
    for route in routes {
        println!(
            "{}\t{}\t{} points\t{}",
            route.id,
            route.name,
            route.point_ids.len(),
            route.description_for(language).unwrap_or("")
        );
    }
    Ok(())
}

async fn list_languages(backend: &dyn TourBackend) -> anyhow::Result<()> {
    let languages = backend.languages().await.context("failed to list languages")?;
    for language in languages {
        println!("{}\t{} {}", language.code, language.flag, language.name);
    }
    Ok(())
}

/// First listed route, as the app preselects it
async fn default_route(backend: &dyn TourBackend) -> anyhow::Result<RouteId> {
    let routes = backend.list_routes().await.context("failed to list routes")?;
    match routes.into_iter().next() {
        Some(route) => {
            info!(route_id = %route.id, name = %route.name, "default_route_selected");
            Ok(route.id)
        }
        None => bail!("backend has no tour routes"),
    }
}

async fn run_session(
    config: Config,
    backend: Arc<HttpBackend>,
    fixes: PathBuf,
    setup: Vec<CoordinatorCommand>,
) {
    let metrics = Arc::new(Metrics::new());

    let speech: Arc<dyn SpeechEngine> = match config.speech_engine() {
        SpeechEngineKind::Log => Arc::new(LogSpeechEngine::new()),
        SpeechEngineKind::Command => {
            Arc::new(CommandSpeechEngine::new(config.speech_command(), config.speech_args()))
        }
    };

    // Map renderer (headless: debug log)
    let (map, map_rx) = create_map_channel(MAP_CAPACITY, metrics.clone());
    tokio::spawn(run_log_renderer(map_rx));

    let collaborators = Collaborators {
        backend: backend.clone(),
        directions: backend,
        source: Arc::new(ReplaySource::new(&fixes)),
        speech,
        map,
    };

    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);

    for cmd in setup {
        let _ = cmd_tx.send(cmd).await;
    }

    tokio::spawn(log_events(event_rx, cmd_tx.clone()));
    tokio::spawn(read_controls(cmd_tx.clone()));

    // Handle shutdown on Ctrl+C
    let shutdown_tx = cmd_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(CoordinatorCommand::Shutdown).await;
    });

    // Start metrics reporter (lock-free reads)
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    let reporter = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    let mut coordinator =
        TourSessionCoordinator::new(config, collaborators, metrics.clone(), Some(event_tx));
    coordinator.run(cmd_rx).await;

    reporter.abort();
    metrics.report().log();
    info!("tour_guide_shutdown_complete");
}

/// Log coordinator events; arrival ends the run
async fn log_events(
    mut rx: mpsc::Receiver<CoordinatorEvent>,
    cmd_tx: mpsc::Sender<CoordinatorCommand>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            CoordinatorEvent::SessionStarted { session_id, total_points } => {
                info!(session_id = %session_id, total_points, "session_started");
            }
            CoordinatorEvent::SessionEnded => info!("session_ended"),
            CoordinatorEvent::NavigationStarted { steps, distance, duration } => {
                info!(steps, distance = %distance, duration = %duration, "navigation_started");
            }
            CoordinatorEvent::Position(fix) => {
                info!(
                    lat = fix.latitude,
                    lng = fix.longitude,
                    accuracy_m = fix.accuracy_m.unwrap_or(-1.0),
                    "position"
                );
            }
            CoordinatorEvent::Progress(state) => {
                info!(
                    mode = state.mode.as_str(),
                    index = state.current_index,
                    total = state.total_count,
                    "progress"
                );
            }
            CoordinatorEvent::Playback(playback) => {
                info!(playing = playback.is_playing, muted = playback.is_muted, "playback");
            }
            CoordinatorEvent::Arrived => {
                info!("arrived");
                let _ = cmd_tx.send(CoordinatorCommand::Shutdown).await;
            }
            CoordinatorEvent::Error(e) => warn!(error = %e, "engine_error"),
        }
    }
}

/// Map stdin lines to playback and session controls
async fn read_controls(cmd_tx: mpsc::Sender<CoordinatorCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        let cmd = match line.split_once(' ') {
            Some(("l", code)) => CoordinatorCommand::SetLanguage(code.trim().to_string()),
            _ => match line {
                "p" => CoordinatorCommand::TogglePlay,
                "m" => CoordinatorCommand::ToggleMute,
                "e" => CoordinatorCommand::EndTour,
                "q" => CoordinatorCommand::Shutdown,
                "" => continue,
                other => {
                    warn!(input = %other, "unknown_control");
                    continue;
                }
            },
        };
        if cmd_tx.send(cmd).await.is_err() {
            break;
        }
    }
}
