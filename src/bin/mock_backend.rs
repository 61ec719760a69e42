//! Mock tour backend
//!
//! Serves tour routes, sessions, directions and languages over HTTP for
//! local runs of `tour-guide`.
//!
//! Behavior:
//! 1. Loads routes and points from the bundled Amsterdam canal tour, or
//!    from `--data`
//! 2. Advances a session when a pushed location enters the next point's
//!    trigger radius
//! 3. Answers directions with a straight line split into legs
//!
//! Usage:
//!   cargo run --bin mock-backend -- --port 8001
//!   cargo run --bin mock-backend -- --data my_tour.json

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tour_guide::io::mock_backend::{serve, MockBackend, TourData};
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mock-backend")]
#[command(about = "Mock tour backend for local simulation")]
struct Args {
    /// HTTP port to listen on
    #[arg(short, long, default_value = "8001")]
    port: u16,

    /// Tour data JSON (routes and points); defaults to the bundled sample
    #[arg(short, long)]
    data: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();

    let data = match &args.data {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read tour data {}", path.display()))?;
            TourData::parse(&json)
                .with_context(|| format!("Failed to parse tour data {}", path.display()))?
        }
        None => TourData::sample().context("bundled sample tour is invalid")?,
    };
    info!(routes = data.routes.len(), points = data.points.len(), "mock_data_loaded");

    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], args.port)))
        .await
        .with_context(|| format!("Failed to bind port {}", args.port))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    serve(listener, Arc::new(MockBackend::new(data)), shutdown_rx)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}
