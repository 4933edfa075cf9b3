//! planfix - floor-plan to GPS calibration
//!
//! The user taps three reference points on a floor-plan image and stands on
//! each of them while the device's GPS is sampled. The three pixel/GPS pairs
//! fix an affine transform that turns every later tap into a GPS position.

mod calibration;
mod config;
mod error;
mod geo;
mod location;
mod record;
mod sampler;
mod server;
mod transform;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::Config;
use crate::record::CalibrationRecord;

/// planfix - three-point floor-plan calibration service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Web server host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Web server port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Load the persisted record, falling back to the bundled one
fn load_startup_record(config: &Config) -> Option<CalibrationRecord> {
    match CalibrationRecord::load(&config.record.path) {
        Ok(Some(record)) => return Some(record),
        Ok(None) => info!("No calibration record at {:?}", config.record.path),
        Err(e) => warn!("Ignoring calibration record: {:#}", e),
    }

    let bundled = config.record.bundled.as_ref()?;
    match CalibrationRecord::load(bundled) {
        Ok(Some(record)) => {
            info!("Using bundled calibration from {:?}", bundled);
            Some(record)
        }
        Ok(None) => {
            warn!("Bundled calibration {:?} not found", bundled);
            None
        }
        Err(e) => {
            warn!("Ignoring bundled calibration: {:#}", e);
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG takes precedence over --verbose
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.verbose { "debug" } else { "info" }));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("planfix v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load_or_create(&args.config)?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let (width, height) = config.plan.extent()?;
    info!("Plan extent: {}x{} px", width, height);
    info!(
        "GPS window: {}ms, polling every {}ms",
        config.capture.duration_ms, config.capture.poll_interval_ms
    );

    let record = load_startup_record(&config);
    if record.is_none() {
        info!("Not calibrated yet, waiting for three reference points");
    }

    let state = Arc::new(server::AppState::new(&config, width, height, record));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting web server at http://{}", addr);
    server::run_server(&addr, state).await?;

    info!("Server exited normally");
    Ok(())
}
