//! Web server for the calibration flow and coordinate lookups
//!
//! The floor-plan UI runs on the phone. It posts taps and raw geolocation
//! readings here and reads back calibration state, capture progress and
//! mapped coordinates.

use anyhow::{Context, Result};
use arc_swap::ArcSwapOption;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_stream::{wrappers::WatchStream, StreamExt};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::calibration::{session_to_ui_points, CalibrationPoint, CalibrationSession, SessionState};
use crate::config::{CaptureConfig, Config};
use crate::error::CalibrationError;
use crate::geo::{GeoBounds, GeoFix, LatLon, PixelPoint, Sample};
use crate::location::PushedLocation;
use crate::record::CalibrationRecord;
use crate::sampler::{GpsSampler, Progress};

/// Errors returned by API handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error("a GPS capture is already running")]
    CaptureInProgress,
    #[error("point {} has no GPS fix yet; capture it again or remove it", .0 + 1)]
    PendingCapture(usize),
    #[error("no calibration is active")]
    NotCalibrated,
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Calibration(e) => match e {
                CalibrationError::CapacityExceeded(_) => StatusCode::CONFLICT,
                CalibrationError::InvalidIndex { .. } => StatusCode::NOT_FOUND,
                CalibrationError::IncompleteCalibration { .. }
                | CalibrationError::DegenerateCalibration
                | CalibrationError::InvalidRecord(_) => StatusCode::UNPROCESSABLE_ENTITY,
                CalibrationError::LocationUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
            ApiError::CaptureInProgress | ApiError::PendingCapture(_) => StatusCode::CONFLICT,
            ApiError::NotCalibrated => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(e) => {
                error!("{:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.to_string()).into_response()
    }
}

/// Progress of the running capture, as streamed to the UI
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CaptureProgress {
    pub index: usize,
    #[serde(flatten)]
    pub progress: Progress,
    pub done: bool,
}

/// Result of one GPS capture
#[derive(Debug, Clone, Serialize)]
pub struct CaptureOutcome {
    pub index: usize,
    pub fix: GeoFix,
    /// The capture completed the session and a new record is active
    pub solved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solve_error: Option<String>,
}

/// Shared application state
pub struct AppState {
    /// Points collected by the current calibration flow
    session: Mutex<CalibrationSession>,
    /// Active calibration, read lock-free by mapping requests
    record: ArcSwapOption<CalibrationRecord>,
    /// Latest device reading pushed over the API
    location: Arc<PushedLocation>,
    sampler: GpsSampler,
    capture: CaptureConfig,
    capturing: AtomicBool,
    progress: watch::Sender<Option<CaptureProgress>>,
    /// Where solved records are persisted
    record_path: PathBuf,
    /// Plan image dimensions
    width: u32,
    height: u32,
}

/// Marks a capture as running until dropped
pub struct CaptureGuard(Arc<AppState>);

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.0.capturing.store(false, Ordering::SeqCst);
    }
}

impl AppState {
    pub fn new(
        config: &Config,
        width: u32,
        height: u32,
        record: Option<CalibrationRecord>,
    ) -> Self {
        let location = Arc::new(PushedLocation::new(config.capture.max_reading_age()));
        let sampler = GpsSampler::new(location.clone());
        let (progress, _) = watch::channel(None);

        Self {
            session: Mutex::new(CalibrationSession::new()),
            record: ArcSwapOption::new(record.map(Arc::new)),
            location,
            sampler,
            capture: config.capture.clone(),
            capturing: AtomicBool::new(false),
            progress,
            record_path: config.record.path.clone(),
            width,
            height,
        }
    }

    /// The active calibration record, if any
    pub fn record(&self) -> Option<Arc<CalibrationRecord>> {
        self.record.load_full()
    }

    fn require_record(&self) -> Result<Arc<CalibrationRecord>, ApiError> {
        self.record().ok_or(ApiError::NotCalibrated)
    }

    /// Persist a record and make it the active calibration.
    ///
    /// Nothing changes when the record cannot be saved.
    pub fn activate(&self, record: CalibrationRecord) -> Result<()> {
        record.save(&self.record_path)?;
        let t = record.transform;
        info!(
            "Calibration active: lat = {:.3e}x + {:.3e}y + {:.6}, lon = {:.3e}x + {:.3e}y + {:.6}",
            t.a, t.b, t.c, t.d, t.e, t.f
        );
        self.record.store(Some(Arc::new(record)));
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    /// Claim the single capture slot
    pub fn begin_capture(self: &Arc<Self>) -> Result<CaptureGuard, ApiError> {
        if self.capturing.swap(true, Ordering::SeqCst) {
            return Err(ApiError::CaptureInProgress);
        }
        Ok(CaptureGuard(self.clone()))
    }

    fn check_pixel(&self, pixel: PixelPoint) -> Result<(), ApiError> {
        let inside = pixel.is_finite()
            && (0.0..=self.width as f64).contains(&pixel.x)
            && (0.0..=self.height as f64).contains(&pixel.y);
        if !inside {
            return Err(ApiError::BadRequest(format!(
                "({}, {}) is outside the {}x{} plan",
                pixel.x, pixel.y, self.width, self.height
            )));
        }
        Ok(())
    }

    /// Append a tapped point under a claimed capture slot. Every earlier
    /// point must already have its fix.
    pub fn add_point(&self, pixel: PixelPoint, _guard: &CaptureGuard) -> Result<usize, ApiError> {
        self.check_pixel(pixel)?;
        let mut session = self.session.lock();
        if let Some(pending) = session.points().iter().position(|p| p.geo.is_none()) {
            return Err(ApiError::PendingCapture(pending));
        }
        let index = session.add_point(pixel)?;
        info!("Calibration point {} at ({:.1}, {:.1})", index + 1, pixel.x, pixel.y);
        Ok(index)
    }

    /// Stabilize a GPS fix for point `index`, attach it and solve once all
    /// three points are captured
    pub async fn capture_point(
        &self,
        index: usize,
        _guard: CaptureGuard,
    ) -> Result<CaptureOutcome, ApiError> {
        {
            let session = self.session.lock();
            if index >= session.len() {
                return Err(CalibrationError::InvalidIndex {
                    index,
                    len: session.len(),
                }
                .into());
            }
        }

        info!("Capturing GPS for point {}", index + 1);
        let mut last = None;
        let best = self
            .sampler
            .stabilize(self.capture.duration(), self.capture.poll_interval(), |p| {
                let update = CaptureProgress {
                    index,
                    progress: *p,
                    done: false,
                };
                last = Some(update);
                self.progress.send_replace(Some(update));
            })
            .await;
        if let Some(mut update) = last {
            update.done = true;
            self.progress.send_replace(Some(update));
        }

        let fix = match best {
            Sample::Reading(fix) => fix,
            Sample::Unavailable if self.capture.accept_unavailable => {
                warn!("Point {} gets a placeholder fix, every read failed", index + 1);
                best.into_fix_lenient()
            }
            Sample::Unavailable => {
                warn!("Point {} not captured, every read failed", index + 1);
                return Err(CalibrationError::LocationUnavailable(
                    "no reading during the stabilization window".into(),
                )
                .into());
            }
        };

        let mut outcome = CaptureOutcome {
            index,
            fix,
            solved: false,
            solve_error: None,
        };

        let mut session = self.session.lock();
        session.attach_geo(index, fix)?;
        if session.is_ready_to_solve() {
            match self.solve_session(&mut session) {
                Ok(_) => outcome.solved = true,
                Err(e) => {
                    warn!("Calibration not solved: {:#}", e);
                    outcome.solve_error = Some(format!("{:#}", e));
                }
            }
        }
        Ok(outcome)
    }

    /// Solve and activate the session, discarding it only once the new
    /// record is saved
    fn solve_session(
        &self,
        session: &mut CalibrationSession,
    ) -> Result<CalibrationRecord, ApiError> {
        let record = session.solve()?;
        self.activate(record.clone()).context("Failed to persist calibration")?;
        *session = CalibrationSession::new();
        Ok(record)
    }

    /// Run a capture in the background on an already claimed slot
    pub fn spawn_capture(self: &Arc<Self>, index: usize, guard: CaptureGuard) {
        let state = self.clone();
        tokio::spawn(async move {
            match state.capture_point(index, guard).await {
                Ok(outcome) => info!(
                    "Point {} captured (±{:.1}m){}",
                    outcome.index + 1,
                    outcome.fix.accuracy,
                    if outcome.solved { ", calibration solved" } else { "" }
                ),
                Err(e) => warn!("Capture for point {} failed: {}", index + 1, e),
            }
        });
    }

    /// Solve the current session explicitly
    pub fn solve(&self) -> Result<CalibrationRecord, ApiError> {
        if self.is_capturing() {
            return Err(ApiError::CaptureInProgress);
        }
        self.solve_session(&mut self.session.lock())
    }

    fn edit_session<T>(&self, f: impl FnOnce(&mut CalibrationSession) -> T) -> Result<T, ApiError> {
        if self.is_capturing() {
            return Err(ApiError::CaptureInProgress);
        }
        Ok(f(&mut self.session.lock()))
    }
}

/// Build the API router
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/info", get(get_info))
        // Calibration flow
        .route("/api/calibration", get(get_calibration))
        .route("/api/calibration/point", post(add_point))
        .route("/api/calibration/point/last", delete(remove_last_point))
        .route("/api/calibration/point/:index/capture", post(capture_point))
        .route("/api/calibration/reset", post(reset_calibration))
        .route("/api/calibration/solve", post(solve_calibration))
        .route("/api/capture/progress", get(capture_progress))
        // Device location
        .route("/api/location", post(report_location))
        .route("/api/location/error", post(report_location_error))
        .route("/api/locate", get(locate))
        // Calibration record and mapping
        .route("/api/record", get(get_record).post(set_record))
        .route("/api/map", post(map_pixel))
        .route("/api/bounds", get(get_bounds))
        .layer(cors)
        .with_state(state)
}

/// Run the web server
pub async fn run_server(addr: &str, state: Arc<AppState>) -> Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Web server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    Ok(())
}

/// System information response
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    width: u32,
    height: u32,
    calibrated: bool,
}

async fn get_info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    Json(InfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        width: state.width,
        height: state.height,
        calibrated: state.record().is_some(),
    })
}

/// API response for calibration state
#[derive(Serialize)]
struct CalibrationResponse {
    #[serde(flatten)]
    state: SessionState,
    points: Vec<CalibrationPoint>,
    ready: bool,
    capturing: bool,
    calibrated: bool,
}

async fn get_calibration(State(state): State<Arc<AppState>>) -> Json<CalibrationResponse> {
    let session = state.session.lock();
    Json(CalibrationResponse {
        state: session.state(),
        points: session_to_ui_points(&session),
        ready: session.is_ready_to_solve(),
        capturing: state.is_capturing(),
        calibrated: state.record().is_some(),
    })
}

#[derive(Serialize)]
struct AddPointResponse {
    index: usize,
}

/// Add a tapped point and start capturing its GPS fix
async fn add_point(
    State(state): State<Arc<AppState>>,
    Json(pixel): Json<PixelPoint>,
) -> Result<Json<AddPointResponse>, ApiError> {
    let guard = state.begin_capture()?;
    let index = state.add_point(pixel, &guard)?;
    state.spawn_capture(index, guard);
    Ok(Json(AddPointResponse { index }))
}

/// Capture the GPS fix of an existing point again
async fn capture_point(
    State(state): State<Arc<AppState>>,
    Path(index): Path<usize>,
) -> Result<StatusCode, ApiError> {
    let guard = state.begin_capture()?;
    let len = state.session.lock().len();
    if index >= len {
        return Err(CalibrationError::InvalidIndex { index, len }.into());
    }
    state.spawn_capture(index, guard);
    Ok(StatusCode::ACCEPTED)
}

async fn remove_last_point(State(state): State<Arc<AppState>>) -> Result<StatusCode, ApiError> {
    match state.edit_session(|s| s.remove_last())? {
        Some(p) => {
            info!("Removed calibration point at ({:.1}, {:.1})", p.pixel.x, p.pixel.y);
            Ok(StatusCode::OK)
        }
        None => Ok(StatusCode::NOT_FOUND),
    }
}

async fn reset_calibration(State(state): State<Arc<AppState>>) -> Result<StatusCode, ApiError> {
    let had_points = state.edit_session(|s| {
        let had_points = !s.is_empty();
        s.reset();
        had_points
    })?;
    if had_points {
        info!("Calibration session reset");
    }
    Ok(StatusCode::OK)
}

async fn solve_calibration(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let record = state.solve()?;
    record_response(&record)
}

/// Server-sent events with the running capture's accuracy
async fn capture_progress(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = WatchStream::new(state.progress.subscribe())
        .filter_map(|update| update.and_then(|p| Event::default().json_data(p).ok()))
        .map(Ok);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn report_location(
    State(state): State<Arc<AppState>>,
    Json(fix): Json<GeoFix>,
) -> Result<StatusCode, ApiError> {
    if !fix.is_finite() || fix.accuracy < 0.0 {
        return Err(ApiError::BadRequest("reading must be finite".into()));
    }
    state.location.report_fix(fix);
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct LocationErrorRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn report_location_error(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LocationErrorRequest>,
) -> StatusCode {
    let reason = req.reason.unwrap_or_else(|| "device reported an error".to_string());
    tracing::debug!("Device location error: {}", reason);
    state.location.report_error(reason);
    StatusCode::OK
}

#[derive(Serialize)]
struct LocateResponse {
    x: f64,
    y: f64,
    accuracy: f64,
    /// The position falls on the plan image
    on_plan: bool,
}

/// Project the device's latest reading onto the plan
async fn locate(State(state): State<Arc<AppState>>) -> Result<Json<LocateResponse>, ApiError> {
    let record = state.require_record()?;
    let fix = state.location.latest()?;
    let pixel = record.transform.geo_to_pixel(fix.position())?;
    Ok(Json(LocateResponse {
        x: pixel.x,
        y: pixel.y,
        accuracy: fix.accuracy,
        on_plan: state.check_pixel(pixel).is_ok(),
    }))
}

fn record_response(record: &CalibrationRecord) -> Result<Response, ApiError> {
    let json = record.to_json()?;
    Ok(([(header::CONTENT_TYPE, "application/json")], json).into_response())
}

async fn get_record(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let record = state.require_record()?;
    record_response(&record)
}

/// Install a pre-supplied record, skipping the capture flow
async fn set_record(
    State(state): State<Arc<AppState>>,
    body: String,
) -> Result<StatusCode, ApiError> {
    let record = CalibrationRecord::from_json(&body)?;
    state.activate(record)?;
    Ok(StatusCode::OK)
}

async fn map_pixel(
    State(state): State<Arc<AppState>>,
    Json(pixel): Json<PixelPoint>,
) -> Result<Json<LatLon>, ApiError> {
    let record = state.require_record()?;
    if !pixel.is_finite() {
        return Err(ApiError::BadRequest("pixel must be finite".into()));
    }
    Ok(Json(record.transform.pixel_to_geo(pixel)))
}

async fn get_bounds(State(state): State<Arc<AppState>>) -> Result<Json<GeoBounds>, ApiError> {
    let record = state.require_record()?;
    Ok(Json(record.transform.image_extent_to_geo_bounds(
        state.width as f64,
        state.height as f64,
    )))
}
