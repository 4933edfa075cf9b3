//! Calibration session: collecting three pixel/GPS correspondences

use serde::Serialize;

use crate::error::{CalibrationError, CalibrationResult};
use crate::geo::{CorrespondencePoint, GeoFix, PixelPoint};
use crate::record::CalibrationRecord;
use crate::transform::AffineTransform;

/// Number of correspondences an affine fit needs
pub const REQUIRED_POINTS: usize = 3;

/// Where a session is in its capture sequence
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "state", content = "count", rename_all = "lowercase")]
pub enum SessionState {
    Empty,
    Collecting(usize),
    Complete,
}

/// A labeled calibration point for the UI
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationPoint {
    pub index: usize,
    pub label: String,
    pub x: f64,
    pub y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gps: Option<GeoFix>,
    /// The attached fix came from failed reads only
    pub low_confidence: bool,
}

/// Up to three correspondences, appended one at a time
#[derive(Debug, Clone, Default)]
pub struct CalibrationSession {
    points: Vec<CorrespondencePoint>,
}

impl CalibrationSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> &[CorrespondencePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Append a tapped point; its GPS fix is attached later
    pub fn add_point(&mut self, pixel: PixelPoint) -> CalibrationResult<usize> {
        if self.points.len() >= REQUIRED_POINTS {
            return Err(CalibrationError::CapacityExceeded(self.points.len()));
        }
        self.points.push(CorrespondencePoint::new(pixel));
        Ok(self.points.len() - 1)
    }

    /// Set (or replace) the GPS fix of an existing point
    pub fn attach_geo(&mut self, index: usize, fix: GeoFix) -> CalibrationResult<()> {
        let len = self.points.len();
        let point = self
            .points
            .get_mut(index)
            .ok_or(CalibrationError::InvalidIndex { index, len })?;
        point.geo = Some(fix);
        Ok(())
    }

    /// Remove the most recently added point
    pub fn remove_last(&mut self) -> Option<CorrespondencePoint> {
        self.points.pop()
    }

    /// Discard every point
    pub fn reset(&mut self) {
        self.points.clear();
    }

    fn with_geo(&self) -> usize {
        self.points.iter().filter(|p| p.geo.is_some()).count()
    }

    /// Three points, each with a GPS fix
    pub fn is_ready_to_solve(&self) -> bool {
        self.points.len() == REQUIRED_POINTS && self.with_geo() == REQUIRED_POINTS
    }

    pub fn state(&self) -> SessionState {
        match self.points.len() {
            0 => SessionState::Empty,
            _ if self.is_ready_to_solve() => SessionState::Complete,
            n => SessionState::Collecting(n),
        }
    }

    /// Fit the transform and produce the durable record.
    ///
    /// The session itself is left untouched so a degenerate set of points
    /// can be corrected with [`remove_last`](Self::remove_last).
    pub fn solve(&self) -> CalibrationResult<CalibrationRecord> {
        let points: [CorrespondencePoint; REQUIRED_POINTS] = match self.points.as_slice() {
            [p0, p1, p2] if self.is_ready_to_solve() => [*p0, *p1, *p2],
            _ => {
                return Err(CalibrationError::IncompleteCalibration {
                    len: self.points.len(),
                    with_geo: self.with_geo(),
                })
            }
        };
        let transform = AffineTransform::solve(&points)?;
        Ok(CalibrationRecord::new(transform, points))
    }
}

/// Get all session points as labeled UI points
pub fn session_to_ui_points(session: &CalibrationSession) -> Vec<CalibrationPoint> {
    session
        .points()
        .iter()
        .enumerate()
        .map(|(index, p)| CalibrationPoint {
            index,
            label: format!("Point {}", index + 1),
            x: p.pixel.x,
            y: p.pixel.y,
            gps: p.geo,
            low_confidence: p.geo.map(|g| g.is_sentinel()).unwrap_or(false),
        })
        .collect()
}
