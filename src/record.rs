//! Serializable calibration result
//!
//! The JSON form is flat: the six coefficients next to the three points they
//! were fitted from, so a stored record can be audited by hand.
//!
//! ```json
//! { "a": 0.0, "b": 0.05, "c": 10.0, "d": 0.05, "e": 0.0, "f": 20.0,
//!   "points": [
//!     { "imageXY": [0.0, 0.0], "gps": { "lat": 10.0, "lon": 20.0, "accuracy": 4.0 } },
//!     ...
//!   ] }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CalibrationError, CalibrationResult};
use crate::geo::{CorrespondencePoint, GeoFix, PixelPoint};
use crate::transform::AffineTransform;

/// Largest distance, in degrees, between a source fix and the transform's
/// projection of its pixel for a record to be accepted (about 1 m)
const MAX_RESIDUAL_DEG: f64 = 1e-5;

/// The solved transform together with its source points
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationRecord {
    pub transform: AffineTransform,
    pub points: [CorrespondencePoint; 3],
}

#[derive(Serialize, Deserialize)]
struct RecordJson {
    a: f64,
    b: f64,
    c: f64,
    d: f64,
    e: f64,
    f: f64,
    points: [PointJson; 3],
}

#[derive(Serialize, Deserialize)]
struct PointJson {
    #[serde(rename = "imageXY")]
    image_xy: [f64; 2],
    gps: GeoFix,
}

impl CalibrationRecord {
    pub fn new(transform: AffineTransform, points: [CorrespondencePoint; 3]) -> Self {
        Self { transform, points }
    }

    /// Per-point distance between the recorded fix and the projected pixel
    pub fn residuals(&self) -> [f64; 3] {
        self.points.map(|p| match p.geo {
            Some(geo) => self.transform.pixel_to_geo(p.pixel).distance_deg(&geo.position()),
            None => f64::INFINITY,
        })
    }

    /// Reject records that could not have come from a valid solve
    pub fn validate(&self) -> CalibrationResult<()> {
        if !self.transform.is_finite() {
            return Err(CalibrationError::InvalidRecord(
                "non-finite transform coefficient".into(),
            ));
        }
        for (i, p) in self.points.iter().enumerate() {
            let geo = p.geo.ok_or_else(|| {
                CalibrationError::InvalidRecord(format!("point {} has no GPS fix", i))
            })?;
            if !p.pixel.is_finite() || !geo.is_finite() {
                return Err(CalibrationError::InvalidRecord(format!(
                    "point {} has non-finite coordinates",
                    i
                )));
            }
        }
        if let Some((i, r)) = self
            .residuals()
            .iter()
            .enumerate()
            .find(|(_, r)| !r.is_finite() || **r > MAX_RESIDUAL_DEG)
        {
            return Err(CalibrationError::InvalidRecord(format!(
                "transform misses point {} by {:.2e} degrees",
                i, r
            )));
        }
        Ok(())
    }

    pub fn to_json(&self) -> CalibrationResult<String> {
        let t = &self.transform;
        let json = RecordJson {
            a: t.a,
            b: t.b,
            c: t.c,
            d: t.d,
            e: t.e,
            f: t.f,
            points: self.points.map(|p| PointJson {
                image_xy: [p.pixel.x, p.pixel.y],
                gps: p.geo.unwrap_or_else(GeoFix::sentinel),
            }),
        };
        serde_json::to_string_pretty(&json)
            .map_err(|e| CalibrationError::InvalidRecord(e.to_string()))
    }

    pub fn from_json(blob: &str) -> CalibrationResult<Self> {
        let json: RecordJson = serde_json::from_str(blob)
            .map_err(|e| CalibrationError::InvalidRecord(e.to_string()))?;
        let record = Self {
            transform: AffineTransform::new(json.a, json.b, json.c, json.d, json.e, json.f),
            points: json.points.map(|p| {
                CorrespondencePoint::with_geo(PixelPoint::new(p.image_xy[0], p.image_xy[1]), p.gps)
            }),
        };
        record.validate()?;
        Ok(record)
    }

    /// Load a record from disk; `Ok(None)` if the file does not exist
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read calibration record from {:?}", path))?;
        let record = Self::from_json(&content)
            .with_context(|| format!("Failed to parse calibration record from {:?}", path))?;
        tracing::info!("Loaded calibration record from {:?}", path);
        Ok(Some(record))
    }

    /// Save the record to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_json()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create record directory {:?}", parent))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write calibration record to {:?}", path))?;

        tracing::info!("Saved calibration record to {:?}", path);
        Ok(())
    }
}
