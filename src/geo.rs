//! Pixel and GPS primitives shared by the calibration engine

use serde::{Deserialize, Serialize};

/// Accuracy reported for a failed location read
pub const SENTINEL_ACCURACY_M: f64 = 999.0;

/// A position on the floor-plan image, in pixels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PixelPoint {
    pub x: f64,
    pub y: f64,
}

impl PixelPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// A latitude/longitude pair without accuracy information
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Planar distance in degrees; only meaningful for nearby points
    pub fn distance_deg(&self, other: &LatLon) -> f64 {
        (self.lat - other.lat).hypot(self.lon - other.lon)
    }
}

/// A single geolocation reading
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoFix {
    pub lat: f64,
    pub lon: f64,
    /// Estimated error radius in meters, lower is better
    pub accuracy: f64,
}

impl GeoFix {
    pub fn new(lat: f64, lon: f64, accuracy: f64) -> Self {
        Self { lat, lon, accuracy }
    }

    /// The placeholder fix stored when only failed reads were available
    pub fn sentinel() -> Self {
        Self::new(0.0, 0.0, SENTINEL_ACCURACY_M)
    }

    pub fn is_sentinel(&self) -> bool {
        self.accuracy >= SENTINEL_ACCURACY_M
    }

    pub fn position(&self) -> LatLon {
        LatLon::new(self.lat, self.lon)
    }

    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lon.is_finite() && self.accuracy.is_finite()
    }
}

/// One poll result from the location source.
///
/// Failed reads are kept as their own variant so a caller can tell a genuine
/// 999 m fix apart from a read that never happened.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Sample {
    Reading(GeoFix),
    Unavailable,
}

impl Sample {
    pub fn accuracy(&self) -> f64 {
        match self {
            Sample::Reading(fix) => fix.accuracy,
            Sample::Unavailable => SENTINEL_ACCURACY_M,
        }
    }

    pub fn is_low_confidence(&self) -> bool {
        matches!(self, Sample::Unavailable)
    }

    pub fn fix(&self) -> Option<GeoFix> {
        match self {
            Sample::Reading(fix) => Some(*fix),
            Sample::Unavailable => None,
        }
    }

    /// Collapse into a fix, substituting the sentinel for a failed read
    pub fn into_fix_lenient(self) -> GeoFix {
        self.fix().unwrap_or_else(GeoFix::sentinel)
    }
}

/// One calibration point: where the user tapped and, once captured, where
/// they were standing
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CorrespondencePoint {
    pub pixel: PixelPoint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo: Option<GeoFix>,
}

impl CorrespondencePoint {
    pub fn new(pixel: PixelPoint) -> Self {
        Self { pixel, geo: None }
    }

    pub fn with_geo(pixel: PixelPoint, geo: GeoFix) -> Self {
        Self {
            pixel,
            geo: Some(geo),
        }
    }
}

/// Axis-aligned extent in GPS space
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeoBounds {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl GeoBounds {
    /// Smallest box containing all given positions
    pub fn enclosing(positions: &[LatLon]) -> Self {
        let mut bounds = GeoBounds {
            min_lon: f64::INFINITY,
            max_lon: f64::NEG_INFINITY,
            min_lat: f64::INFINITY,
            max_lat: f64::NEG_INFINITY,
        };
        for p in positions {
            bounds.min_lon = bounds.min_lon.min(p.lon);
            bounds.max_lon = bounds.max_lon.max(p.lon);
            bounds.min_lat = bounds.min_lat.min(p.lat);
            bounds.max_lat = bounds.max_lat.max(p.lat);
        }
        bounds
    }
}
