//! Affine pixel-to-GPS transformation
//!
//! Three pixel/GPS correspondences fix a 6-parameter affine map:
//!
//! ```text
//! lat = a*x + b*y + c
//! lon = d*x + e*y + f
//! ```
//!
//! Latitude and longitude are solved as two independent 3x3 systems that
//! share the same coefficient matrix of pixel coordinates.

use serde::{Deserialize, Serialize};

use crate::error::{CalibrationError, CalibrationResult};
use crate::geo::{CorrespondencePoint, GeoBounds, GeoFix, LatLon, PixelPoint};

/// Pivots smaller than this fraction of the largest matrix entry are
/// treated as zero
const PIVOT_EPSILON: f64 = 1e-9;

/// Solved affine map from plan pixels to latitude/longitude
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AffineTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl AffineTransform {
    pub fn new(a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) -> Self {
        Self { a, b, c, d, e, f }
    }

    /// Fit the transform exactly through three correspondences.
    ///
    /// Every point must carry a GPS fix and the pixel points must not be
    /// collinear.
    pub fn solve(points: &[CorrespondencePoint; 3]) -> CalibrationResult<Self> {
        let mut fixes = [GeoFix::sentinel(); 3];
        for (slot, point) in fixes.iter_mut().zip(points) {
            *slot = point.geo.ok_or(CalibrationError::IncompleteCalibration {
                len: points.len(),
                with_geo: points.iter().filter(|p| p.geo.is_some()).count(),
            })?;
        }

        let mut a = [[0.0f64; 3]; 3];
        for (row, point) in a.iter_mut().zip(points) {
            *row = [point.pixel.x, point.pixel.y, 1.0];
        }

        let lat = solve_linear_system(a, [fixes[0].lat, fixes[1].lat, fixes[2].lat])?;
        let lon = solve_linear_system(a, [fixes[0].lon, fixes[1].lon, fixes[2].lon])?;

        let transform = Self::new(lat[0], lat[1], lat[2], lon[0], lon[1], lon[2]);
        if !transform.is_finite() {
            return Err(CalibrationError::DegenerateCalibration);
        }
        Ok(transform)
    }

    pub fn is_finite(&self) -> bool {
        [self.a, self.b, self.c, self.d, self.e, self.f]
            .iter()
            .all(|v| v.is_finite())
    }

    /// Map a plan pixel to GPS coordinates
    #[inline]
    pub fn pixel_to_geo(&self, pixel: PixelPoint) -> LatLon {
        LatLon::new(
            self.a * pixel.x + self.b * pixel.y + self.c,
            self.d * pixel.x + self.e * pixel.y + self.f,
        )
    }

    /// Map GPS coordinates back onto the plan
    pub fn geo_to_pixel(&self, pos: LatLon) -> CalibrationResult<PixelPoint> {
        let det = self.a * self.e - self.b * self.d;
        let scale = (self.a * self.e).abs().max((self.b * self.d).abs());
        if det == 0.0 || det.abs() <= f64::EPSILON * scale {
            return Err(CalibrationError::DegenerateCalibration);
        }

        let dlat = pos.lat - self.c;
        let dlon = pos.lon - self.f;
        Ok(PixelPoint {
            x: (self.e * dlat - self.b * dlon) / det,
            y: (self.a * dlon - self.d * dlat) / det,
        })
    }

    /// GPS bounding box of the image's four corners.
    ///
    /// With rotation or shear the projected image is not a rectangle in GPS
    /// space; the box encloses it.
    pub fn image_extent_to_geo_bounds(&self, width: f64, height: f64) -> GeoBounds {
        let corners = [
            PixelPoint::new(0.0, 0.0),
            PixelPoint::new(width, 0.0),
            PixelPoint::new(0.0, height),
            PixelPoint::new(width, height),
        ];
        GeoBounds::enclosing(&corners.map(|p| self.pixel_to_geo(p)))
    }
}

/// Solve a 3x3 linear system by Gauss-Jordan elimination.
///
/// Each pivot row is normalized to 1 and eliminated from every other row, so
/// the right-hand side ends up holding the solution directly.
fn solve_linear_system(mut a: [[f64; 3]; 3], mut b: [f64; 3]) -> CalibrationResult<[f64; 3]> {
    let n = 3;
    let scale = a
        .iter()
        .flatten()
        .fold(0.0f64, |m, v| m.max(v.abs()))
        .max(1.0);

    for col in 0..n {
        // Find pivot
        let mut max_row = col;
        let mut max_val = a[col][col].abs();
        for row in (col + 1)..n {
            if a[row][col].abs() > max_val {
                max_val = a[row][col].abs();
                max_row = row;
            }
        }

        if max_row != col {
            a.swap(col, max_row);
            b.swap(col, max_row);
        }

        let pivot = a[col][col];
        if !pivot.is_finite() || pivot.abs() < PIVOT_EPSILON * scale {
            return Err(CalibrationError::DegenerateCalibration);
        }

        for j in 0..n {
            a[col][j] /= pivot;
        }
        b[col] /= pivot;

        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = a[row][col];
            if factor == 0.0 {
                continue;
            }
            for j in 0..n {
                a[row][j] -= factor * a[col][j];
            }
            b[row] -= factor * b[col];
        }
    }

    Ok(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix3, Vector3};

    fn cp(x: f64, y: f64, lat: f64, lon: f64) -> CorrespondencePoint {
        CorrespondencePoint::with_geo(PixelPoint::new(x, y), GeoFix::new(lat, lon, 5.0))
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
    }

    #[test]
    fn test_axis_aligned_example() {
        let points = [
            cp(0.0, 0.0, 10.0, 20.0),
            cp(100.0, 0.0, 10.0, 25.0),
            cp(0.0, 100.0, 15.0, 20.0),
        ];
        let t = AffineTransform::solve(&points).unwrap();

        assert_close(t.a, 0.0);
        assert_close(t.b, 0.05);
        assert_close(t.c, 10.0);
        assert_close(t.d, 0.05);
        assert_close(t.e, 0.0);
        assert_close(t.f, 20.0);

        let mid = t.pixel_to_geo(PixelPoint::new(50.0, 50.0));
        assert_close(mid.lat, 12.5);
        assert_close(mid.lon, 22.5);
    }

    #[test]
    fn test_exact_at_defining_points() {
        let points = [
            cp(120.0, 80.0, 52.52001, 13.40495),
            cp(860.0, 140.0, 52.52034, 13.40621),
            cp(410.0, 710.0, 52.51912, 13.40566),
        ];
        let t = AffineTransform::solve(&points).unwrap();

        for p in &points {
            let geo = p.geo.unwrap();
            let mapped = t.pixel_to_geo(p.pixel);
            assert!((mapped.lat - geo.lat).abs() < 1e-10);
            assert!((mapped.lon - geo.lon).abs() < 1e-10);
        }
    }

    #[test]
    fn test_matches_reference_inverse() {
        let points = [
            cp(31.0, 402.0, 48.85811, 2.29448),
            cp(777.0, 95.0, 48.85902, 2.29611),
            cp(540.0, 930.0, 48.85744, 2.29599),
        ];
        let t = AffineTransform::solve(&points).unwrap();

        let m = Matrix3::new(
            31.0, 402.0, 1.0, //
            777.0, 95.0, 1.0, //
            540.0, 930.0, 1.0,
        );
        let inv = m.try_inverse().unwrap();
        let lat = inv * Vector3::new(48.85811, 48.85902, 48.85744);
        let lon = inv * Vector3::new(2.29448, 2.29611, 2.29599);

        assert!((t.a - lat[0]).abs() < 1e-11);
        assert!((t.b - lat[1]).abs() < 1e-11);
        assert!((t.c - lat[2]).abs() < 1e-8);
        assert!((t.d - lon[0]).abs() < 1e-11);
        assert!((t.e - lon[1]).abs() < 1e-11);
        assert!((t.f - lon[2]).abs() < 1e-8);
    }

    #[test]
    fn test_collinear_points_rejected() {
        let points = [
            cp(0.0, 0.0, 10.0, 20.0),
            cp(10.0, 0.0, 10.0, 21.0),
            cp(20.0, 0.0, 10.0, 22.0),
        ];
        assert_eq!(
            AffineTransform::solve(&points),
            Err(CalibrationError::DegenerateCalibration)
        );
    }

    #[test]
    fn test_diagonal_collinear_points_rejected() {
        let points = [
            cp(0.0, 0.0, 10.0, 20.0),
            cp(300.0, 300.0, 11.0, 21.0),
            cp(700.0, 700.0, 12.0, 22.0),
        ];
        assert_eq!(
            AffineTransform::solve(&points),
            Err(CalibrationError::DegenerateCalibration)
        );
    }

    #[test]
    fn test_missing_geo_is_incomplete() {
        let points = [
            cp(0.0, 0.0, 10.0, 20.0),
            CorrespondencePoint::new(PixelPoint::new(100.0, 0.0)),
            cp(0.0, 100.0, 15.0, 20.0),
        ];
        assert_eq!(
            AffineTransform::solve(&points),
            Err(CalibrationError::IncompleteCalibration { len: 3, with_geo: 2 })
        );
    }

    #[test]
    fn test_bounds_without_cross_terms() {
        let t = AffineTransform::new(-0.001, 0.0, 50.0, 0.0, 0.002, 8.0);
        let (w, h) = (640.0, 480.0);
        let bounds = t.image_extent_to_geo_bounds(w, h);

        let corners: Vec<LatLon> = [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)]
            .iter()
            .map(|&(x, y)| t.pixel_to_geo(PixelPoint::new(x, y)))
            .collect();
        let min_lat = corners.iter().map(|p| p.lat).fold(f64::INFINITY, f64::min);
        let max_lat = corners.iter().map(|p| p.lat).fold(f64::NEG_INFINITY, f64::max);
        let min_lon = corners.iter().map(|p| p.lon).fold(f64::INFINITY, f64::min);
        let max_lon = corners.iter().map(|p| p.lon).fold(f64::NEG_INFINITY, f64::max);

        assert_eq!(bounds.min_lat, min_lat);
        assert_eq!(bounds.max_lat, max_lat);
        assert_eq!(bounds.min_lon, min_lon);
        assert_eq!(bounds.max_lon, max_lon);
        assert_close(bounds.min_lat, 50.0 - 0.64);
        assert_close(bounds.max_lon, 8.0 + 0.96);
    }

    #[test]
    fn test_geo_to_pixel_inverts_forward() {
        let t = AffineTransform::new(1e-6, -2e-6, 52.5, 3e-6, 1e-6, 13.4);
        let p = PixelPoint::new(321.0, 654.0);
        let back = t.geo_to_pixel(t.pixel_to_geo(p)).unwrap();
        assert!((back.x - p.x).abs() < 1e-6);
        assert!((back.y - p.y).abs() < 1e-6);
    }

    #[test]
    fn test_geo_to_pixel_singular() {
        let t = AffineTransform::new(1.0, 2.0, 0.0, 2.0, 4.0, 0.0);
        assert_eq!(
            t.geo_to_pixel(LatLon::new(1.0, 1.0)),
            Err(CalibrationError::DegenerateCalibration)
        );
    }
}
