//! Location source fed by the device over the HTTP API
//!
//! The phone runs the actual geolocation and pushes each reading here; the
//! sampler then polls the most recent one.

use futures::future::{self, BoxFuture};
use parking_lot::RwLock;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::CalibrationError;
use crate::geo::GeoFix;
use crate::sampler::LocationSource;

#[derive(Debug, Clone)]
enum Report {
    Fix(GeoFix),
    Failed(String),
}

/// Holds the latest reading reported by the device
pub struct PushedLocation {
    latest: RwLock<Option<(Report, Instant)>>,
    max_age: Duration,
}

impl PushedLocation {
    pub fn new(max_age: Duration) -> Self {
        Self {
            latest: RwLock::new(None),
            max_age,
        }
    }

    /// Store a reading from the device
    pub fn report_fix(&self, fix: GeoFix) {
        *self.latest.write() = Some((Report::Fix(fix), Instant::now()));
    }

    /// Record that the device failed to get a position
    pub fn report_error(&self, reason: impl Into<String>) {
        *self.latest.write() = Some((Report::Failed(reason.into()), Instant::now()));
    }

    /// The latest reading, if fresh and not a failure
    pub fn latest(&self) -> Result<GeoFix, CalibrationError> {
        match &*self.latest.read() {
            None => Err(CalibrationError::LocationUnavailable(
                "no reading reported yet".into(),
            )),
            Some((_, at)) if at.elapsed() > self.max_age => Err(
                CalibrationError::LocationUnavailable(format!(
                    "last reading is {}ms old",
                    at.elapsed().as_millis()
                )),
            ),
            Some((Report::Failed(reason), _)) => {
                Err(CalibrationError::LocationUnavailable(reason.clone()))
            }
            Some((Report::Fix(fix), _)) => Ok(*fix),
        }
    }
}

impl LocationSource for PushedLocation {
    fn current_reading(&self) -> BoxFuture<'_, Result<GeoFix, CalibrationError>> {
        Box::pin(future::ready(self.latest()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_unavailable() {
        let loc = PushedLocation::new(Duration::from_secs(5));
        assert!(matches!(
            loc.latest(),
            Err(CalibrationError::LocationUnavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_fix_returned_until_stale() {
        let loc = PushedLocation::new(Duration::from_secs(5));
        loc.report_fix(GeoFix::new(52.0, 13.0, 8.0));
        assert_eq!(loc.current_reading().await, Ok(GeoFix::new(52.0, 13.0, 8.0)));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(loc.current_reading().await.is_err());
    }

    #[test]
    fn test_error_report_replaces_fix() {
        let loc = PushedLocation::new(Duration::from_secs(5));
        loc.report_fix(GeoFix::new(52.0, 13.0, 8.0));
        loc.report_error("permission denied");
        assert_eq!(
            loc.latest(),
            Err(CalibrationError::LocationUnavailable("permission denied".into()))
        );
    }
}
