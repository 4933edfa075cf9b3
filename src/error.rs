//! Calibration engine errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("calibration already has {0} points")]
    CapacityExceeded(usize),
    #[error("no calibration point at index {index} (have {len})")]
    InvalidIndex { index: usize, len: usize },
    #[error("calibration needs 3 points with GPS fixes, have {with_geo} of {len}")]
    IncompleteCalibration { len: usize, with_geo: usize },
    #[error("calibration points are collinear")]
    DegenerateCalibration,
    #[error("location unavailable: {0}")]
    LocationUnavailable(String),
    #[error("invalid calibration record: {0}")]
    InvalidRecord(String),
}

pub type CalibrationResult<T> = Result<T, CalibrationError>;
