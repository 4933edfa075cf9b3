//! GPS stabilization
//!
//! A single geolocation read is noisy. The sampler polls the location source
//! over a fixed window and keeps the most accurate reading it saw.

use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::error::CalibrationError;
use crate::geo::{GeoFix, Sample};

/// Anything that can produce the device's current position
pub trait LocationSource: Send + Sync {
    fn current_reading(&self) -> BoxFuture<'_, Result<GeoFix, CalibrationError>>;
}

/// Intermediate observation emitted after every poll
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct Progress {
    pub sample: Sample,
    /// Accuracy of the best sample so far
    pub best_accuracy: f64,
    pub samples: usize,
    pub elapsed_ms: u64,
}

/// Polls a [`LocationSource`] and picks the best reading of a time window
#[derive(Clone)]
pub struct GpsSampler {
    source: Arc<dyn LocationSource>,
}

impl GpsSampler {
    pub fn new(source: Arc<dyn LocationSource>) -> Self {
        Self { source }
    }

    /// Sample the location source for `duration` and return the reading with
    /// the lowest accuracy value.
    ///
    /// The window is measured from the call. The first read happens
    /// immediately, so at least one sample is always taken; later reads are
    /// only made while they still fall inside the window. Failed reads become
    /// [`Sample::Unavailable`] and never end the loop early.
    pub async fn stabilize<F>(
        &self,
        duration: Duration,
        poll_interval: Duration,
        mut on_progress: F,
    ) -> Sample
    where
        F: FnMut(&Progress),
    {
        let start = Instant::now();
        let mut best = Sample::Unavailable;
        let mut samples = 0usize;

        loop {
            let sample = match self.source.current_reading().await {
                Ok(fix) => Sample::Reading(fix),
                Err(e) => {
                    debug!("Location read failed: {}", e);
                    Sample::Unavailable
                }
            };
            samples += 1;

            // Ties keep the earlier sample; a real reading always beats a failed one
            if samples == 1
                || sample.accuracy() < best.accuracy()
                || (best.is_low_confidence() && !sample.is_low_confidence())
            {
                best = sample;
            }

            let elapsed = start.elapsed();
            on_progress(&Progress {
                sample,
                best_accuracy: best.accuracy(),
                samples,
                elapsed_ms: elapsed.as_millis() as u64,
            });

            // The next read would land outside the window
            if elapsed + poll_interval > duration {
                break;
            }
            sleep(poll_interval).await;
        }

        match best {
            Sample::Reading(fix) => info!(
                "Stabilized GPS over {} samples: {:.6}, {:.6} (±{:.1}m)",
                samples, fix.lat, fix.lon, fix.accuracy
            ),
            Sample::Unavailable => warn!("No location reading in {} samples", samples),
        }

        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays a fixed script of reads, failing once it runs out
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<GeoFix, CalibrationError>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<GeoFix, CalibrationError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            }
        }

        fn accuracies(values: &[f64]) -> Self {
            Self::new(
                values
                    .iter()
                    .enumerate()
                    .map(|(i, &acc)| Ok(GeoFix::new(45.0 + i as f64 * 1e-5, 7.0, acc)))
                    .collect(),
            )
        }
    }

    impl LocationSource for ScriptedSource {
        fn current_reading(&self) -> BoxFuture<'_, Result<GeoFix, CalibrationError>> {
            Box::pin(async move {
                *self.calls.lock() += 1;
                self.script.lock().pop_front().unwrap_or_else(|| {
                    Err(CalibrationError::LocationUnavailable(
                        "script exhausted".into(),
                    ))
                })
            })
        }
    }

    fn unavailable() -> Result<GeoFix, CalibrationError> {
        Err(CalibrationError::LocationUnavailable("timeout".into()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_best_of_window() {
        let source = Arc::new(ScriptedSource::accuracies(&[50.0, 30.0, 80.0, 10.0, 40.0]));
        let sampler = GpsSampler::new(source.clone());

        let mut seen = Vec::new();
        let best = sampler
            .stabilize(Duration::from_millis(4000), Duration::from_millis(1000), |p| {
                seen.push(p.sample.accuracy())
            })
            .await;

        assert_eq!(best.accuracy(), 10.0);
        assert_eq!(best.fix().unwrap().lat, 45.0 + 3.0 * 1e-5);
        assert_eq!(seen, vec![50.0, 30.0, 80.0, 10.0, 40.0]);
        assert_eq!(*source.calls.lock(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_read_after_window_closes() {
        let source = Arc::new(ScriptedSource::accuracies(&[50.0, 50.0, 50.0, 50.0, 5.0]));
        let sampler = GpsSampler::new(source.clone());

        let mut stamps = Vec::new();
        let best = sampler
            .stabilize(Duration::from_millis(3500), Duration::from_millis(1000), |p| {
                stamps.push(p.elapsed_ms)
            })
            .await;

        assert_eq!(stamps, vec![0, 1000, 2000, 3000]);
        assert_eq!(*source.calls.lock(), 4);
        assert_eq!(best.accuracy(), 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_tracks_best_so_far() {
        let source = Arc::new(ScriptedSource::accuracies(&[50.0, 30.0, 80.0]));
        let sampler = GpsSampler::new(source);

        let mut best_seen = Vec::new();
        sampler
            .stabilize(Duration::from_millis(2000), Duration::from_millis(1000), |p| {
                best_seen.push(p.best_accuracy)
            })
            .await;

        assert_eq!(best_seen, vec![50.0, 30.0, 30.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_window_still_takes_one_sample() {
        let source = Arc::new(ScriptedSource::accuracies(&[12.0, 3.0]));
        let sampler = GpsSampler::new(source.clone());

        let best = sampler
            .stabilize(Duration::ZERO, Duration::from_millis(1000), |_| {})
            .await;

        assert_eq!(best.accuracy(), 12.0);
        assert_eq!(*source.calls.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_abort() {
        let source = Arc::new(ScriptedSource::new(vec![
            unavailable(),
            Ok(GeoFix::new(1.0, 2.0, 25.0)),
            unavailable(),
        ]));
        let sampler = GpsSampler::new(source.clone());

        let best = sampler
            .stabilize(Duration::from_millis(2000), Duration::from_millis(1000), |_| {})
            .await;

        assert_eq!(best, Sample::Reading(GeoFix::new(1.0, 2.0, 25.0)));
        assert_eq!(*source.calls.lock(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_failures_yields_unavailable() {
        let source = Arc::new(ScriptedSource::new(vec![unavailable(), unavailable()]));
        let sampler = GpsSampler::new(source);

        let best = sampler
            .stabilize(Duration::from_millis(1000), Duration::from_millis(1000), |_| {})
            .await;

        assert!(best.is_low_confidence());
        assert!(best.into_fix_lenient().is_sentinel());
    }

    #[tokio::test(start_paused = true)]
    async fn test_real_reading_beats_failure_at_same_accuracy() {
        let source = Arc::new(ScriptedSource::new(vec![
            unavailable(),
            Ok(GeoFix::new(1.0, 2.0, 999.0)),
        ]));
        let sampler = GpsSampler::new(source);

        let best = sampler
            .stabilize(Duration::from_millis(1000), Duration::from_millis(1000), |_| {})
            .await;

        assert!(!best.is_low_confidence());
    }
}
