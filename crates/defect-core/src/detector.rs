//! The opaque inference capability.
//!
//! The pipeline only ever talks to a [`Detector`]; swapping models or runtimes
//! means providing another implementation. Calls go through an
//! [`InferenceSession`] so detector resources are released even when the call
//! fails.

use std::time::{Duration, Instant};

use line_ingest::FrameImage;
use thiserror::Error;

use crate::detection::RawDetection;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference did not complete within {0:?}")]
    Timeout(Duration),
    #[error("detector unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

pub trait Detector: Send {
    fn name(&self) -> &str;

    /// Claim per-call resources (device buffers, session handles).
    fn acquire(&mut self) -> Result<(), InferenceError> {
        Ok(())
    }

    /// Return whatever `acquire` claimed. Must not fail.
    fn release(&mut self) {}

    /// Run the model on one image. Implementations should give up once
    /// `timeout` has elapsed; the session also enforces it on return.
    fn infer(
        &mut self,
        image: &FrameImage,
        timeout: Duration,
    ) -> Result<Vec<RawDetection>, InferenceError>;
}

/// Scoped acquisition of a detector; `release` runs on drop.
pub struct InferenceSession<'a, D: Detector + ?Sized> {
    detector: &'a mut D,
}

impl<'a, D: Detector + ?Sized> InferenceSession<'a, D> {
    pub fn open(detector: &'a mut D) -> Result<Self, InferenceError> {
        detector.acquire()?;
        Ok(Self { detector })
    }

    /// Results that arrive after `timeout` are reported as a timeout.
    pub fn infer(
        &mut self,
        image: &FrameImage,
        timeout: Duration,
    ) -> Result<Vec<RawDetection>, InferenceError> {
        let started = Instant::now();
        let detections = self.detector.infer(image, timeout)?;
        if started.elapsed() > timeout {
            return Err(InferenceError::Timeout(timeout));
        }
        Ok(detections)
    }
}

impl<D: Detector + ?Sized> Drop for InferenceSession<'_, D> {
    fn drop(&mut self) {
        self.detector.release();
    }
}

/// Run one inference inside its own session.
pub fn run_inference<D: Detector + ?Sized>(
    detector: &mut D,
    image: &FrameImage,
    timeout: Duration,
) -> Result<Vec<RawDetection>, InferenceError> {
    let mut session = InferenceSession::open(detector)?;
    session.infer(image, timeout)
}

#[cfg(test)]
mod tests {
    use std::thread;

    use line_ingest::FrameFormat;

    use super::*;
    use crate::detection::BoundingRegion;

    #[derive(Default)]
    struct ScriptedDetector {
        acquired: usize,
        released: usize,
        delay: Duration,
        fail: bool,
    }

    impl Detector for ScriptedDetector {
        fn name(&self) -> &str {
            "scripted"
        }

        fn acquire(&mut self) -> Result<(), InferenceError> {
            self.acquired += 1;
            Ok(())
        }

        fn release(&mut self) {
            self.released += 1;
        }

        fn infer(
            &mut self,
            _image: &FrameImage,
            _timeout: Duration,
        ) -> Result<Vec<RawDetection>, InferenceError> {
            thread::sleep(self.delay);
            if self.fail {
                return Err(InferenceError::Failed(anyhow::anyhow!("cuda oom")));
            }
            Ok(vec![RawDetection::new(
                "crack",
                0.9,
                BoundingRegion::new(0.0, 0.0, 2.0, 2.0),
            )])
        }
    }

    fn image() -> FrameImage {
        FrameImage::blank(2, 2, FrameFormat::Gray8)
    }

    #[test]
    fn session_releases_after_success_and_failure() {
        let mut detector = ScriptedDetector::default();
        let found = run_inference(&mut detector, &image(), Duration::from_secs(1)).unwrap();
        assert_eq!(found.len(), 1);

        detector.fail = true;
        let err = run_inference(&mut detector, &image(), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, InferenceError::Failed(_)));

        assert_eq!(detector.acquired, 2);
        assert_eq!(detector.released, 2);
    }

    #[test]
    fn late_results_count_as_timeouts() {
        let mut detector = ScriptedDetector {
            delay: Duration::from_millis(30),
            ..Default::default()
        };
        let err = run_inference(&mut detector, &image(), Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, InferenceError::Timeout(_)));
        assert_eq!(detector.released, 1);
    }
}
