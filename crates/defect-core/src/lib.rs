//! Defect detection contract shared by the inspection pipeline.
//!
//! The model itself stays opaque behind [`Detector`]. Enable the `with-tch`
//! feature to pull in a TorchScript implementation.

pub mod detection;
pub mod detector;
pub mod thresholds;
#[cfg(feature = "with-tch")]
pub mod torch;

pub use detection::{BoundingRegion, Detection, RawDetection};
pub use detector::{Detector, InferenceError, InferenceSession, run_inference};
pub use thresholds::{
    DOWN_HEAD_CLASS, HIGH_HEAD_CLASS, HeadLimits, HeadRule, HeadType, LocatorGate, ThresholdError,
    ThresholdProfile,
};

#[cfg(feature = "with-tch")]
pub use tch;
