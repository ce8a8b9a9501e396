//! Frame sources and line motion tracking for roller inspection.
//!
//! Cameras are wrapped behind [`CameraDriver`] so the pipeline never branches
//! on vendor specifics. [`spawn_camera_reader`] drives a camera from its own
//! thread and tags every capture with the conveyor position reported by a
//! shared [`LinePositionTracker`].

mod camera;
mod position;
pub mod replay;
mod types;

pub use camera::{CameraDriver, CameraStream, ReaderOptions, spawn_camera_reader};
pub use position::{LinePositionTracker, MIN_VELOCITY_MM_PER_SEC, MotionSource, RollerEntry};
pub use types::{
    CameraId, CaptureError, CaptureEvent, CapturedImage, Frame, FrameFormat, FrameImage,
    RollerId,
};
