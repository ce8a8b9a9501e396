use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a physical camera on the line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(pub u16);

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cam{}", self.0)
    }
}

/// Identifier of a roller for one pass through the inspection zone.
///
/// Ids increase monotonically in the order rollers enter the zone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RollerId(pub u64);

impl fmt::Display for RollerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
    Rgb8,
    Gray8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Bgr8 | FrameFormat::Rgb8 => 3,
            FrameFormat::Gray8 => 1,
        }
    }
}

/// Shared, read-only pixel buffer.
#[derive(Clone)]
pub struct FrameImage {
    data: Arc<[u8]>,
    width: u32,
    height: u32,
    format: FrameFormat,
}

impl FrameImage {
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: FrameFormat,
    ) -> Result<Self, CaptureError> {
        let expected = (width as usize) * (height as usize) * format.bytes_per_pixel();
        if data.len() != expected {
            return Err(CaptureError::BufferSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data: data.into(),
            width,
            height,
            format,
        })
    }

    pub fn blank(width: u32, height: u32, format: FrameFormat) -> Self {
        let len = (width as usize) * (height as usize) * format.bytes_per_pixel();
        Self {
            data: vec![0u8; len].into(),
            width,
            height,
            format,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }
}

impl fmt::Debug for FrameImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .finish()
    }
}

/// A position-tagged capture from one camera. Immutable once built.
#[derive(Clone, Debug)]
pub struct Frame {
    camera_id: CameraId,
    roller_id: Option<RollerId>,
    sequence: u64,
    captured_at: Instant,
    captured_wall: DateTime<Utc>,
    position_mm: f64,
    image: FrameImage,
}

impl Frame {
    pub fn new(
        camera_id: CameraId,
        sequence: u64,
        captured_at: Instant,
        position_mm: f64,
        image: FrameImage,
    ) -> Self {
        Self {
            camera_id,
            roller_id: None,
            sequence,
            captured_at,
            captured_wall: Utc::now(),
            position_mm,
            image,
        }
    }

    /// Returns a copy of the frame bound to `roller_id`.
    pub fn assigned_to(self, roller_id: RollerId) -> Self {
        Self {
            roller_id: Some(roller_id),
            ..self
        }
    }

    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    pub fn roller_id(&self) -> Option<RollerId> {
        self.roller_id
    }

    /// Per-camera capture counter.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn captured_wall(&self) -> DateTime<Utc> {
        self.captured_wall
    }

    pub fn position_mm(&self) -> f64 {
        self.position_mm
    }

    pub fn image(&self) -> &FrameImage {
        &self.image
    }
}

/// Raw capture handed back by a [`crate::CameraDriver`].
pub struct CapturedImage {
    pub image: FrameImage,
    /// Roller tag supplied by hardware triggering, when the camera has one.
    pub roller_hint: Option<RollerId>,
}

pub enum CaptureEvent {
    Frame(CapturedImage),
    EndOfStream,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open camera {camera}: {reason}")]
    Open { camera: CameraId, reason: String },
    #[error("camera {camera} produced no frame within {timeout:?}")]
    Timeout { camera: CameraId, timeout: Duration },
    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },
    #[error(transparent)]
    Other(#[from] Error),
}

impl CaptureError {
    /// Whether the reader should give up on the camera after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CaptureError::Open { .. })
    }
}
