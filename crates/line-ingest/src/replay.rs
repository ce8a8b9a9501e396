//! Hardware-free camera drivers for bench runs and simulation.

use std::{
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;

use crate::{
    camera::CameraDriver,
    types::{CameraId, CaptureError, CaptureEvent, CapturedImage, FrameFormat, FrameImage},
};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Sleep until the next frame slot, or report a timeout if the slot is
/// further away than the caller is willing to wait.
fn pace(
    camera: CameraId,
    last: &mut Option<Instant>,
    interval: Duration,
    timeout: Duration,
) -> Result<(), CaptureError> {
    let now = Instant::now();
    let slot = match *last {
        Some(previous) if previous + interval > now => {
            let due = previous + interval;
            let wait = due - now;
            if wait > timeout {
                thread::sleep(timeout);
                return Err(CaptureError::Timeout { camera, timeout });
            }
            thread::sleep(wait);
            due
        }
        _ => now,
    };
    // Slots advance on schedule so oversleeping never accumulates.
    *last = Some(slot);
    Ok(())
}

/// Replays still images from a directory in file-name order.
pub struct ReplayCamera {
    id: CameraId,
    paths: Vec<PathBuf>,
    cursor: usize,
    interval: Duration,
    looped: bool,
    last: Option<Instant>,
}

impl ReplayCamera {
    pub fn open(
        id: CameraId,
        dir: &Path,
        interval: Duration,
        looped: bool,
    ) -> Result<Self, CaptureError> {
        let entries = std::fs::read_dir(dir).map_err(|err| CaptureError::Open {
            camera: id,
            reason: format!("{}: {err}", dir.display()),
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();
        if paths.is_empty() {
            return Err(CaptureError::Open {
                camera: id,
                reason: format!("no images found in {}", dir.display()),
            });
        }
        Ok(Self {
            id,
            paths,
            cursor: 0,
            interval,
            looped,
            last: None,
        })
    }

    fn load(&self, path: &Path) -> Result<FrameImage, CaptureError> {
        let decoded = image::open(path)
            .with_context(|| format!("failed to decode {}", path.display()))?
            .to_rgb8();
        let (width, height) = decoded.dimensions();
        FrameImage::new(decoded.into_raw(), width, height, FrameFormat::Rgb8)
    }
}

impl CameraDriver for ReplayCamera {
    fn camera_id(&self) -> CameraId {
        self.id
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<CaptureEvent, CaptureError> {
        if self.cursor >= self.paths.len() {
            if !self.looped {
                return Ok(CaptureEvent::EndOfStream);
            }
            self.cursor = 0;
        }
        pace(self.id, &mut self.last, self.interval, timeout)?;
        let path = self.paths[self.cursor].clone();
        self.cursor += 1;
        let image = self.load(&path)?;
        Ok(CaptureEvent::Frame(CapturedImage {
            image,
            roller_hint: None,
        }))
    }
}

/// Emits blank frames at a fixed rate.
pub struct SyntheticCamera {
    id: CameraId,
    width: u32,
    height: u32,
    interval: Duration,
    remaining: Option<u64>,
    last: Option<Instant>,
}

impl SyntheticCamera {
    pub fn new(id: CameraId, width: u32, height: u32, interval: Duration) -> Self {
        Self {
            id,
            width,
            height,
            interval,
            remaining: None,
            last: None,
        }
    }

    /// Stop after `frames` captures.
    pub fn limited(mut self, frames: u64) -> Self {
        self.remaining = Some(frames);
        self
    }
}

impl CameraDriver for SyntheticCamera {
    fn camera_id(&self) -> CameraId {
        self.id
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<CaptureEvent, CaptureError> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return Ok(CaptureEvent::EndOfStream);
            }
            *remaining -= 1;
        }
        pace(self.id, &mut self.last, self.interval, timeout)?;
        Ok(CaptureEvent::Frame(CapturedImage {
            image: FrameImage::blank(self.width, self.height, FrameFormat::Gray8),
            roller_hint: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_reads_images_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        for (name, shade) in [("b.png", 200u8), ("a.png", 10u8)] {
            let img = image::RgbImage::from_pixel(3, 2, image::Rgb([shade, shade, shade]));
            img.save(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut camera =
            ReplayCamera::open(CameraId(1), dir.path(), Duration::ZERO, false).unwrap();
        let mut shades = Vec::new();
        while let CaptureEvent::Frame(captured) =
            camera.next_frame(Duration::from_millis(50)).unwrap()
        {
            assert_eq!(captured.image.width(), 3);
            assert_eq!(captured.image.format(), FrameFormat::Rgb8);
            shades.push(captured.image.data()[0]);
        }
        assert_eq!(shades, vec![10, 200]);
    }

    #[test]
    fn replay_rejects_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = ReplayCamera::open(CameraId(1), dir.path(), Duration::ZERO, true)
            .err()
            .unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn synthetic_camera_honours_frame_limit() {
        let mut camera =
            SyntheticCamera::new(CameraId(2), 8, 8, Duration::ZERO).limited(2);
        let timeout = Duration::from_millis(10);
        assert!(matches!(camera.next_frame(timeout), Ok(CaptureEvent::Frame(_))));
        assert!(matches!(camera.next_frame(timeout), Ok(CaptureEvent::Frame(_))));
        assert!(matches!(camera.next_frame(timeout), Ok(CaptureEvent::EndOfStream)));
    }
}
