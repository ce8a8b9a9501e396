//! Optional on-disk archive of annotated camera views.
//!
//! Inference workers hand views to an [`ArchiveHandle`] and move on; a writer
//! thread draws the detection boxes and saves one PNG per view. Views that
//! carry a defect land under `defects/`. With `all_views` set every view is
//! also kept under `views/`.

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use defect_core::Detection;
use image::{ImageBuffer, Rgb, RgbImage};
use line_ingest::{CameraId, FrameFormat, FrameImage, RollerId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::pipeline::{stats::InspectionStats, telemetry};

const DEFECT_DIR: &str = "defects";
const VIEW_DIR: &str = "views";
const DEFECT_COLOUR: Rgb<u8> = Rgb([255, 0, 0]);
const OTHER_COLOUR: Rgb<u8> = Rgb([0, 255, 0]);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub dir: PathBuf,
    #[serde(default)]
    pub all_views: bool,
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode view: {0}")]
    Encode(#[from] image::ImageError),
    #[error("{width}x{height} frame does not match its pixel buffer")]
    Buffer { width: u32, height: u32 },
}

/// One inferred view queued for the archive.
#[derive(Clone, Debug)]
pub struct ArchivedView {
    pub roller_id: RollerId,
    pub camera_id: CameraId,
    pub image: FrameImage,
    pub detections: Vec<Detection>,
    pub defect_classes: BTreeSet<String>,
}

impl ArchivedView {
    fn file_name(&self) -> String {
        format!("{}_{}.png", self.roller_id, self.camera_id)
    }
}

#[derive(Clone)]
pub struct ArchiveHandle {
    tx: Sender<ArchivedView>,
    all_views: bool,
}

impl ArchiveHandle {
    /// Whether a view with or without a defect should be archived.
    pub fn wants(&self, has_defect: bool) -> bool {
        has_defect || self.all_views
    }

    pub fn submit(&self, view: ArchivedView) {
        if self.tx.send(view).is_err() {
            debug!("archive writer gone; view not archived");
        }
    }
}

/// Create the archive directories and start the writer thread. The thread
/// exits once every handle is dropped and the queue is drained.
pub fn spawn_frame_archive(
    config: &ArchiveConfig,
    stats: Arc<InspectionStats>,
) -> Result<(ArchiveHandle, thread::JoinHandle<()>), ArchiveError> {
    fs::create_dir_all(config.dir.join(DEFECT_DIR))?;
    if config.all_views {
        fs::create_dir_all(config.dir.join(VIEW_DIR))?;
    }
    let (tx, rx) = unbounded();
    let root = config.dir.clone();
    let all_views = config.all_views;
    let handle = telemetry::spawn_thread("frame-archive", move || {
        run_writer(&root, all_views, rx, &stats);
    })?;
    Ok((ArchiveHandle { tx, all_views }, handle))
}

fn run_writer(root: &Path, all_views: bool, rx: Receiver<ArchivedView>, stats: &InspectionStats) {
    for view in rx.iter() {
        match write_view(root, all_views, &view) {
            Ok(()) => stats.view_archived(),
            Err(err) => {
                warn!(roller = %view.roller_id, camera = %view.camera_id, "failed to archive view: {err}");
                stats.archive_failed();
            }
        }
    }
    debug!("frame archive drained");
}

fn write_view(root: &Path, all_views: bool, view: &ArchivedView) -> Result<(), ArchiveError> {
    let annotated = annotate(view)?;
    let name = view.file_name();
    if !view.defect_classes.is_empty() {
        annotated.save(root.join(DEFECT_DIR).join(&name))?;
    }
    if all_views {
        annotated.save(root.join(VIEW_DIR).join(&name))?;
    }
    Ok(())
}

/// RGB copy of the view with every detection outlined. Boxes of classes that
/// counted as defects are red, the rest green.
pub fn annotate(view: &ArchivedView) -> Result<RgbImage, ArchiveError> {
    let mut image = to_rgb(&view.image)?;
    for detection in &view.detections {
        let colour = if view.defect_classes.contains(&detection.defect_class) {
            DEFECT_COLOUR
        } else {
            OTHER_COLOUR
        };
        let region = &detection.region;
        draw_rectangle(&mut image, region.x1, region.y1, region.x2, region.y2, colour);
    }
    Ok(image)
}

fn to_rgb(frame: &FrameImage) -> Result<RgbImage, ArchiveError> {
    let data = frame.data();
    let pixels = match frame.format() {
        FrameFormat::Rgb8 => data.to_vec(),
        FrameFormat::Bgr8 => data
            .chunks_exact(3)
            .flat_map(|bgr| [bgr[2], bgr[1], bgr[0]])
            .collect(),
        FrameFormat::Gray8 => data.iter().flat_map(|&luma| [luma; 3]).collect(),
    };
    ImageBuffer::from_raw(frame.width(), frame.height(), pixels).ok_or(ArchiveError::Buffer {
        width: frame.width(),
        height: frame.height(),
    })
}

fn draw_rectangle(image: &mut RgbImage, x1: f32, y1: f32, x2: f32, y2: f32, colour: Rgb<u8>) {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    let clamp_x = |x: f32| x.round().clamp(0.0, (width - 1) as f32) as u32;
    let clamp_y = |y: f32| y.round().clamp(0.0, (height - 1) as f32) as u32;
    let (left, right) = (clamp_x(x1.min(x2)), clamp_x(x1.max(x2)));
    let (top, bottom) = (clamp_y(y1.min(y2)), clamp_y(y1.max(y2)));
    for x in left..=right {
        image.put_pixel(x, top, colour);
        image.put_pixel(x, bottom, colour);
    }
    for y in top..=bottom {
        image.put_pixel(left, y, colour);
        image.put_pixel(right, y, colour);
    }
}

#[cfg(test)]
mod tests {
    use defect_core::BoundingRegion;

    use super::*;

    fn detection(class: &str, region: BoundingRegion) -> Detection {
        Detection {
            camera_id: CameraId(2),
            defect_class: class.into(),
            confidence: 0.9,
            region,
        }
    }

    fn view(roller: u64, defects: &[&str]) -> ArchivedView {
        ArchivedView {
            roller_id: RollerId(roller),
            camera_id: CameraId(2),
            image: FrameImage::blank(16, 12, FrameFormat::Gray8),
            detections: vec![
                detection("roller", BoundingRegion::new(0.0, 0.0, 15.0, 11.0)),
                detection("rust", BoundingRegion::new(4.0, 3.0, 8.0, 6.0)),
            ],
            defect_classes: defects.iter().map(|class| class.to_string()).collect(),
        }
    }

    #[test]
    fn annotation_outlines_defects_in_red() {
        let image = annotate(&view(1, &["rust"])).unwrap();
        assert_eq!(image.dimensions(), (16, 12));
        assert_eq!(*image.get_pixel(0, 0), OTHER_COLOUR);
        assert_eq!(*image.get_pixel(4, 3), DEFECT_COLOUR);
        assert_eq!(*image.get_pixel(8, 6), DEFECT_COLOUR);
        assert_eq!(*image.get_pixel(6, 5), Rgb([0, 0, 0]));
    }

    #[test]
    fn bgr_frames_are_converted_to_rgb() {
        let frame = FrameImage::new(vec![10, 20, 30, 40, 50, 60], 2, 1, FrameFormat::Bgr8).unwrap();
        let image = to_rgb(&frame).unwrap();
        assert_eq!(*image.get_pixel(0, 0), Rgb([30, 20, 10]));
        assert_eq!(*image.get_pixel(1, 0), Rgb([60, 50, 40]));
    }

    #[test]
    fn writer_keeps_defect_views_apart_from_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let stats = Arc::new(InspectionStats::new());
        let config = ArchiveConfig {
            dir: dir.path().to_path_buf(),
            all_views: true,
        };
        let (archive, writer) = spawn_frame_archive(&config, stats.clone()).unwrap();
        assert!(archive.wants(false));
        archive.submit(view(1, &[]));
        archive.submit(view(2, &["rust"]));
        drop(archive);
        writer.join().unwrap();

        assert!(!dir.path().join(DEFECT_DIR).join("R1_cam2.png").exists());
        assert!(dir.path().join(DEFECT_DIR).join("R2_cam2.png").exists());
        assert!(dir.path().join(VIEW_DIR).join("R1_cam2.png").exists());
        assert!(dir.path().join(VIEW_DIR).join("R2_cam2.png").exists());
        let saved = image::open(dir.path().join(DEFECT_DIR).join("R2_cam2.png")).unwrap();
        assert_eq!(saved.to_rgb8().get_pixel(4, 3), &DEFECT_COLOUR);
        assert_eq!(stats.snapshot().views_archived, 2);
    }

    #[test]
    fn defect_only_archive_skips_clean_views() {
        let dir = tempfile::tempdir().unwrap();
        let config = ArchiveConfig {
            dir: dir.path().to_path_buf(),
            all_views: false,
        };
        let (archive, writer) =
            spawn_frame_archive(&config, Arc::new(InspectionStats::new())).unwrap();
        assert!(!archive.wants(false));
        assert!(archive.wants(true));
        drop(archive);
        writer.join().unwrap();
        assert!(!dir.path().join(VIEW_DIR).exists());
    }
}
