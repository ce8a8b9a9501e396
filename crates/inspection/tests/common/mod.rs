#![allow(dead_code)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use defect_core::{BoundingRegion, Detector, InferenceError, RawDetection, ThresholdProfile};
use inspection::{
    ActuationCommand, CameraConfig, DetectorFactory, EntryTrigger, InspectionConfig,
    InspectionCoordinator, InspectionStore, LineAdapters, LinkError, LinkStatus, PlcAck, PlcLink,
};
use line_ingest::{
    CameraDriver, CameraId, CaptureError, CaptureEvent, CapturedImage, FrameFormat, FrameImage,
    MotionSource, RollerId,
};

/// What a scripted view shows. Encoded into the frame pixels so the test
/// detector needs no side channel.
#[derive(Clone, Copy, Debug)]
pub enum View {
    Clean,
    Crack(f32),
    /// Clean, but the detector takes this long.
    Slow(Duration),
}

impl View {
    fn encode(self) -> FrameImage {
        let pixels = match self {
            View::Clean => vec![0, 0, 0],
            View::Crack(confidence) => vec![1, (confidence * 100.0).round() as u8, 0],
            View::Slow(delay) => vec![0, 0, (delay.as_millis() / 10).min(255) as u8],
        };
        FrameImage::new(pixels, 3, 1, FrameFormat::Gray8).unwrap()
    }
}

/// Camera fed by the test through a channel.
pub struct ScriptedCamera {
    id: CameraId,
    frames: Receiver<CapturedImage>,
}

impl CameraDriver for ScriptedCamera {
    fn camera_id(&self) -> CameraId {
        self.id
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<CaptureEvent, CaptureError> {
        match self.frames.recv_timeout(timeout) {
            Ok(image) => Ok(CaptureEvent::Frame(image)),
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::Timeout {
                camera: self.id,
                timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Ok(CaptureEvent::EndOfStream),
        }
    }
}

#[derive(Clone)]
pub struct CameraFeed {
    pub id: CameraId,
    tx: Sender<CapturedImage>,
}

impl CameraFeed {
    pub fn show(&self, roller_id: RollerId, view: View) {
        self.tx
            .send(CapturedImage {
                image: view.encode(),
                roller_hint: Some(roller_id),
            })
            .unwrap();
    }
}

pub fn scripted_camera(id: u16) -> (Box<dyn CameraDriver>, CameraFeed) {
    let (tx, rx) = unbounded();
    let id = CameraId(id);
    (Box::new(ScriptedCamera { id, frames: rx }), CameraFeed { id, tx })
}

/// Decodes the pixels written by [`View::encode`].
pub struct PixelDetector;

impl Detector for PixelDetector {
    fn name(&self) -> &str {
        "pixel"
    }

    fn infer(
        &mut self,
        image: &FrameImage,
        _timeout: Duration,
    ) -> Result<Vec<RawDetection>, InferenceError> {
        let data = image.data();
        if data[2] > 0 {
            thread::sleep(Duration::from_millis(u64::from(data[2]) * 10));
        }
        if data[0] == 1 {
            return Ok(vec![RawDetection::new(
                "crack",
                f32::from(data[1]) / 100.0,
                BoundingRegion::new(0.0, 0.0, 2.0, 1.0),
            )]);
        }
        Ok(Vec::new())
    }
}

pub fn pixel_detectors() -> DetectorFactory {
    Arc::new(|_: usize| -> Result<Box<dyn Detector>, InferenceError> {
        Ok(Box::new(PixelDetector))
    })
}

#[derive(Default)]
pub struct MockPlc {
    down: AtomicBool,
    /// Commands fail while status polls still report the link up.
    failing_sends: AtomicBool,
    commands: Mutex<Vec<ActuationCommand>>,
}

impl MockPlc {
    pub fn set_up(&self, up: bool) {
        self.down.store(!up, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, failing: bool) {
        self.failing_sends.store(failing, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<ActuationCommand> {
        self.commands.lock().unwrap().clone()
    }
}

impl PlcLink for MockPlc {
    fn send_actuation(
        &self,
        command: &ActuationCommand,
        timeout: Duration,
    ) -> Result<PlcAck, LinkError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(LinkError::Timeout(timeout));
        }
        if self.failing_sends.load(Ordering::SeqCst) {
            return Err(LinkError::Unreachable("connection reset".into()));
        }
        self.commands.lock().unwrap().push(command.clone());
        Ok(PlcAck {
            roller_id: command.roller_id,
            acknowledged_at: Instant::now(),
        })
    }

    fn read_link_status(&self, _timeout: Duration) -> LinkStatus {
        if self.down.load(Ordering::SeqCst) {
            LinkStatus::Down
        } else {
            LinkStatus::Up
        }
    }
}

/// Two cameras, sensor-triggered entries, a 1.2 s transit budget and a crack
/// threshold of 0.8.
pub fn line_config(cameras: &[u16]) -> InspectionConfig {
    let mut config = InspectionConfig::default();
    for id in cameras {
        config = config.with_camera(CameraConfig {
            capture_timeout_ms: 20,
            ..CameraConfig::new(CameraId(*id), 0.0)
        });
    }
    config.line.entry_trigger = EntryTrigger::Sensor;
    config.line.motion = MotionSource::FixedSpeed { mm_per_sec: 500.0 };
    config.line.transit_distance_mm = 600.0;
    config.decision.thresholds = ThresholdProfile::default().with_class("crack", 0.8);
    config.decision.collect_deadline_ms = 200;
    config.workers.count = 2;
    config.workers.inference_timeout_ms = 250;
    config.supervision.health_interval_ms = 10;
    config.supervision.terminal_retention_ms = 60_000;
    config
}

pub struct Line {
    pub coordinator: InspectionCoordinator,
    pub feeds: Vec<CameraFeed>,
    pub plc: Arc<MockPlc>,
}

impl Line {
    pub fn start(config: InspectionConfig, store: Box<dyn InspectionStore>) -> Self {
        let mut cameras = Vec::new();
        let mut feeds = Vec::new();
        for camera in &config.cameras {
            let (driver, feed) = scripted_camera(camera.id.0);
            cameras.push(driver);
            feeds.push(feed);
        }
        let plc = Arc::new(MockPlc::default());
        let coordinator = InspectionCoordinator::new(
            config,
            LineAdapters {
                cameras,
                detector_factory: pixel_detectors(),
                plc: plc.clone(),
                store,
            },
        )
        .unwrap();
        coordinator.start().unwrap();
        Self {
            coordinator,
            feeds,
            plc,
        }
    }

    pub fn enter(&self) -> RollerId {
        self.coordinator.trigger_roller_entry().unwrap().roller_id
    }

    pub fn show(&self, camera: usize, roller_id: RollerId, view: View) {
        self.feeds[camera].show(roller_id, view);
    }
}

pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}
