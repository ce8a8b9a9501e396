//! Simulated line hardware for `roller-inspect simulate`.
//!
//! Cameras behave as if hardware-triggered: each emits one frame per roller,
//! tagged with the roller id and with the id stamped into the first pixels so
//! the detector can decide deterministically which rollers carry a defect.

use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    thread,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use defect_core::{BoundingRegion, Detector, InferenceError, RawDetection};
use inspection::{ActuationCommand, LinkError, LinkStatus, PlcAck, PlcLink};
use line_ingest::{
    CameraDriver, CameraId, CaptureError, CaptureEvent, CapturedImage, FrameImage, RollerId,
    replay::SyntheticCamera,
};
use tracing::info;

pub(crate) const FRAME_WIDTH: u32 = 64;
pub(crate) const FRAME_HEIGHT: u32 = 48;
const STAMP_LEN: usize = std::mem::size_of::<u64>();

fn stamp(image: &FrameImage, roller_id: RollerId) -> Result<FrameImage, CaptureError> {
    let mut data = image.data().to_vec();
    if data.len() < STAMP_LEN {
        return Err(CaptureError::BufferSize {
            expected: STAMP_LEN,
            actual: data.len(),
        });
    }
    data[..STAMP_LEN].copy_from_slice(&roller_id.0.to_le_bytes());
    FrameImage::new(data, image.width(), image.height(), image.format())
}

fn read_stamp(image: &FrameImage) -> Option<RollerId> {
    let bytes: [u8; STAMP_LEN] = image.data().get(..STAMP_LEN)?.try_into().ok()?;
    Some(RollerId(u64::from_le_bytes(bytes)))
}

/// One frame per roller pitch, captured a quarter window after the roller
/// reaches this camera's field of view.
pub(crate) struct TriggeredCamera {
    inner: SyntheticCamera,
    phase: Duration,
    started: Option<Instant>,
    next_roller: u64,
}

impl TriggeredCamera {
    pub(crate) fn new(id: CameraId, offset_mm: f64, pitch_mm: f64, belt_mm_per_sec: f64) -> Self {
        let pitch = Duration::from_secs_f64(pitch_mm / belt_mm_per_sec);
        Self {
            inner: SyntheticCamera::new(id, FRAME_WIDTH, FRAME_HEIGHT, pitch),
            phase: Duration::from_secs_f64(offset_mm / belt_mm_per_sec) + pitch / 4,
            started: None,
            next_roller: 1,
        }
    }
}

impl CameraDriver for TriggeredCamera {
    fn camera_id(&self) -> CameraId {
        self.inner.camera_id()
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<CaptureEvent, CaptureError> {
        let started = *self.started.get_or_insert_with(Instant::now);
        let first_at = started + self.phase;
        let now = Instant::now();
        if first_at > now {
            let wait = first_at - now;
            if wait > timeout {
                thread::sleep(timeout);
                return Err(CaptureError::Timeout {
                    camera: self.camera_id(),
                    timeout,
                });
            }
            thread::sleep(wait);
        }

        match self.inner.next_frame(timeout)? {
            CaptureEvent::Frame(captured) => {
                let roller_id = RollerId(self.next_roller);
                self.next_roller += 1;
                Ok(CaptureEvent::Frame(CapturedImage {
                    image: stamp(&captured.image, roller_id)?,
                    roller_hint: Some(roller_id),
                }))
            }
            CaptureEvent::EndOfStream => Ok(CaptureEvent::EndOfStream),
        }
    }
}

/// Reports the roller locator on every view and a confident crack on every
/// `defect_every`-th roller.
pub(crate) struct SimulatedDetector {
    defect_every: u64,
    delay: Duration,
}

impl SimulatedDetector {
    pub(crate) fn new(defect_every: u64, delay: Duration) -> Self {
        Self {
            defect_every,
            delay,
        }
    }
}

impl Detector for SimulatedDetector {
    fn name(&self) -> &str {
        "simulated"
    }

    fn infer(
        &mut self,
        image: &FrameImage,
        timeout: Duration,
    ) -> Result<Vec<RawDetection>, InferenceError> {
        if self.delay > timeout {
            thread::sleep(timeout);
            return Err(InferenceError::Timeout(timeout));
        }
        thread::sleep(self.delay);

        let roller_id = read_stamp(image)
            .ok_or_else(|| InferenceError::Failed(anyhow!("frame carries no roller stamp")))?;
        let (w, h) = (image.width() as f32, image.height() as f32);
        let mut detections = vec![RawDetection::new(
            "roller",
            0.98,
            BoundingRegion::new(0.0, 0.0, w, h),
        )];
        if self.defect_every > 0 && roller_id.0 % self.defect_every == 0 {
            detections.push(RawDetection::new(
                "crack",
                0.93,
                BoundingRegion::new(w * 0.25, h * 0.25, w * 0.5, h * 0.5),
            ));
        }
        Ok(detections)
    }
}

/// PLC stand-in whose link can be taken down and brought back.
#[derive(Default)]
pub(crate) struct SimulatedPlc {
    down: AtomicBool,
    sent: AtomicU64,
}

impl SimulatedPlc {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_link(&self, up: bool) {
        let was_down = self.down.swap(!up, Ordering::SeqCst);
        if was_down == up {
            info!(up, "simulated PLC link toggled");
        }
    }

    pub(crate) fn commands_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl PlcLink for SimulatedPlc {
    fn send_actuation(
        &self,
        command: &ActuationCommand,
        _timeout: Duration,
    ) -> Result<PlcAck, LinkError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(LinkError::Unreachable("simulated outage".into()));
        }
        self.sent.fetch_add(1, Ordering::Relaxed);
        info!(
            roller = %command.roller_id,
            action = ?command.action,
            position_mm = command.fire_at_position_mm,
            "PLC command"
        );
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

/// Scheduled outage for the simulated PLC link.
pub(crate) struct OutageSchedule {
    down_at: Duration,
    up_at: Duration,
    phase: OutagePhase,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OutagePhase {
    Pending,
    Down,
    Over,
}

impl OutageSchedule {
    pub(crate) fn new(after: Duration, lasting: Duration) -> Self {
        Self {
            down_at: after,
            up_at: after + lasting,
            phase: OutagePhase::Pending,
        }
    }

    /// Advance to `elapsed` run time, toggling `plc` on phase changes.
    pub(crate) fn advance(&mut self, elapsed: Duration, plc: &SimulatedPlc) {
        if self.phase == OutagePhase::Pending && elapsed >= self.down_at {
            plc.set_link(false);
            self.phase = OutagePhase::Down;
        }
        if self.phase == OutagePhase::Down && elapsed >= self.up_at {
            plc.set_link(true);
            self.phase = OutagePhase::Over;
        }
    }
}

#[cfg(test)]
mod tests {
    use inspection::Action;
    use line_ingest::FrameFormat;

    use super::*;

    fn stamped(roller: u64) -> FrameImage {
        let blank = FrameImage::blank(FRAME_WIDTH, FRAME_HEIGHT, FrameFormat::Gray8);
        stamp(&blank, RollerId(roller)).unwrap()
    }

    #[test]
    fn every_nth_roller_carries_a_crack() {
        let mut detector = SimulatedDetector::new(3, Duration::ZERO);
        let classes = |roller| -> Vec<String> {
            SimulatedDetector::new(3, Duration::ZERO)
                .infer(&stamped(roller), Duration::from_millis(10))
                .unwrap()
                .into_iter()
                .map(|detection| detection.defect_class)
                .collect()
        };
        assert_eq!(classes(1), vec!["roller"]);
        assert_eq!(classes(3), vec!["roller", "crack"]);
        assert_eq!(classes(6), vec!["roller", "crack"]);

        let blank = FrameImage::blank(2, 2, FrameFormat::Gray8);
        assert!(detector.infer(&blank, Duration::from_millis(10)).is_err());
    }

    #[test]
    fn slow_detector_times_out() {
        let mut detector = SimulatedDetector::new(0, Duration::from_millis(30));
        assert!(matches!(
            detector.infer(&stamped(1), Duration::from_millis(5)),
            Err(InferenceError::Timeout(_))
        ));
    }

    #[test]
    fn triggered_camera_tags_consecutive_rollers() {
        let mut camera = TriggeredCamera::new(CameraId(4), 0.0, 1.0, 1_000.0);
        let timeout = Duration::from_millis(100);
        for expected in 1..=3 {
            let CaptureEvent::Frame(captured) = camera.next_frame(timeout).unwrap() else {
                panic!("expected a frame");
            };
            assert_eq!(captured.roller_hint, Some(RollerId(expected)));
            assert_eq!(read_stamp(&captured.image), Some(RollerId(expected)));
        }
    }

    #[test]
    fn outage_schedule_drops_and_restores_the_link() {
        let plc = SimulatedPlc::new();
        let mut outage = OutageSchedule::new(Duration::from_secs(1), Duration::from_secs(2));
        let command = ActuationCommand {
            roller_id: RollerId(1),
            action: Action::Reject,
            fire_at: Instant::now(),
            fire_at_position_mm: 0.0,
        };

        outage.advance(Duration::from_millis(500), &plc);
        assert_eq!(plc.read_link_status(Duration::ZERO), LinkStatus::Up);
        outage.advance(Duration::from_millis(1_500), &plc);
        assert_eq!(plc.read_link_status(Duration::ZERO), LinkStatus::Down);
        assert!(plc.send_actuation(&command, Duration::ZERO).is_err());
        outage.advance(Duration::from_millis(3_000), &plc);
        assert_eq!(plc.read_link_status(Duration::ZERO), LinkStatus::Up);
        assert!(plc.send_actuation(&command, Duration::ZERO).is_ok());
        assert_eq!(plc.commands_sent(), 1);
    }
}
