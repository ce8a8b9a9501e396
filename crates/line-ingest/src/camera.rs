//! Camera reader threads.
//!
//! Each physical camera is wrapped by a [`CameraDriver`] implementation and
//! driven from its own thread. The reader stamps every capture with the time
//! and the conveyor position reported by the [`LinePositionTracker`] before
//! forwarding it over a small bounded channel, so a slow consumer backpressures
//! the capture loop instead of piling frames up in memory.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, warn};

use crate::{
    position::LinePositionTracker,
    types::{CameraId, CaptureError, CaptureEvent, Frame},
};

/// Vendor adapter for one camera.
///
/// Implementations must honour `timeout`: return [`CaptureError::Timeout`]
/// instead of blocking indefinitely on the hardware.
pub trait CameraDriver: Send {
    fn camera_id(&self) -> CameraId;

    fn next_frame(&mut self, timeout: Duration) -> Result<CaptureEvent, CaptureError>;
}

#[derive(Clone, Copy, Debug)]
pub struct ReaderOptions {
    pub capture_timeout: Duration,
    pub channel_capacity: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            capture_timeout: Duration::from_millis(500),
            channel_capacity: 2,
        }
    }
}

/// Handle to a running camera reader.
pub struct CameraStream {
    pub camera_id: CameraId,
    pub frames: Receiver<Result<Frame, CaptureError>>,
    handle: thread::JoinHandle<()>,
}

impl CameraStream {
    /// Wait for the reader thread to exit. The caller must have cleared the
    /// `running` flag or dropped `frames` first.
    pub fn join(self) {
        let camera_id = self.camera_id;
        drop(self.frames);
        if self.handle.join().is_err() {
            warn!(camera = %camera_id, "camera reader thread panicked");
        }
    }
}

/// Spawns a background thread that continually captures frames from `driver`.
///
/// Frames are tagged with the tracker position at capture time. A fatal
/// [`CaptureError`] is forwarded and ends the stream; other errors are forwarded
/// and capture continues. End of stream disconnects the channel.
pub fn spawn_camera_reader(
    driver: Box<dyn CameraDriver>,
    tracker: LinePositionTracker,
    options: ReaderOptions,
    running: Arc<AtomicBool>,
) -> Result<CameraStream> {
    let camera_id = driver.camera_id();
    let (tx, rx) = bounded(options.channel_capacity.max(1));
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());

    let handle = thread::Builder::new()
        .name(format!("camera-{}", camera_id.0))
        .spawn(move || {
            tracing::dispatcher::with_default(&dispatch, || {
                capture_loop(driver, &tracker, options, &running, tx)
            })
        })
        .with_context(|| format!("failed to spawn reader thread for {camera_id}"))?;

    Ok(CameraStream {
        camera_id,
        frames: rx,
        handle,
    })
}

fn capture_loop(
    mut driver: Box<dyn CameraDriver>,
    tracker: &LinePositionTracker,
    options: ReaderOptions,
    running: &AtomicBool,
    tx: Sender<Result<Frame, CaptureError>>,
) {
    let camera_id = driver.camera_id();
    let mut sequence: u64 = 0;

    while running.load(Ordering::Relaxed) {
        match driver.next_frame(options.capture_timeout) {
            Ok(CaptureEvent::Frame(captured)) => {
                let captured_at = Instant::now();
                let position_mm = tracker.position_at(captured_at);
                let mut frame =
                    Frame::new(camera_id, sequence, captured_at, position_mm, captured.image);
                if let Some(roller_id) = captured.roller_hint {
                    frame = frame.assigned_to(roller_id);
                }
                sequence = sequence.wrapping_add(1);
                if tx.send(Ok(frame)).is_err() {
                    break;
                }
            }
            Ok(CaptureEvent::EndOfStream) => {
                debug!(camera = %camera_id, frames = sequence, "camera reached end of stream");
                break;
            }
            Err(err) => {
                let fatal = err.is_fatal();
                if tx.send(Err(err)).is_err() || fatal {
                    break;
                }
            }
        }
    }
}
