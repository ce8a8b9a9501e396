//! Inference worker threads.
//!
//! Each worker builds its own detector through the shared factory, reports
//! the result on the init channel, and then drains the dispatch queue until
//! it is closed. Every frame yields exactly one [`ViewReport`]: detections
//! above the model floor, or a failure marker when inference times out or
//! errors.

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::Sender;
use defect_core::{Detection, Detector, InferenceError, ThresholdProfile, run_inference};
use line_ingest::Frame;
use tracing::{debug, warn};

use crate::pipeline::{
    archive::{ArchiveHandle, ArchivedView},
    data::{AggregatorInput, ViewFailure, ViewReport},
    dispatch::{DispatchQueue, Popped},
    stats::InspectionStats,
    telemetry,
    watchdog::PipelineHealth,
};

/// How long an idle worker waits on the queue before beating again.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Builds one detector per worker, given the worker index.
pub type DetectorFactory =
    Arc<dyn Fn(usize) -> Result<Box<dyn Detector>, InferenceError> + Send + Sync>;

pub(crate) struct WorkerContext {
    pub(crate) queue: Arc<DispatchQueue>,
    pub(crate) reports: Sender<AggregatorInput>,
    pub(crate) thresholds: Arc<ThresholdProfile>,
    pub(crate) inference_timeout: Duration,
    pub(crate) health: Arc<PipelineHealth>,
    pub(crate) stats: Arc<InspectionStats>,
    pub(crate) archive: Option<ArchiveHandle>,
}

pub(crate) fn spawn_inference_worker(
    worker_index: usize,
    factory: DetectorFactory,
    ctx: WorkerContext,
    init_tx: Sender<Result<String, String>>,
) -> std::io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread(format!("inference-{worker_index}"), move || {
        let mut detector = match factory(worker_index) {
            Ok(detector) => {
                let message = format!("worker #{worker_index}: detector {} ready", detector.name());
                if init_tx.send(Ok(message)).is_err() {
                    return;
                }
                detector
            }
            Err(err) => {
                let _ = init_tx.send(Err(format!(
                    "worker #{worker_index}: failed to initialise detector: {err}"
                )));
                return;
            }
        };
        drop(init_tx);

        let _alive = ctx.health.worker_started();
        loop {
            ctx.health.beat_inference();
            match ctx.queue.pop(IDLE_POLL) {
                Popped::Frame(frame) => {
                    let Some(report) = infer_frame(detector.as_mut(), frame, &ctx) else {
                        continue;
                    };
                    if ctx.reports.send(AggregatorInput::Report(report)).is_err() {
                        debug!("aggregator gone; inference worker #{worker_index} stopping");
                        break;
                    }
                }
                Popped::TimedOut => continue,
                Popped::Closed => break,
            }
        }
        debug!("inference worker #{worker_index} exiting");
    })
}

fn infer_frame(detector: &mut dyn Detector, frame: Frame, ctx: &WorkerContext) -> Option<ViewReport> {
    let Some(roller_id) = frame.roller_id() else {
        warn!(camera = %frame.camera_id(), "unassigned frame reached inference");
        return None;
    };
    let camera_id = frame.camera_id();
    let span = tracing::info_span!("inference", roller = %roller_id, camera = %camera_id);
    let _guard = span.enter();

    metrics::histogram!("inspection_queue_wait_seconds")
        .record(frame.captured_at().elapsed().as_secs_f64());
    let started = Instant::now();
    let result = run_inference(detector, frame.image(), ctx.inference_timeout);
    metrics::histogram!("inspection_inference_seconds").record(started.elapsed().as_secs_f64());

    let report = match result {
        Ok(raw) => {
            let detections = raw
                .into_iter()
                .filter(|detection| ctx.thresholds.passes_model_floor(detection))
                .map(|detection| detection.observed_by(camera_id))
                .collect::<Vec<_>>();
            debug!(detections = detections.len(), "view inferred");
            if let Some(archive) = &ctx.archive {
                let view: Vec<&Detection> = detections.iter().collect();
                let defect_classes = ctx.thresholds.view_defects(&view);
                if archive.wants(!defect_classes.is_empty()) {
                    archive.submit(ArchivedView {
                        roller_id,
                        camera_id,
                        image: frame.image().clone(),
                        detections: detections.clone(),
                        defect_classes,
                    });
                }
            }
            ViewReport::detections(roller_id, camera_id, frame.captured_at(), detections)
        }
        Err(err) => {
            let failure = match err {
                InferenceError::Timeout(_) => ViewFailure::InferenceTimeout,
                InferenceError::Unavailable(_) | InferenceError::Failed(_) => {
                    ViewFailure::InferenceFailed
                }
            };
            warn!("inference failed: {err}");
            ctx.stats.inference_failed(failure);
            ViewReport::failed(roller_id, camera_id, frame.captured_at(), failure)
        }
    };
    Some(report)
}
