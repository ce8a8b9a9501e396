//! Run modes: wire adapters, start the line, wait, shut down in order.

use std::{
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use defect_core::{Detector, InferenceError};
use inspection::{
    DetectorFactory, InspectionConfig, InspectionCoordinator, InspectionStore, JsonLinesStore,
    LineAdapters, MemoryStore, telemetry,
};
use line_ingest::{CameraDriver, replay::ReplayCamera};
use tracing::{info, warn};

use crate::{
    cli::{Command, ReplayPlan, RunSettings, SimulationPlan},
    server,
    sim::{OutageSchedule, SimulatedDetector, SimulatedPlc, TriggeredCamera},
};

const WAIT_TICK: Duration = Duration::from_millis(100);

pub(crate) fn execute(command: Command) -> Result<()> {
    match command {
        Command::Simulate(args) => simulate(SimulationPlan::try_from(args)?),
        Command::Replay(args) => replay(ReplayPlan::try_from(args)?),
    }
}

fn simulate(plan: SimulationPlan) -> Result<()> {
    let config = &plan.settings.config;
    let cameras: Vec<Box<dyn CameraDriver>> = config
        .cameras
        .iter()
        .map(|camera| {
            Box::new(TriggeredCamera::new(
                camera.id,
                camera.offset_mm,
                config.line.roller_pitch_mm,
                plan.belt_mm_per_sec,
            )) as Box<dyn CameraDriver>
        })
        .collect();

    let (defect_every, delay) = (plan.defect_every, plan.inference_delay);
    let detector_factory: DetectorFactory = Arc::new(
        move |_: usize| -> Result<Box<dyn Detector>, InferenceError> {
            Ok(Box::new(SimulatedDetector::new(defect_every, delay)))
        },
    );
    let plc = Arc::new(SimulatedPlc::new());
    let mut outage = plan
        .plc_outage
        .map(|(after, lasting)| OutageSchedule::new(after, lasting));

    let adapters = LineAdapters {
        cameras,
        detector_factory,
        plc: plc.clone(),
        store: open_store(config)?,
    };
    run_line(plan.settings, adapters, |elapsed| {
        if let Some(outage) = outage.as_mut() {
            outage.advance(elapsed, &plc);
        }
    })?;
    info!(commands = plc.commands_sent(), "simulated PLC totals");
    Ok(())
}

fn replay(plan: ReplayPlan) -> Result<()> {
    let mut cameras: Vec<Box<dyn CameraDriver>> = Vec::with_capacity(plan.sources.len());
    for (id, dir) in &plan.sources {
        let camera = ReplayCamera::open(*id, dir, plan.frame_interval, plan.looped)
            .with_context(|| format!("failed to open replay camera {id}"))?;
        cameras.push(Box::new(camera));
    }

    let adapters = LineAdapters {
        cameras,
        detector_factory: replay_detector(&plan),
        plc: Arc::new(SimulatedPlc::new()),
        store: open_store(&plan.settings.config)?,
    };
    run_line(plan.settings, adapters, |_| {})
}

#[cfg(feature = "with-tch")]
fn replay_detector(plan: &ReplayPlan) -> DetectorFactory {
    use defect_core::{tch::Device, torch::TorchDetector};

    let model = &plan.model;
    let (path, classes, input_size) = (model.path.clone(), model.classes.clone(), model.input_size);
    let device = if model.use_cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available()
    };
    Arc::new(move |worker: usize| -> Result<Box<dyn Detector>, InferenceError> {
        let detector = TorchDetector::load(&path, device, input_size, classes.clone())
            .map_err(|err| {
                InferenceError::Unavailable(format!("worker #{worker}: {err:#}"))
            })?;
        Ok(Box::new(detector))
    })
}

#[cfg(not(feature = "with-tch"))]
fn replay_detector(_plan: &ReplayPlan) -> DetectorFactory {
    warn!("built without the with-tch feature; replayed views are checked by a detector that reports nothing");
    Arc::new(|_: usize| -> Result<Box<dyn Detector>, InferenceError> {
        Ok(Box::new(NullDetector))
    })
}

/// Detector that never sees a defect, for timing runs without a model.
#[cfg(not(feature = "with-tch"))]
struct NullDetector;

#[cfg(not(feature = "with-tch"))]
impl Detector for NullDetector {
    fn name(&self) -> &str {
        "null"
    }

    fn infer(
        &mut self,
        _image: &line_ingest::FrameImage,
        _timeout: Duration,
    ) -> Result<Vec<defect_core::RawDetection>, InferenceError> {
        Ok(Vec::new())
    }
}

fn open_store(config: &InspectionConfig) -> Result<Box<dyn InspectionStore>> {
    Ok(match &config.persistence.path {
        Some(path) => Box::new(
            JsonLinesStore::open(path)
                .with_context(|| format!("failed to open record file {}", path.display()))?,
        ),
        None => Box::new(MemoryStore::new()),
    })
}

/// Install the process-wide Ctrl+C handler once and return its flag.
fn shutdown_flag() -> Arc<AtomicBool> {
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });
    shutdown
}

/// Start the line and block until Ctrl+C or the configured duration. `tick`
/// runs every wait cycle with the elapsed run time.
fn run_line(
    settings: RunSettings,
    adapters: LineAdapters,
    mut tick: impl FnMut(Duration),
) -> Result<()> {
    let RunSettings {
        config,
        http,
        duration,
    } = settings;
    let _telemetry = telemetry::enter_runtime(&config.telemetry);
    telemetry::init_metrics_recorder()?;

    let coordinator = Arc::new(InspectionCoordinator::new(config, adapters)?);
    coordinator.start()?;
    let control = match http {
        Some(addr) => match server::spawn_control_server(addr, coordinator.clone()) {
            Ok(control) => Some(control),
            Err(err) => {
                coordinator.shutdown()?;
                return Err(err);
            }
        },
        None => None,
    };

    let shutdown = shutdown_flag();
    let started = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        let elapsed = started.elapsed();
        if duration.is_some_and(|limit| elapsed >= limit) {
            info!("run duration reached");
            break;
        }
        tick(elapsed);
        thread::sleep(WAIT_TICK);
    }

    info!("shutting down");
    if let Some(control) = control {
        control.stop();
    }
    coordinator.shutdown()?;

    let stats = coordinator.stats();
    info!(
        entered = stats.rollers_entered,
        accepted = stats.accepted,
        rejected = stats.rejected,
        inconclusive = stats.inconclusive,
        dropped = stats.dropped,
        "line stopped"
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
