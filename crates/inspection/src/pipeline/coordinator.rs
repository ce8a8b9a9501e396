//! Owns every pipeline thread and the operator controls.
//!
//! [`InspectionCoordinator::start`] brings the stages up from the back of the
//! line to the front: persistence, the frame archive, inference workers,
//! aggregator, actuation, supervisor, and finally the camera readers. Shutdown runs the other way so
//! that every roller already seen by a camera still gets a verdict and an
//! outcome before the process exits.

use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow, bail};
use crossbeam_channel::{Sender, bounded, unbounded};
use line_ingest::{
    CameraDriver, LinePositionTracker, ReaderOptions, RollerEntry, spawn_camera_reader,
};
use tracing::{debug, info, warn};

use crate::pipeline::{
    actuation::{ActuationPolicy, ActuationScheduler, TransitTiming},
    aggregator::{Aggregator, DecisionRule},
    archive::spawn_frame_archive,
    config::{EntryTrigger, InspectionConfig, ms},
    data::{AggregatorInput, Alert},
    dispatch::DispatchQueue,
    intake::{EntryAnnouncer, IntakeContext, IntakeGate, spawn_intake},
    persistence::{InspectionStore, PersistenceHandle, RetryPolicy, spawn_persistence_sink},
    plc::PlcLink,
    roller::RollerTable,
    stats::{InspectionStats, StatsSnapshot},
    supervisor::{AlertLog, Supervisor},
    telemetry,
    watchdog::{HealthReport, IntakeState, PauseReason, PipelineHealth},
    workers::{DetectorFactory, WorkerContext, spawn_inference_worker},
};

/// Vendor adapters injected into the pipeline.
pub struct LineAdapters {
    pub cameras: Vec<Box<dyn CameraDriver>>,
    pub detector_factory: DetectorFactory,
    pub plc: Arc<dyn PlcLink>,
    pub store: Box<dyn InspectionStore>,
}

struct PendingAdapters {
    cameras: Vec<Box<dyn CameraDriver>>,
    detector_factory: DetectorFactory,
    store: Box<dyn InspectionStore>,
}

#[derive(Default)]
struct Stages {
    tracker: Option<LinePositionTracker>,
    announcer: Option<Arc<EntryAnnouncer>>,
    aggregator_tx: Option<Sender<AggregatorInput>>,
    sink_handle: Option<PersistenceHandle>,
    intakes: Vec<thread::JoinHandle<()>>,
    entry_poller: Option<thread::JoinHandle<()>>,
    workers: Vec<thread::JoinHandle<()>>,
    archive: Option<thread::JoinHandle<()>>,
    aggregator: Option<thread::JoinHandle<()>>,
    scheduler: Option<thread::JoinHandle<()>>,
    supervisor: Option<thread::JoinHandle<()>>,
    sink: Option<thread::JoinHandle<()>>,
}

pub struct InspectionCoordinator {
    config: InspectionConfig,
    plc: Arc<dyn PlcLink>,
    table: Arc<RollerTable>,
    queue: Arc<DispatchQueue>,
    gate: Arc<IntakeGate>,
    health: Arc<PipelineHealth>,
    stats: Arc<InspectionStats>,
    alerts: Arc<AlertLog>,
    running: Arc<AtomicBool>,
    supervisor_stop: Arc<AtomicBool>,
    adapters: Mutex<Option<PendingAdapters>>,
    stages: Mutex<Option<Stages>>,
}

impl InspectionCoordinator {
    pub fn new(config: InspectionConfig, adapters: LineAdapters) -> Result<Self> {
        config.validate()?;
        let mut driver_ids: Vec<_> = adapters.cameras.iter().map(|c| c.camera_id()).collect();
        driver_ids.sort();
        let mut configured: Vec<_> = config.cameras.iter().map(|c| c.id).collect();
        configured.sort();
        if driver_ids != configured {
            bail!(
                "camera drivers {driver_ids:?} do not match configured cameras {configured:?}"
            );
        }

        let table = Arc::new(RollerTable::new());
        let queue = Arc::new(DispatchQueue::new(config.queue.capacity, table.clone()));
        let health = Arc::new(PipelineHealth::new(
            configured,
            ms(config.supervision.stale_after_ms),
            ms(config.supervision.startup_grace_ms),
        ));
        let alerts = Arc::new(AlertLog::new(config.supervision.alert_history));
        Ok(Self {
            plc: adapters.plc,
            table,
            queue,
            gate: Arc::new(IntakeGate::new()),
            health,
            stats: Arc::new(InspectionStats::new()),
            alerts,
            running: Arc::new(AtomicBool::new(false)),
            supervisor_stop: Arc::new(AtomicBool::new(false)),
            adapters: Mutex::new(Some(PendingAdapters {
                cameras: adapters.cameras,
                detector_factory: adapters.detector_factory,
                store: adapters.store,
            })),
            stages: Mutex::new(None),
            config,
        })
    }

    pub fn config(&self) -> &InspectionConfig {
        &self.config
    }

    /// Bring up every stage. On failure the stages already running are torn
    /// down before the error is returned.
    pub fn start(&self) -> Result<()> {
        let Some(adapters) = lock(&self.adapters).take() else {
            bail!("pipeline was already started");
        };
        let mut stages = Stages::default();
        self.running.store(true, Ordering::SeqCst);
        self.supervisor_stop.store(false, Ordering::SeqCst);
        if let Err(err) = self.spawn_stages(adapters, &mut stages) {
            self.stop_stages(stages);
            return Err(err);
        }
        *lock(&self.stages) = Some(stages);
        info!(
            cameras = self.config.cameras.len(),
            workers = self.config.workers.count,
            "inspection pipeline running"
        );
        Ok(())
    }

    fn spawn_stages(&self, adapters: PendingAdapters, stages: &mut Stages) -> Result<()> {
        let config = &self.config;
        let (aggregator_tx, aggregator_rx) = unbounded();
        let (decided_tx, decided_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();
        stages.aggregator_tx = Some(aggregator_tx.clone());

        let retry = RetryPolicy {
            max_attempts: config.persistence.max_attempts,
            initial_backoff: ms(config.persistence.initial_backoff_ms),
            max_backoff: ms(config.persistence.max_backoff_ms),
        };
        let (sink_handle, sink) = spawn_persistence_sink(adapters.store, retry, self.stats.clone())
            .context("failed to spawn persistence sink")?;
        stages.sink = Some(sink);
        stages.sink_handle = Some(sink_handle.clone());

        let archive = match &config.persistence.archive {
            Some(archive_config) => {
                let (handle, writer) = spawn_frame_archive(archive_config, self.stats.clone())
                    .with_context(|| {
                        format!("failed to start frame archive in {}", archive_config.dir.display())
                    })?;
                stages.archive = Some(writer);
                Some(handle)
            }
            None => None,
        };

        let (init_tx, init_rx) =
            bounded::<std::result::Result<String, String>>(config.workers.count);
        let thresholds = Arc::new(config.decision.thresholds.clone());
        for worker_index in 0..config.workers.count {
            let ctx = WorkerContext {
                queue: self.queue.clone(),
                reports: aggregator_tx.clone(),
                thresholds: thresholds.clone(),
                inference_timeout: ms(config.workers.inference_timeout_ms),
                health: self.health.clone(),
                stats: self.stats.clone(),
                archive: archive.clone(),
            };
            let handle = spawn_inference_worker(
                worker_index,
                adapters.detector_factory.clone(),
                ctx,
                init_tx.clone(),
            )
            .with_context(|| format!("failed to spawn inference worker #{worker_index}"))?;
            stages.workers.push(handle);
        }
        drop(init_tx);
        drop(archive);
        for _ in 0..config.workers.count {
            match init_rx.recv() {
                Ok(Ok(message)) => debug!("{message}"),
                Ok(Err(err)) => bail!(err),
                Err(err) => bail!("inference worker exited before initialising: {err}"),
            }
        }

        let mut tracker = LinePositionTracker::new(
            config.line.motion,
            config.line.roller_pitch_mm,
            Instant::now(),
        );
        if config.line.entry_trigger == EntryTrigger::Sensor {
            tracker = tracker.with_sensor_entries();
        }
        stages.tracker = Some(tracker.clone());

        let rule = DecisionRule {
            thresholds: config.decision.thresholds.clone(),
            min_view_fraction: config.decision.min_view_fraction,
        };
        let collect_deadline = config.collect_deadline();
        let aggregator = Aggregator {
            table: self.table.clone(),
            rule: rule.clone(),
            expected: config.expected_cameras(),
            collect_deadline,
            decided_tx,
            sink: sink_handle.clone(),
            stats: self.stats.clone(),
        };
        let tick = (collect_deadline / 10).clamp(Duration::from_millis(1), Duration::from_millis(20));
        stages.aggregator = Some(
            aggregator
                .spawn(aggregator_rx, tick, ms(config.supervision.drain_timeout_ms))
                .context("failed to spawn aggregator")?,
        );

        let scheduler = ActuationScheduler {
            plc: self.plc.clone(),
            timing: TransitTiming {
                transit_distance_mm: config.line.transit_distance_mm,
                fallback_transit: ms(config.line.fallback_transit_ms),
                command_lead: ms(config.actuation.command_lead_ms),
            },
            policy: ActuationPolicy {
                pass_mode: config.actuation.pass_mode,
                inconclusive_action: config.actuation.inconclusive_action,
            },
            plc_timeout: ms(config.actuation.plc_timeout_ms),
            tracker: tracker.clone(),
            table: self.table.clone(),
            outcomes: aggregator_tx.clone(),
            events: events_tx.clone(),
        };
        stages.scheduler = Some(
            scheduler
                .spawn(decided_rx)
                .context("failed to spawn actuation scheduler")?,
        );

        let supervisor = Supervisor {
            plc: self.plc.clone(),
            plc_timeout: ms(config.actuation.plc_timeout_ms),
            link_grace: ms(config.supervision.plc_link_grace_ms),
            max_lifetime: config.max_lifetime(),
            retention: ms(config.supervision.terminal_retention_ms),
            interval: ms(config.supervision.health_interval_ms),
            rule,
            table: self.table.clone(),
            queue: self.queue.clone(),
            gate: self.gate.clone(),
            health: self.health.clone(),
            stats: self.stats.clone(),
            alerts: self.alerts.clone(),
            sink: sink_handle,
        };
        stages.supervisor = Some(
            supervisor
                .spawn(events_rx, self.supervisor_stop.clone())
                .context("failed to spawn supervisor")?,
        );

        let announcer = Arc::new(EntryAnnouncer::new(tracker.clone(), aggregator_tx.clone()));
        stages.announcer = Some(announcer.clone());
        for driver in adapters.cameras {
            let camera_id = driver.camera_id();
            let camera = config
                .cameras
                .iter()
                .find(|camera| camera.id == camera_id)
                .ok_or_else(|| anyhow!("camera {camera_id} is not configured"))?;
            let options = ReaderOptions {
                capture_timeout: ms(camera.capture_timeout_ms),
                ..ReaderOptions::default()
            };
            let stream = spawn_camera_reader(driver, tracker.clone(), options, self.running.clone())?;
            let ctx = IntakeContext {
                offset_mm: camera.offset_mm,
                queue: self.queue.clone(),
                push_timeout: ms(config.queue.push_timeout_ms),
                announcer: announcer.clone(),
                gate: self.gate.clone(),
                reports: aggregator_tx.clone(),
                events: events_tx.clone(),
                health: self.health.clone(),
                stats: self.stats.clone(),
                running: self.running.clone(),
            };
            stages.intakes.push(
                spawn_intake(stream, ctx)
                    .with_context(|| format!("failed to spawn intake for {camera_id}"))?,
            );
        }

        if config.line.entry_trigger == EntryTrigger::Pitch {
            let running = self.running.clone();
            let period = ms(config.line.entry_poll_ms.max(1));
            stages.entry_poller = Some(
                telemetry::spawn_thread("roller-entries", move || {
                    while running.load(Ordering::Relaxed) {
                        announcer.announce(Instant::now());
                        thread::sleep(period);
                    }
                })
                .context("failed to spawn roller entry poller")?,
            );
        }
        Ok(())
    }

    /// Stop the pipeline. Rollers already seen are decided and given a chance
    /// to actuate before the threads exit.
    pub fn shutdown(&self) -> Result<()> {
        let Some(stages) = lock(&self.stages).take() else {
            return Ok(());
        };
        info!("stopping inspection pipeline");
        self.stop_stages(stages);
        info!(stats = ?self.stats.snapshot(), "inspection pipeline stopped");
        Ok(())
    }

    fn stop_stages(&self, mut stages: Stages) {
        self.running.store(false, Ordering::SeqCst);
        join_all("intake", stages.intakes.drain(..));
        join_all("entry poller", stages.entry_poller.take());

        self.queue.close();
        join_all("inference worker", stages.workers.drain(..));
        join_all("frame archive", stages.archive.take());

        stages.announcer = None;
        if let Some(tx) = stages.aggregator_tx.take() {
            let _ = tx.send(AggregatorInput::Shutdown);
        }
        join_all("aggregator", stages.aggregator.take());
        join_all("actuation scheduler", stages.scheduler.take());

        self.supervisor_stop.store(true, Ordering::SeqCst);
        join_all("supervisor", stages.supervisor.take());

        stages.sink_handle = None;
        join_all("persistence sink", stages.sink.take());
    }

    pub fn pause(&self) -> IntakeState {
        if self.gate.set(PauseReason::Operator, true) {
            info!("intake paused by operator");
        }
        self.intake_state()
    }

    /// Lift the operator pause. Intake stays paused while the PLC link is
    /// down.
    pub fn resume(&self) -> IntakeState {
        if self.gate.set(PauseReason::Operator, false) {
            info!("operator pause lifted");
        }
        let state = self.intake_state();
        if state == IntakeState::Paused {
            warn!("intake still paused: {:?}", self.gate.reasons());
        }
        state
    }

    fn intake_state(&self) -> IntakeState {
        if lock(&self.stages).is_none() {
            IntakeState::Stopped
        } else if self.gate.is_paused() {
            IntakeState::Paused
        } else {
            IntakeState::Running
        }
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            camera_status: self.health.camera_statuses(),
            inference_status: self.health.inference_status(),
            plc_status: self.health.plc_status(),
            queue_depth: self.queue.depth(),
            queue_capacity: self.queue.capacity(),
            intake: self.intake_state(),
            pause_reasons: self.gate.reasons(),
            active_rollers: self.table.active_count(),
            stats: self.stats.snapshot(),
        }
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.recent()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Signal a roller entry from an external sensor.
    pub fn trigger_roller_entry(&self) -> Option<RollerEntry> {
        let announcer = lock(&self.stages).as_ref()?.announcer.clone()?;
        Some(announcer.trigger(Instant::now()))
    }

    /// Line tracker, for feeding encoder readings. `None` until started.
    pub fn tracker(&self) -> Option<LinePositionTracker> {
        lock(&self.stages).as_ref()?.tracker.clone()
    }

    pub fn rollers(&self) -> &RollerTable {
        &self.table
    }
}

impl Drop for InspectionCoordinator {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("shutdown failed: {err:#}");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn join_all(stage: &str, handles: impl IntoIterator<Item = thread::JoinHandle<()>>) {
    for handle in handles {
        if handle.join().is_err() {
            warn!("{stage} thread panicked");
        }
    }
}
