//! Supervisor loop: liveness, PLC link grace, roller expiry and retention.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info, warn};

use crate::pipeline::{
    aggregator::{DecisionRule, conclude},
    data::{Alert, AlertKind, DropReason, OutcomeRecord, PipelineEvent, RollerOutcome},
    dispatch::DispatchQueue,
    intake::IntakeGate,
    persistence::PersistenceHandle,
    plc::{LinkStatus, PlcLink},
    roller::{RollerContext, RollerState, RollerTable, lock},
    stats::InspectionStats,
    telemetry,
    watchdog::{ComponentStatus, HealthMonitor, PauseReason, PipelineHealth},
};

/// Bounded history of operator alerts, newest last.
pub(crate) struct AlertLog {
    capacity: usize,
    entries: Mutex<VecDeque<Alert>>,
}

impl AlertLog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, alert: Alert) {
        metrics::counter!("inspection_alerts_total", "kind" => format!("{:?}", alert.kind))
            .increment(1);
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(alert);
    }

    pub(crate) fn recent(&self) -> Vec<Alert> {
        match self.entries.lock() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }
}

pub(crate) struct Supervisor {
    pub(crate) plc: Arc<dyn PlcLink>,
    pub(crate) plc_timeout: Duration,
    pub(crate) link_grace: Duration,
    pub(crate) max_lifetime: Duration,
    pub(crate) retention: Duration,
    pub(crate) interval: Duration,
    pub(crate) rule: DecisionRule,
    pub(crate) table: Arc<RollerTable>,
    pub(crate) queue: Arc<DispatchQueue>,
    pub(crate) gate: Arc<IntakeGate>,
    pub(crate) health: Arc<PipelineHealth>,
    pub(crate) stats: Arc<InspectionStats>,
    pub(crate) alerts: Arc<AlertLog>,
    pub(crate) sink: PersistenceHandle,
}

impl Supervisor {
    pub(crate) fn spawn(
        self,
        events: Receiver<PipelineEvent>,
        stop: Arc<AtomicBool>,
    ) -> std::io::Result<thread::JoinHandle<()>> {
        telemetry::spawn_thread("inspection-supervisor", move || self.run(events, &stop))
    }

    fn run(self, events: Receiver<PipelineEvent>, stop: &AtomicBool) {
        let mut monitor = HealthMonitor::default();
        let mut last_check = Instant::now();
        self.check(last_check, &mut monitor);
        while !stop.load(Ordering::SeqCst) {
            match events.recv_timeout(self.interval) {
                Ok(event) => self.escalate(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => thread::sleep(self.interval),
            }
            for event in events.try_iter() {
                self.escalate(event);
            }
            let now = Instant::now();
            if now.saturating_duration_since(last_check) >= self.interval {
                self.check(now, &mut monitor);
                last_check = now;
            }
        }
        for event in events.try_iter() {
            self.escalate(event);
        }
        debug!("supervisor exiting");
    }

    pub(crate) fn check(&self, now: Instant, monitor: &mut HealthMonitor) {
        self.poll_link();
        self.sweep(now);
        self.observe_components(monitor);
        metrics::gauge!("inspection_queue_depth").set(self.queue.depth() as f64);
        metrics::gauge!("inspection_active_rollers").set(self.table.active_count() as f64);
    }

    /// Poll the PLC and pause intake once the link has been down longer than
    /// the grace period. Only a link-loss pause is lifted on recovery.
    pub(crate) fn poll_link(&self) {
        match self.plc.read_link_status(self.plc_timeout) {
            LinkStatus::Up => {
                self.health.record_link(LinkStatus::Up);
                if self.gate.set(PauseReason::LinkLoss, false) {
                    info!("PLC link restored; intake resumed");
                    if self.gate.is_paused() {
                        info!("intake stays paused by operator");
                    }
                }
            }
            LinkStatus::Down => {
                let down_for = self.health.record_link(LinkStatus::Down).unwrap_or_default();
                if down_for >= self.link_grace && self.gate.set(PauseReason::LinkLoss, true) {
                    error!(down_ms = down_for.as_millis() as u64, "PLC link lost; intake paused");
                    self.alerts.push(Alert::new(
                        AlertKind::LinkLoss,
                        format!("PLC link down for {down_for:?}; intake paused"),
                    ));
                }
            }
        }
    }

    /// Expire rollers stuck before a verdict past their lifetime, and decided
    /// rollers still without an outcome a lifetime past their fire time. Forget
    /// finished rollers past the retention period. Returns the number expired.
    pub(crate) fn sweep(&self, now: Instant) -> usize {
        let mut expired = 0;
        for roller_id in self.table.ids() {
            let Some(handle) = self.table.get(roller_id) else {
                continue;
            };
            let mut context = lock(&handle);
            let state = context.state();
            let age = context.age(now);
            if state.accepts_reports() && age >= self.max_lifetime {
                let decided = match conclude(&mut context, &self.rule, now, true) {
                    Ok(decided) => decided,
                    Err(err) => {
                        warn!("{err}");
                        continue;
                    }
                };
                self.stats.verdict(&decided.verdict);
                self.sink.verdict(decided.verdict);
            } else if state == RollerState::Decided && self.outcome_overdue(&context, now) {
                warn!(roller = %roller_id, "decided roller never reached an outcome");
            } else {
                if state.is_terminal()
                    && context
                        .finished_at()
                        .is_some_and(|at| now.saturating_duration_since(at) >= self.retention)
                {
                    drop(context);
                    self.table.remove(roller_id);
                }
                continue;
            }

            let outcome = RollerOutcome::Dropped {
                reason: DropReason::Expired,
            };
            if let Err(err) = context.finish(&outcome, now) {
                warn!("{err}");
                continue;
            }
            self.stats.dropped(DropReason::Expired);
            self.sink.outcome(OutcomeRecord::now(roller_id, outcome));
            expired += 1;
            drop(context);
            self.escalate(PipelineEvent::RollerExpired { roller_id, age });
        }
        expired
    }

    /// A decided roller is overdue once `max_lifetime` has passed since its
    /// fire time, or since the verdict when no command was ever scheduled.
    fn outcome_overdue(&self, context: &RollerContext, now: Instant) -> bool {
        let since = context
            .fire_at()
            .or(context.decided_at())
            .unwrap_or(context.created_at());
        now.saturating_duration_since(since) >= self.max_lifetime
    }

    fn observe_components(&self, monitor: &mut HealthMonitor) {
        for camera in self.health.camera_statuses() {
            if monitor.observe(camera.camera_id.to_string(), camera.status) {
                self.alerts.push(Alert::new(
                    AlertKind::ComponentStale,
                    format!("{} is {:?}", camera.camera_id, camera.status),
                ));
            }
        }
        let inference = self.health.inference_status();
        if monitor.observe("inference".to_string(), inference) {
            self.alerts.push(Alert::new(
                AlertKind::ComponentStale,
                format!("inference is {inference:?}"),
            ));
        }
        let plc = match self.health.plc_status() {
            LinkStatus::Up => ComponentStatus::Up,
            LinkStatus::Down => ComponentStatus::Down,
        };
        monitor.observe("plc".to_string(), plc);
    }

    pub(crate) fn escalate(&self, event: PipelineEvent) {
        let alert = match event {
            PipelineEvent::TimingViolation(violation) => {
                Alert::new(AlertKind::TimingViolation, violation.to_string())
            }
            PipelineEvent::LinkError { roller_id, error } => {
                self.health.link_failed();
                let message = match roller_id {
                    Some(roller_id) => format!("{roller_id}: {error}"),
                    None => error,
                };
                Alert::new(AlertKind::LinkError, message)
            }
            PipelineEvent::RollerExpired { roller_id, age } => {
                warn!(roller = %roller_id, age_ms = age.as_millis() as u64, "roller expired");
                Alert::new(
                    AlertKind::RollerExpired,
                    format!("{roller_id} expired after {age:?}"),
                )
            }
            PipelineEvent::FrameDropped {
                roller_id,
                camera_id,
                failure,
            } => {
                debug!(roller = %roller_id, camera = %camera_id, cause = failure.label(), "view lost to backpressure");
                return;
            }
            PipelineEvent::CaptureFailed { camera_id, error } => {
                Alert::new(AlertKind::CaptureFailure, format!("{camera_id}: {error}"))
            }
            PipelineEvent::CameraStopped { camera_id } => {
                Alert::new(AlertKind::CaptureFailure, format!("{camera_id} stopped"))
            }
        };
        self.alerts.push(alert);
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, sync::atomic::AtomicBool};

    use defect_core::ThresholdProfile;
    use line_ingest::{CameraId, RollerId};

    use super::*;
    use crate::pipeline::{
        data::{ActuationCommand, Decision, Verdict},
        dispatch::NoEviction,
        persistence::{MemoryStore, RetryPolicy, spawn_persistence_sink},
        plc::{LinkError, PlcAck},
    };

    struct TogglePlc {
        up: AtomicBool,
    }

    impl PlcLink for TogglePlc {
        fn send_actuation(
            &self,
            command: &ActuationCommand,
            _timeout: Duration,
        ) -> Result<PlcAck, LinkError> {
            Ok(PlcAck {
                roller_id: command.roller_id,
                acknowledged_at: Instant::now(),
            })
        }

        fn read_link_status(&self, _timeout: Duration) -> LinkStatus {
            if self.up.load(Ordering::SeqCst) {
                LinkStatus::Up
            } else {
                LinkStatus::Down
            }
        }
    }

    struct Fixture {
        supervisor: Supervisor,
        plc: Arc<TogglePlc>,
        store: MemoryStore,
        sink: thread::JoinHandle<()>,
    }

    fn fixture(link_grace: Duration) -> Fixture {
        let store = MemoryStore::new();
        let stats = Arc::new(InspectionStats::new());
        let (sink_handle, sink) =
            spawn_persistence_sink(Box::new(store.clone()), RetryPolicy::default(), stats.clone())
                .unwrap();
        let plc = Arc::new(TogglePlc {
            up: AtomicBool::new(true),
        });
        let supervisor = Supervisor {
            plc: plc.clone(),
            plc_timeout: Duration::from_millis(10),
            link_grace,
            max_lifetime: Duration::from_millis(500),
            retention: Duration::from_millis(100),
            interval: Duration::from_millis(10),
            rule: DecisionRule {
                thresholds: ThresholdProfile::default(),
                min_view_fraction: 1.0,
            },
            table: Arc::new(RollerTable::new()),
            queue: Arc::new(DispatchQueue::new(4, Arc::new(NoEviction))),
            gate: Arc::new(IntakeGate::new()),
            health: Arc::new(PipelineHealth::new(
                [CameraId(1)],
                Duration::from_secs(1),
                Duration::from_secs(1),
            )),
            stats,
            alerts: Arc::new(AlertLog::new(8)),
            sink: sink_handle,
        };
        Fixture {
            supervisor,
            plc,
            store,
            sink,
        }
    }

    #[test]
    fn sweep_expires_stale_rollers_then_forgets_them() {
        let fixture = fixture(Duration::ZERO);
        let supervisor = &fixture.supervisor;
        let created = Instant::now();
        let expected: BTreeSet<CameraId> = [CameraId(1)].into_iter().collect();
        supervisor
            .table
            .insert(RollerContext::new(RollerId(4), expected.clone(), created, 0.0));
        supervisor
            .table
            .insert(RollerContext::new(RollerId(5), expected, created + Duration::from_millis(400), 100.0));

        let expire_at = created + Duration::from_millis(600);
        assert_eq!(supervisor.sweep(expire_at), 1);
        assert_eq!(supervisor.table.state_of(RollerId(4)), Some(RollerState::Dropped));
        assert_eq!(supervisor.table.state_of(RollerId(5)), Some(RollerState::Collecting));
        let verdict = supervisor.table.verdict_of(RollerId(4)).unwrap();
        assert_eq!(verdict.decision, Decision::Inconclusive);
        assert!(verdict.forced);

        supervisor.sweep(expire_at + Duration::from_millis(150));
        assert!(supervisor.table.get(RollerId(4)).is_none());
        assert_eq!(supervisor.alerts.recent()[0].kind, AlertKind::RollerExpired);

        let Fixture { supervisor, store, sink, .. } = fixture;
        drop(supervisor);
        sink.join().unwrap();
        assert_eq!(store.verdicts().len(), 1);
        assert_eq!(
            store.outcomes()[0].outcome,
            RollerOutcome::Dropped {
                reason: DropReason::Expired
            }
        );
    }

    fn decided(table: &RollerTable, roller: u64, decided_at: Instant) {
        let mut context =
            RollerContext::new(RollerId(roller), BTreeSet::from([CameraId(1)]), decided_at, 0.0);
        context.begin_deciding().unwrap();
        let verdict = Verdict {
            roller_id: RollerId(roller),
            decision: Decision::Reject,
            contributing_detections: Vec::new(),
            defect_classes: vec!["crack".into()],
            reported_cameras: vec![CameraId(1)],
            missing_cameras: Vec::new(),
            degraded: false,
            forced: false,
            decided_at: chrono::Utc::now(),
            decision_latency: Duration::ZERO,
        };
        context.decide(verdict, decided_at).unwrap();
        table.insert(context);
    }

    #[test]
    fn decided_rollers_expire_a_lifetime_past_their_fire_time() {
        let fixture = fixture(Duration::ZERO);
        let supervisor = &fixture.supervisor;
        let decided_at = Instant::now();
        let fire_at = decided_at + Duration::from_millis(300);
        decided(&supervisor.table, 8, decided_at);
        supervisor
            .table
            .with_entry(RollerId(8), |context| context.schedule_fire(fire_at))
            .unwrap();
        decided(&supervisor.table, 9, decided_at);

        // Roller 9 never got a command, so its clock runs from the verdict.
        assert_eq!(supervisor.sweep(decided_at + Duration::from_millis(600)), 1);
        assert_eq!(supervisor.table.state_of(RollerId(8)), Some(RollerState::Decided));
        assert_eq!(supervisor.table.state_of(RollerId(9)), Some(RollerState::Dropped));

        assert_eq!(supervisor.sweep(fire_at + Duration::from_millis(499)), 0);
        assert_eq!(supervisor.sweep(fire_at + Duration::from_millis(500)), 1);
        assert_eq!(supervisor.table.state_of(RollerId(8)), Some(RollerState::Dropped));
        assert_eq!(supervisor.table.verdict_of(RollerId(8)).unwrap().decision, Decision::Reject);
        assert_eq!(supervisor.stats.snapshot().dropped, 2);
        let kinds: Vec<AlertKind> = supervisor.alerts.recent().iter().map(|alert| alert.kind).collect();
        assert_eq!(kinds, vec![AlertKind::RollerExpired, AlertKind::RollerExpired]);

        let Fixture { supervisor, store, sink, .. } = fixture;
        drop(supervisor);
        sink.join().unwrap();
        assert!(store.verdicts().is_empty());
        let outcomes: Vec<(RollerId, RollerOutcome)> = store
            .outcomes()
            .into_iter()
            .map(|record| (record.roller_id, record.outcome))
            .collect();
        let expired = RollerOutcome::Dropped {
            reason: DropReason::Expired,
        };
        assert_eq!(
            outcomes,
            vec![(RollerId(9), expired), (RollerId(8), expired)]
        );
    }

    #[test]
    fn failed_send_marks_the_plc_down_at_once() {
        let fixture = fixture(Duration::from_secs(10));
        let supervisor = &fixture.supervisor;
        supervisor.poll_link();
        assert_eq!(supervisor.health.plc_status(), LinkStatus::Up);

        supervisor.escalate(PipelineEvent::LinkError {
            roller_id: Some(RollerId(3)),
            error: "unreachable".into(),
        });
        assert_eq!(supervisor.health.plc_status(), LinkStatus::Down);
        let alert = &supervisor.alerts.recent()[0];
        assert_eq!(alert.kind, AlertKind::LinkError);
        assert!(alert.message.contains("R3"));

        supervisor.poll_link();
        assert_eq!(supervisor.health.plc_status(), LinkStatus::Up);
    }

    #[test]
    fn link_loss_pauses_intake_until_recovery() {
        let fixture = fixture(Duration::ZERO);
        let supervisor = &fixture.supervisor;
        fixture.plc.up.store(false, Ordering::SeqCst);
        supervisor.poll_link();
        assert!(supervisor.gate.is_set(PauseReason::LinkLoss));
        assert_eq!(supervisor.health.plc_status(), LinkStatus::Down);
        assert_eq!(supervisor.alerts.recent()[0].kind, AlertKind::LinkLoss);

        fixture.plc.up.store(true, Ordering::SeqCst);
        supervisor.poll_link();
        assert!(!supervisor.gate.is_paused());
        assert_eq!(supervisor.health.plc_status(), LinkStatus::Up);
    }

    #[test]
    fn short_outage_within_grace_keeps_intake_running() {
        let fixture = fixture(Duration::from_secs(10));
        fixture.plc.up.store(false, Ordering::SeqCst);
        fixture.supervisor.poll_link();
        assert!(!fixture.supervisor.gate.is_paused());
        assert_eq!(fixture.supervisor.health.plc_status(), LinkStatus::Down);
    }

    #[test]
    fn operator_pause_survives_link_recovery() {
        let fixture = fixture(Duration::ZERO);
        let supervisor = &fixture.supervisor;
        supervisor.gate.set(PauseReason::Operator, true);
        fixture.plc.up.store(false, Ordering::SeqCst);
        supervisor.poll_link();
        fixture.plc.up.store(true, Ordering::SeqCst);
        supervisor.poll_link();
        assert_eq!(supervisor.gate.reasons(), vec![PauseReason::Operator]);
    }

    #[test]
    fn alert_log_keeps_most_recent() {
        let log = AlertLog::new(2);
        for index in 0..3 {
            log.push(Alert::new(AlertKind::CaptureFailure, format!("alert {index}")));
        }
        let messages: Vec<String> = log.recent().into_iter().map(|alert| alert.message).collect();
        assert_eq!(messages, vec!["alert 1".to_string(), "alert 2".to_string()]);
    }
}
