//! Per-roller aggregation of view reports into a single verdict.
//!
//! The aggregator thread is the only stage that creates roller contexts and
//! moves them forward; the supervisor's lifetime sweep is the one exception
//! and goes through the same per-roller lock. A roller is decided as soon as
//! every expected camera has settled, or when its collection deadline passes.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use defect_core::{Detection, ThresholdProfile};
use line_ingest::{CameraId, RollerId};
use tracing::{debug, info, warn};

use crate::pipeline::{
    data::{
        AggregatorInput, DecidedRoller, Decision, DropReason, OutcomeRecord, RollerOutcome,
        Verdict, ViewReport,
    },
    persistence::PersistenceHandle,
    roller::{RollerContext, RollerError, RollerState, RollerTable, lock},
    stats::InspectionStats,
    telemetry,
};

/// Combines the views of one roller into a decision.
///
/// Precedence is REJECT, then INCONCLUSIVE, then ACCEPT: a confident defect
/// rejects the roller even when other views are missing, while ACCEPT needs
/// at least `min_view_fraction` of the expected views to have reported.
/// Defects are judged per camera view so locator and head rules only see
/// boxes from the same image.
#[derive(Clone, Debug)]
pub struct DecisionRule {
    pub thresholds: ThresholdProfile,
    pub min_view_fraction: f64,
}

impl DecisionRule {
    pub fn evaluate(&self, context: &RollerContext) -> (Decision, Vec<String>) {
        let mut views: BTreeMap<CameraId, Vec<&Detection>> = BTreeMap::new();
        for detection in context.detections() {
            views.entry(detection.camera_id).or_default().push(detection);
        }
        let defect_classes: BTreeSet<String> = views
            .values()
            .flat_map(|view| self.thresholds.view_defects(view))
            .collect();
        if !defect_classes.is_empty() {
            return (Decision::Reject, defect_classes.into_iter().collect());
        }

        let expected = context.expected_cameras().len();
        let reported = context.reported_cameras().len();
        if reported == 0 {
            return (Decision::Inconclusive, Vec::new());
        }
        let coverage = reported as f64 / expected.max(1) as f64;
        if coverage + 1e-9 < self.min_view_fraction {
            (Decision::Inconclusive, Vec::new())
        } else {
            (Decision::Accept, Vec::new())
        }
    }
}

/// Decide `context` now. Forced conclusions come from the lifetime sweep and
/// are always INCONCLUSIVE.
pub(crate) fn conclude(
    context: &mut RollerContext,
    rule: &DecisionRule,
    now: Instant,
    forced: bool,
) -> Result<DecidedRoller, RollerError> {
    if context.state() == RollerState::Collecting {
        context.begin_deciding()?;
    }
    let (decision, defect_classes) = rule.evaluate(context);
    let decision = if forced {
        Decision::Inconclusive
    } else {
        decision
    };
    let verdict = Verdict {
        roller_id: context.roller_id(),
        decision,
        contributing_detections: context.detections().cloned().collect(),
        defect_classes,
        reported_cameras: context.reported_cameras(),
        missing_cameras: context.missing_cameras(),
        degraded: context.is_degraded(),
        forced,
        decided_at: Utc::now(),
        decision_latency: context.age(now),
    };
    let verdict = context.decide(verdict, now)?;
    Ok(DecidedRoller {
        verdict,
        created_at: context.created_at(),
        decided_at: now,
        entry_position_mm: context.entry_position_mm(),
    })
}

pub(crate) struct Aggregator {
    pub(crate) table: Arc<RollerTable>,
    pub(crate) rule: DecisionRule,
    pub(crate) expected: BTreeSet<CameraId>,
    pub(crate) collect_deadline: Duration,
    pub(crate) decided_tx: Sender<DecidedRoller>,
    pub(crate) sink: PersistenceHandle,
    pub(crate) stats: Arc<InspectionStats>,
}

impl Aggregator {
    pub(crate) fn spawn(
        self,
        rx: Receiver<AggregatorInput>,
        tick: Duration,
        drain_timeout: Duration,
    ) -> std::io::Result<thread::JoinHandle<()>> {
        telemetry::spawn_thread("inspection-aggregator", move || {
            self.run(rx, tick, drain_timeout)
        })
    }

    fn run(self, rx: Receiver<AggregatorInput>, tick: Duration, drain_timeout: Duration) {
        let mut last_tick = Instant::now();
        let mut draining_since: Option<Instant> = None;
        loop {
            match rx.recv_timeout(tick) {
                Ok(AggregatorInput::Shutdown) => {
                    let now = Instant::now();
                    self.decide_remaining(now);
                    draining_since = Some(now);
                }
                Ok(input) => self.handle(input, Instant::now()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let now = Instant::now();
            if now.saturating_duration_since(last_tick) >= tick {
                self.on_tick(now);
                last_tick = now;
            }
            if let Some(since) = draining_since {
                if self.table.active_count() == 0 {
                    debug!("all rollers settled; aggregator stopping");
                    break;
                }
                if now.saturating_duration_since(since) >= drain_timeout {
                    self.abandon_unfinished(now);
                    break;
                }
            }
        }
    }

    pub(crate) fn handle(&self, input: AggregatorInput, now: Instant) {
        match input {
            AggregatorInput::Entered {
                roller_id,
                entered_at,
                entry_position_mm,
            } => self.on_entered(roller_id, entered_at, entry_position_mm),
            AggregatorInput::Report(report) => self.on_report(report, now),
            AggregatorInput::Outcome { roller_id, outcome } => {
                self.on_outcome(roller_id, outcome, now)
            }
            AggregatorInput::Shutdown => self.decide_remaining(now),
        }
    }

    fn on_entered(&self, roller_id: RollerId, entered_at: Instant, entry_position_mm: f64) {
        let context =
            RollerContext::new(roller_id, self.expected.clone(), entered_at, entry_position_mm);
        if self.table.insert(context) {
            self.stats.roller_entered();
            debug!(roller = %roller_id, position = entry_position_mm, "roller entered");
        } else {
            debug!(roller = %roller_id, "duplicate roller entry ignored");
        }
    }

    fn on_report(&self, report: ViewReport, now: Instant) {
        let roller_id = report.roller_id;
        let camera_id = report.camera_id;
        let Some(handle) = self.table.get(roller_id) else {
            debug!(roller = %roller_id, camera = %camera_id, "report for unknown roller dropped");
            metrics::counter!("inspection_orphan_reports_total").increment(1);
            return;
        };
        let mut context = lock(&handle);
        match context.record(report) {
            Ok(()) => {
                if context.all_views_settled() || context.age(now) >= self.collect_deadline {
                    self.decide(&mut context, now);
                }
            }
            Err(RollerError::LateReport { state, .. }) => {
                debug!(roller = %roller_id, camera = %camera_id, ?state, "late report ignored");
                metrics::counter!("inspection_late_reports_total").increment(1);
            }
            Err(err) => warn!("{err}"),
        }
    }

    fn on_outcome(&self, roller_id: RollerId, outcome: RollerOutcome, now: Instant) {
        let applied = self
            .table
            .with_entry(roller_id, |context| context.finish(&outcome, now));
        match applied {
            Some(Ok(())) => {
                match outcome {
                    RollerOutcome::Actuated { .. } => self.stats.actuated(),
                    RollerOutcome::Dropped { reason } => self.stats.dropped(reason),
                }
                debug!(roller = %roller_id, ?outcome, "roller finished");
                self.sink.outcome(OutcomeRecord::now(roller_id, outcome));
            }
            Some(Err(err)) => warn!("{err}"),
            None => warn!(roller = %roller_id, "outcome for unknown roller"),
        }
    }

    /// Decide every roller whose collection deadline has passed.
    pub(crate) fn on_tick(&self, now: Instant) {
        for roller_id in self.table.ids() {
            let Some(handle) = self.table.get(roller_id) else {
                continue;
            };
            let mut context = lock(&handle);
            if context.state() == RollerState::Collecting
                && context.age(now) >= self.collect_deadline
            {
                self.decide(&mut context, now);
            }
        }
    }

    fn decide_remaining(&self, now: Instant) {
        for roller_id in self.table.ids() {
            let Some(handle) = self.table.get(roller_id) else {
                continue;
            };
            let mut context = lock(&handle);
            if context.state().accepts_reports() {
                self.decide(&mut context, now);
            }
        }
    }

    fn abandon_unfinished(&self, now: Instant) {
        let outcome = RollerOutcome::Dropped {
            reason: DropReason::Shutdown,
        };
        for roller_id in self.table.ids() {
            let Some(handle) = self.table.get(roller_id) else {
                continue;
            };
            let mut context = lock(&handle);
            if context.state() == RollerState::Decided && context.finish(&outcome, now).is_ok() {
                warn!(roller = %roller_id, "roller abandoned at shutdown");
                self.stats.dropped(DropReason::Shutdown);
                self.sink.outcome(OutcomeRecord::now(roller_id, outcome));
            }
        }
    }

    fn decide(&self, context: &mut RollerContext, now: Instant) {
        let decided = match conclude(context, &self.rule, now, false) {
            Ok(decided) => decided,
            Err(err) => {
                warn!("{err}");
                return;
            }
        };
        let verdict = decided.verdict.clone();
        info!(
            roller = %verdict.roller_id,
            decision = verdict.decision.label(),
            latency_ms = verdict.decision_latency.as_millis() as u64,
            missing = verdict.missing_cameras.len(),
            degraded = verdict.degraded,
            "roller decided"
        );
        self.stats.verdict(&verdict);
        self.sink.verdict(verdict);
        if self.decided_tx.send(decided).is_err() {
            let outcome = RollerOutcome::Dropped {
                reason: DropReason::Shutdown,
            };
            if context.finish(&outcome, now).is_ok() {
                self.stats.dropped(DropReason::Shutdown);
                self.sink
                    .outcome(OutcomeRecord::now(context.roller_id(), outcome));
            }
        }
    }
}
