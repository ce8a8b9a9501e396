//! Running inspection counters.
//!
//! Every counter is mirrored to the Prometheus recorder when one is installed;
//! the in-process copy backs the health report and the HTTP stats endpoint.

use std::{
    collections::BTreeMap,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use serde::Serialize;

use crate::pipeline::data::{Decision, DropReason, Verdict, ViewFailure};

#[derive(Default)]
pub struct InspectionStats {
    rollers_entered: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    inconclusive: AtomicU64,
    degraded: AtomicU64,
    actuated: AtomicU64,
    dropped: AtomicU64,
    timing_violations: AtomicU64,
    link_errors: AtomicU64,
    frames_queued: AtomicU64,
    frames_lost: AtomicU64,
    frames_unassigned: AtomicU64,
    frames_paused: AtomicU64,
    inference_failures: AtomicU64,
    persistence_failures: AtomicU64,
    views_archived: AtomicU64,
    archive_failures: AtomicU64,
    defect_classes: Mutex<BTreeMap<String, u64>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub rollers_entered: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub inconclusive: u64,
    pub degraded: u64,
    pub actuated: u64,
    pub dropped: u64,
    pub timing_violations: u64,
    pub link_errors: u64,
    pub frames_queued: u64,
    pub frames_lost: u64,
    pub frames_unassigned: u64,
    pub frames_paused: u64,
    pub inference_failures: u64,
    pub persistence_failures: u64,
    pub views_archived: u64,
    pub archive_failures: u64,
    pub defect_classes: BTreeMap<String, u64>,
}

impl InspectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn roller_entered(&self) {
        self.rollers_entered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("inspection_rollers_entered_total").increment(1);
    }

    pub(crate) fn verdict(&self, verdict: &Verdict) {
        let counter = match verdict.decision {
            Decision::Accept => &self.accepted,
            Decision::Reject => &self.rejected,
            Decision::Inconclusive => &self.inconclusive,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if verdict.degraded {
            self.degraded.fetch_add(1, Ordering::Relaxed);
        }
        metrics::counter!("inspection_verdicts_total", "decision" => verdict.decision.label())
            .increment(1);
        metrics::histogram!("inspection_decision_latency_seconds")
            .record(verdict.decision_latency.as_secs_f64());

        if !verdict.defect_classes.is_empty() {
            let mut classes = match self.defect_classes.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            for class in &verdict.defect_classes {
                *classes.entry(class.clone()).or_default() += 1;
            }
        }
    }

    pub(crate) fn actuated(&self) {
        self.actuated.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("inspection_rollers_actuated_total").increment(1);
    }

    pub(crate) fn dropped(&self, reason: DropReason) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        match reason {
            DropReason::TimingViolation => {
                self.timing_violations.fetch_add(1, Ordering::Relaxed);
            }
            DropReason::LinkError => {
                self.link_errors.fetch_add(1, Ordering::Relaxed);
            }
            DropReason::Expired | DropReason::Shutdown => {}
        }
        let label = match reason {
            DropReason::TimingViolation => "timing_violation",
            DropReason::LinkError => "link_error",
            DropReason::Expired => "expired",
            DropReason::Shutdown => "shutdown",
        };
        metrics::counter!("inspection_rollers_dropped_total", "reason" => label).increment(1);
    }

    pub(crate) fn frame_queued(&self) {
        self.frames_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_lost(&self, failure: ViewFailure) {
        self.frames_lost.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("inspection_frames_lost_total", "cause" => failure.label()).increment(1);
    }

    pub(crate) fn frame_unassigned(&self) {
        self.frames_unassigned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_paused(&self) {
        self.frames_paused.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inference_failed(&self, failure: ViewFailure) {
        self.inference_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("inspection_inference_failures_total", "cause" => failure.label())
            .increment(1);
    }

    pub(crate) fn persistence_failed(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("inspection_persistence_failures_total").increment(1);
    }

    pub(crate) fn view_archived(&self) {
        self.views_archived.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn archive_failed(&self) {
        self.archive_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("inspection_archive_failures_total").increment(1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let defect_classes = match self.defect_classes.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        StatsSnapshot {
            rollers_entered: load(&self.rollers_entered),
            accepted: load(&self.accepted),
            rejected: load(&self.rejected),
            inconclusive: load(&self.inconclusive),
            degraded: load(&self.degraded),
            actuated: load(&self.actuated),
            dropped: load(&self.dropped),
            timing_violations: load(&self.timing_violations),
            link_errors: load(&self.link_errors),
            frames_queued: load(&self.frames_queued),
            frames_lost: load(&self.frames_lost),
            frames_unassigned: load(&self.frames_unassigned),
            frames_paused: load(&self.frames_paused),
            inference_failures: load(&self.inference_failures),
            persistence_failures: load(&self.persistence_failures),
            views_archived: load(&self.views_archived),
            archive_failures: load(&self.archive_failures),
            defect_classes,
        }
    }
}
