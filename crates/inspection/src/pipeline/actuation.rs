//! Turns verdicts into timed PLC commands.
//!
//! A roller reaches the actuator one transit budget after it entered the
//! inspection zone. The budget is `transit_distance / velocity` while the
//! line speed is known and a configured fallback otherwise. A command is
//! handed to the PLC `command_lead` before that instant; if the decision came
//! too late to honour the lead, the roller is dropped with a
//! [`TimingViolation`] instead of being actuated late. The PLC send itself is
//! bounded by `fire_at`, and an acknowledgement arriving after it is treated
//! as a violation too.

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use line_ingest::{LinePositionTracker, MIN_VELOCITY_MM_PER_SEC, RollerId};
use tracing::{debug, info, warn};

use crate::pipeline::{
    config::PassMode,
    data::{
        Action, ActuationCommand, AggregatorInput, DecidedRoller, Decision, DropReason,
        PipelineEvent, RollerOutcome, TimingViolation,
    },
    plc::PlcLink,
    roller::{RollerState, RollerTable},
    telemetry,
};

const IDLE_WAIT: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug)]
pub struct TransitTiming {
    pub transit_distance_mm: f64,
    pub fallback_transit: Duration,
    pub command_lead: Duration,
}

impl TransitTiming {
    /// Time from zone entry to the actuator at `velocity_mm_per_sec`. A
    /// stopped or unknown line uses the fallback.
    pub fn budget(&self, velocity_mm_per_sec: f64) -> Duration {
        if !(velocity_mm_per_sec >= MIN_VELOCITY_MM_PER_SEC && velocity_mm_per_sec.is_finite()) {
            return self.fallback_transit;
        }
        Duration::try_from_secs_f64(self.transit_distance_mm / velocity_mm_per_sec)
            .unwrap_or(self.fallback_transit)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ActuationPolicy {
    pub pass_mode: PassMode,
    pub inconclusive_action: Action,
}

impl ActuationPolicy {
    pub fn action_for(&self, decision: Decision) -> Action {
        match decision {
            Decision::Accept => Action::Pass,
            Decision::Reject => Action::Reject,
            Decision::Inconclusive => self.inconclusive_action,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ActuationPlan {
    Fire(ActuationCommand),
    /// Silent PASS: nothing to send.
    NoCommand(Action),
    Violation(TimingViolation),
}

pub fn plan_actuation(
    decided: &DecidedRoller,
    timing: &TransitTiming,
    policy: &ActuationPolicy,
    velocity_mm_per_sec: f64,
) -> ActuationPlan {
    let roller_id = decided.verdict.roller_id;
    let budget = timing.budget(velocity_mm_per_sec);
    let latency = decided
        .decided_at
        .saturating_duration_since(decided.created_at);

    if latency + timing.command_lead > budget {
        return ActuationPlan::Violation(TimingViolation {
            roller_id,
            latency,
            budget,
        });
    }

    let action = policy.action_for(decided.verdict.decision);
    if action == Action::Pass && policy.pass_mode == PassMode::Silent {
        return ActuationPlan::NoCommand(action);
    }

    ActuationPlan::Fire(ActuationCommand {
        roller_id,
        action,
        fire_at: decided.created_at + budget,
        fire_at_position_mm: decided.entry_position_mm + timing.transit_distance_mm,
    })
}

struct Pending {
    send_at: Instant,
    created_at: Instant,
    command: ActuationCommand,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.send_at
            .cmp(&other.send_at)
            .then(self.command.roller_id.cmp(&other.command.roller_id))
    }
}

pub(crate) struct ActuationScheduler {
    pub(crate) plc: Arc<dyn PlcLink>,
    pub(crate) timing: TransitTiming,
    pub(crate) policy: ActuationPolicy,
    pub(crate) plc_timeout: Duration,
    pub(crate) tracker: LinePositionTracker,
    pub(crate) table: Arc<RollerTable>,
    pub(crate) outcomes: Sender<AggregatorInput>,
    pub(crate) events: Sender<PipelineEvent>,
}

impl ActuationScheduler {
    pub(crate) fn spawn(self, rx: Receiver<DecidedRoller>) -> std::io::Result<thread::JoinHandle<()>> {
        telemetry::spawn_thread("inspection-actuation", move || self.run(rx))
    }

    fn run(self, rx: Receiver<DecidedRoller>) {
        let mut pending: BinaryHeap<Reverse<Pending>> = BinaryHeap::new();
        loop {
            let wait = pending
                .peek()
                .map(|Reverse(next)| next.send_at.saturating_duration_since(Instant::now()))
                .unwrap_or(IDLE_WAIT);
            match rx.recv_timeout(wait) {
                Ok(decided) => self.schedule(decided, &mut pending),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.dispatch_due(&mut pending, Instant::now());
        }
        for Reverse(left) in pending {
            debug!(roller = %left.command.roller_id, "discarding unsent command at shutdown");
        }
    }

    fn schedule(&self, decided: DecidedRoller, pending: &mut BinaryHeap<Reverse<Pending>>) {
        let roller_id = decided.verdict.roller_id;
        let velocity = self.tracker.velocity_mm_per_sec();
        match plan_actuation(&decided, &self.timing, &self.policy, velocity) {
            ActuationPlan::Fire(command) => {
                let send_at = command
                    .fire_at
                    .checked_sub(self.timing.command_lead)
                    .unwrap_or(command.fire_at);
                debug!(roller = %roller_id, action = ?command.action, "actuation scheduled");
                self.table
                    .with_entry(roller_id, |context| context.schedule_fire(command.fire_at));
                pending.push(Reverse(Pending {
                    send_at,
                    created_at: decided.created_at,
                    command,
                }));
            }
            ActuationPlan::NoCommand(action) => {
                self.report(
                    roller_id,
                    RollerOutcome::Actuated {
                        action,
                        command_sent: false,
                    },
                );
            }
            ActuationPlan::Violation(violation) => self.violate(violation),
        }
    }

    fn dispatch_due(&self, pending: &mut BinaryHeap<Reverse<Pending>>, now: Instant) {
        while pending
            .peek()
            .is_some_and(|Reverse(next)| next.send_at <= now)
        {
            let Some(Reverse(due)) = pending.pop() else {
                break;
            };
            let Pending {
                created_at,
                command,
                ..
            } = due;
            let roller_id = command.roller_id;
            if self.table.state_of(roller_id) != Some(RollerState::Decided) {
                debug!(roller = %roller_id, "roller no longer awaiting actuation; command discarded");
                continue;
            }
            let now = Instant::now();
            if now >= command.fire_at {
                self.violate(TimingViolation {
                    roller_id,
                    latency: now.saturating_duration_since(created_at),
                    budget: command.fire_at.saturating_duration_since(created_at),
                });
                continue;
            }
            let send_timeout = self.plc_timeout.min(command.fire_at - now);
            let result = tracing::info_span!("plc.send", roller = %roller_id)
                .in_scope(|| self.plc.send_actuation(&command, send_timeout));
            let acked_at = Instant::now();
            metrics::histogram!("inspection_plc_send_seconds")
                .record(acked_at.saturating_duration_since(now).as_secs_f64());
            match result {
                Ok(_) if acked_at >= command.fire_at => {
                    warn!(
                        roller = %roller_id,
                        late_ms = acked_at.saturating_duration_since(command.fire_at).as_millis() as u64,
                        "PLC acknowledged after the roller reached the actuator"
                    );
                    self.violate(TimingViolation {
                        roller_id,
                        latency: acked_at.saturating_duration_since(created_at),
                        budget: command.fire_at.saturating_duration_since(created_at),
                    });
                }
                Ok(ack) => {
                    info!(roller = %roller_id, action = ?command.action, "actuation acknowledged");
                    debug!(roller = %ack.roller_id, "ack received");
                    self.report(
                        roller_id,
                        RollerOutcome::Actuated {
                            action: command.action,
                            command_sent: true,
                        },
                    );
                }
                Err(err) => {
                    warn!(roller = %roller_id, "actuation failed: {err}");
                    let _ = self.events.send(PipelineEvent::LinkError {
                        roller_id: Some(roller_id),
                        error: err.to_string(),
                    });
                    self.report(
                        roller_id,
                        RollerOutcome::Dropped {
                            reason: DropReason::LinkError,
                        },
                    );
                }
            }
        }
    }

    fn violate(&self, violation: TimingViolation) {
        warn!("{violation}");
        let roller_id = violation.roller_id;
        let _ = self.events.send(PipelineEvent::TimingViolation(violation));
        self.report(
            roller_id,
            RollerOutcome::Dropped {
                reason: DropReason::TimingViolation,
            },
        );
    }

    fn report(&self, roller_id: RollerId, outcome: RollerOutcome) {
        if self
            .outcomes
            .send(AggregatorInput::Outcome { roller_id, outcome })
            .is_err()
        {
            debug!(roller = %roller_id, "aggregator gone; outcome not applied");
        }
    }
}
