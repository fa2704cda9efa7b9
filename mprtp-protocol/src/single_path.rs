//! Single-path loss estimator
//!
//! Learns the inter-arrival interval of one packet stream and keeps a single
//! predictive timer armed for the next expected sequence number. Sequence
//! numbers skipped by a forward jump are declared lost immediately (gap
//! fill); the timer catches the tail of a burst and losses at the head of a
//! stall.

use crate::estimator::{
    future_deadline, Action, Arrival, Estimator, EstimatorDiagnostics, EstimatorEvent, TimerKey,
};
use crate::loss::{LossStatistics, LossStatisticsTracker, Reception};
use crate::predictor::{Predictor, PredictorConfig};
use crate::sequence::SeqNumber;
use crate::session::ConfigError;
use mprtp_io::Timestamp;
use std::time::Duration;

/// Default slack added to every predicted deadline
pub const DEFAULT_TIMEOUT_GUARD: Duration = Duration::from_millis(1);

/// Default number of consecutive timer losses before a full reset
pub const DEFAULT_MAX_CONSECUTIVE_LOSSES: u32 = 500;

/// Default largest forward jump treated as loss rather than discontinuity
pub const DEFAULT_MAX_GAP_FILL: u16 = 512;

/// Single-path estimator constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinglePathConfig {
    /// Slack added to predicted deadlines
    pub guard: Duration,
    /// Consecutive timer-declared losses that trigger a full reset
    pub max_consecutive_losses: u32,
    /// Forward jumps larger than this re-establish the baseline
    pub max_gap_fill: u16,
}

impl Default for SinglePathConfig {
    fn default() -> Self {
        SinglePathConfig {
            guard: DEFAULT_TIMEOUT_GUARD,
            max_consecutive_losses: DEFAULT_MAX_CONSECUTIVE_LOSSES,
            max_gap_fill: DEFAULT_MAX_GAP_FILL,
        }
    }
}

/// Single-path estimator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinglePathState {
    /// No baseline yet
    Idle,
    /// Baseline established, predictor still learning
    Predicting,
    /// Timer armed for the next expected sequence number
    TimerArmed,
    /// Expected sequence resolved, no timer armed
    Resolved,
}

impl SinglePathState {
    pub fn as_str(self) -> &'static str {
        match self {
            SinglePathState::Idle => "IDLE",
            SinglePathState::Predicting => "PREDICTING",
            SinglePathState::TimerArmed => "TIMER_ARMED",
            SinglePathState::Resolved => "RESOLVED",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingTimeout {
    seq: SeqNumber,
    /// Nominal expected arrival, without the guard
    due: Timestamp,
    deadline: Timestamp,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    predictions: u64,
    timeouts: u64,
    losses: u64,
    false_positives: u64,
    resets: u64,
    discontinuities: u64,
}

/// Predictive single-timer loss estimator
#[derive(Debug)]
pub struct SinglePathEstimator {
    config: SinglePathConfig,
    predictor: Box<dyn Predictor>,
    tracker: LossStatisticsTracker,
    state: SinglePathState,
    /// Newest sequence received
    max_seen: Option<SeqNumber>,
    /// Arrival time of `max_seen`
    last_arrival: Timestamp,
    pending: Option<PendingTimeout>,
    consecutive_losses: u32,
    counters: Counters,
    stopped: bool,
}

impl SinglePathEstimator {
    /// Create an estimator with the configured predictor
    pub fn new(predictor: &PredictorConfig, config: SinglePathConfig) -> Result<Self, ConfigError> {
        Ok(Self::with_predictor(predictor.build()?, config))
    }

    /// Create an estimator around an existing predictor
    pub fn with_predictor(predictor: Box<dyn Predictor>, config: SinglePathConfig) -> Self {
        SinglePathEstimator {
            config,
            predictor,
            tracker: LossStatisticsTracker::new(),
            state: SinglePathState::Idle,
            max_seen: None,
            last_arrival: Timestamp::ZERO,
            pending: None,
            consecutive_losses: 0,
            counters: Counters::default(),
            stopped: false,
        }
    }

    /// Current state
    pub fn state(&self) -> SinglePathState {
        self.state
    }

    /// Newest sequence number received
    pub fn max_seen(&self) -> Option<SeqNumber> {
        self.max_seen
    }

    /// Sequence number the timer is waiting for
    pub fn expected(&self) -> Option<SeqNumber> {
        self.pending.map(|p| p.seq)
    }

    /// Deadline of the armed timer
    pub fn deadline(&self) -> Option<Timestamp> {
        self.pending.map(|p| p.deadline)
    }

    /// The interval predictor
    pub fn predictor(&self) -> &dyn Predictor {
        self.predictor.as_ref()
    }

    /// Loss bookkeeping
    pub fn tracker(&self) -> &LossStatisticsTracker {
        &self.tracker
    }

    /// Timer-declared losses since the last arrival
    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses
    }

    fn set_state(&mut self, state: SinglePathState) {
        if self.state != state {
            tracing::trace!("single-path {} -> {}", self.state.as_str(), state.as_str());
            self.state = state;
        }
    }

    /// Arm the timer for `seq`, nominally due at `due`
    fn arm(&mut self, now: Timestamp, seq: SeqNumber, due: Timestamp, actions: &mut Vec<Action>) {
        let deadline = future_deadline(now, due + self.config.guard);
        if self.pending.is_some() {
            actions.push(Action::CancelTimer(TimerKey::Basic));
        }
        self.pending = Some(PendingTimeout { seq, due, deadline });
        actions.push(Action::ArmTimer {
            key: TimerKey::Basic,
            deadline,
        });
        self.set_state(SinglePathState::TimerArmed);
        tracing::trace!("expecting {} by {}", seq, deadline);
    }

    fn disarm(&mut self, actions: &mut Vec<Action>) {
        if self.pending.take().is_some() {
            actions.push(Action::CancelTimer(TimerKey::Basic));
        }
    }

    /// Arm for the sequence after `max_seen` from a fresh prediction
    fn arm_from_prediction(&mut self, now: Timestamp, actions: &mut Vec<Action>) {
        let Some(max) = self.max_seen else {
            return;
        };
        if !self.predictor.is_ready() {
            self.disarm(actions);
            self.set_state(SinglePathState::Predicting);
            return;
        }
        let due = self.last_arrival + self.predictor.last_prediction();
        self.counters.predictions += 1;
        self.arm(now, max.next(), due, actions);
    }

    fn declare_lost(&mut self, now: Timestamp, seq: SeqNumber, actions: &mut Vec<Action>) -> bool {
        if !self.tracker.assume_packet_lost(now, seq) {
            return false;
        }
        self.counters.losses += 1;
        actions.push(Action::Emit(EstimatorEvent::Lost { seq, flow: None }));
        tracing::debug!("assumed lost: {}", seq);
        true
    }

    fn full_reset(&mut self, actions: &mut Vec<Action>) {
        self.disarm(actions);
        self.predictor.reset();
        self.tracker.clear_history();
        self.max_seen = None;
        self.last_arrival = Timestamp::ZERO;
        self.consecutive_losses = 0;
        self.counters.resets += 1;
        self.set_state(SinglePathState::Idle);
    }
}

impl Estimator for SinglePathEstimator {
    fn on_packet_arrival(&mut self, now: Timestamp, arrival: &Arrival, actions: &mut Vec<Action>) {
        if self.stopped {
            return;
        }
        let seq = arrival.seq;

        match self.tracker.on_packet_received(now, seq) {
            Reception::FalsePositive { .. } => {
                self.counters.false_positives += 1;
                actions.push(Action::Emit(EstimatorEvent::FalsePositive {
                    seq,
                    flow: arrival.flow,
                }));
            }
            Reception::Duplicate | Reception::Stale => return,
            Reception::New | Reception::Recovered => {}
        }
        self.consecutive_losses = 0;

        match self.max_seen {
            None => {
                self.max_seen = Some(seq);
                self.last_arrival = now;
                self.set_state(SinglePathState::Predicting);
            }
            Some(max) if seq.is_newer(max) => {
                let gap = max.distance_to(seq) as u32;
                if gap > self.config.max_gap_fill as u32 {
                    tracing::warn!(
                        "sequence discontinuity {} -> {} (gap {}), re-establishing baseline",
                        max,
                        seq,
                        gap
                    );
                    self.counters.discontinuities += 1;
                    self.disarm(actions);
                } else {
                    let interval = now - self.last_arrival;
                    self.predictor.insert(interval / gap);
                    for missing in max.range_exclusive(seq) {
                        if !self.tracker.is_resolved(missing) {
                            self.declare_lost(now, missing, actions);
                        }
                    }
                }
                self.max_seen = Some(seq);
                self.last_arrival = now;
            }
            Some(_) => {
                tracing::trace!("reordered arrival {}", seq);
            }
        }

        let satisfied = match self.pending {
            None => true,
            Some(pending) => seq.is_newer_or_equal(pending.seq),
        };
        if satisfied {
            self.arm_from_prediction(now, actions);
        }
    }

    fn on_rtx_packet_arrival(&mut self, _now: Timestamp, arrival: &Arrival, _actions: &mut Vec<Action>) {
        if self.stopped {
            return;
        }
        if self.tracker.on_retransmission_received(arrival.seq) == Reception::Duplicate {
            tracing::debug!("duplicate retransmission of {}", arrival.seq);
        }
    }

    fn on_timeout(&mut self, now: Timestamp, key: TimerKey, actions: &mut Vec<Action>) {
        if self.stopped || key != TimerKey::Basic {
            return;
        }
        let Some(pending) = self.pending.take() else {
            return;
        };
        self.counters.timeouts += 1;

        if self.tracker.has_packet_been_received_recently(pending.seq) {
            // Arrival raced the expiry; it has already re-armed or will.
            self.set_state(SinglePathState::Resolved);
            self.arm_from_prediction(now, actions);
            return;
        }

        if self.declare_lost(now, pending.seq, actions) {
            self.consecutive_losses += 1;
        }

        if self.consecutive_losses >= self.config.max_consecutive_losses {
            tracing::warn!(
                "{} consecutive losses, resetting single-path estimator",
                self.consecutive_losses
            );
            self.full_reset(actions);
            return;
        }

        // No new samples since the last prediction: reuse it.
        let due = pending.due + self.predictor.last_prediction();
        self.arm(now, pending.seq.next(), due, actions);
    }

    fn reset(&mut self, actions: &mut Vec<Action>) {
        self.full_reset(actions);
        self.stopped = false;
    }

    fn stop(&mut self, actions: &mut Vec<Action>) {
        self.disarm(actions);
        self.stopped = true;
        self.set_state(SinglePathState::Idle);
    }

    fn diagnostics(&self) -> EstimatorDiagnostics {
        EstimatorDiagnostics {
            state: self.state.as_str(),
            prediction_error_std_dev: self.predictor.error_std_dev(),
            consecutive_losses: self.consecutive_losses,
            predictions: self.counters.predictions,
            timeouts: self.counters.timeouts,
            losses: self.counters.losses,
            false_positives: self.counters.false_positives,
            resets: self.counters.resets,
        }
    }

    fn loss_statistics(&self) -> LossStatistics {
        self.tracker.stats()
    }

    fn note_false_positive_removed(&mut self, seq: SeqNumber) {
        self.tracker.false_positive_removed_before_retransmission(seq);
    }

    fn log_statistics(&self) {
        self.tracker.log_statistics(self.name());
        tracing::info!(
            "{}: predictor={} error_std_dev={:.1}us predictions={} timeouts={} resets={} discontinuities={}",
            self.name(),
            self.predictor.name(),
            self.predictor.error_std_dev(),
            self.counters.predictions,
            self.counters.timeouts,
            self.counters.resets,
            self.counters.discontinuities
        );
    }

    fn name(&self) -> &'static str {
        "single-path"
    }
}
