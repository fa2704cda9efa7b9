//! Cross-path loss estimator
//!
//! Coordinates several concurrent flows carrying one global sequence space.
//! After ranking the flows by how early they deliver, it learns two models:
//!
//! - the **delta** model: arrival interval per global sequence step, seeded
//!   from every flow's window and then measured on the fastest flow
//! - the **cross** model: how much later than the fastest-flow projection a
//!   packet arrives on any other flow
//!
//! The short timer expects each global sequence number at its fastest-flow
//! projection. When it expires without the packet, a long timer keyed by that
//! sequence number adds the cross-path wait; once running, only the long
//! timer declares the packet lost.
//!
//! Until then no timers run, so losses are read off flow sequence numbers: a
//! flow that skips `n` of its own numbers where exactly `n` global sequences
//! are unaccounted for has lost those `n`.

use crate::flow::{ArrivalRecord, FlowStats, FlowTable, FlowUpdate, DEFAULT_FLOW_WINDOW};
use crate::state::{CrossPathState, Trigger};
use mprtp_io::Timestamp;
use mprtp_protocol::estimator::future_deadline;
use mprtp_protocol::{
    Action, Arrival, ConfigError, Estimator, EstimatorDiagnostics, EstimatorEvent, FlowPosition,
    LossStatistics, LossStatisticsTracker, Predictor, PredictorConfig, Reception, SeqNumber,
    TimerKey,
};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default records per flow required before ranking flows
pub const DEFAULT_MIN_FLOW_SAMPLES: usize = 3;

/// Default slack added to short and long deadlines
pub const DEFAULT_CROSS_PATH_GUARD: Duration = Duration::from_millis(1);

/// Default number of consecutive long-timer losses before a full reset
pub const DEFAULT_MAX_CONSECUTIVE_LOSSES: u32 = 500;

/// Default largest sequence step sampled or covered by safety timers
pub const DEFAULT_MAX_GAP: u16 = 512;

/// EWMA gain of the nominal per-sequence interval
const NOMINAL_DELTA_GAIN: f64 = 0.125;

/// Cross-path estimator constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossPathConfig {
    /// Arrival records kept per flow
    pub window: usize,
    /// Records every flow needs before flows are ranked
    pub min_flow_samples: usize,
    /// Slack added to short and long deadlines
    pub guard: Duration,
    /// Consecutive long-timer losses that trigger a full reset
    pub max_consecutive_losses: u32,
    /// Larger sequence steps are discontinuities
    pub max_gap: u16,
}

impl CrossPathConfig {
    /// Check the constants for consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window == 0 {
            return Err(ConfigError::Invalid("flow window must be positive".to_string()));
        }
        if self.min_flow_samples < 2 || self.min_flow_samples > self.window {
            return Err(ConfigError::Invalid(format!(
                "min_flow_samples must lie in 2..={}, got {}",
                self.window, self.min_flow_samples
            )));
        }
        if self.max_consecutive_losses == 0 {
            return Err(ConfigError::Invalid(
                "max_consecutive_losses must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for CrossPathConfig {
    fn default() -> Self {
        CrossPathConfig {
            window: DEFAULT_FLOW_WINDOW,
            min_flow_samples: DEFAULT_MIN_FLOW_SAMPLES,
            guard: DEFAULT_CROSS_PATH_GUARD,
            max_consecutive_losses: DEFAULT_MAX_CONSECUTIVE_LOSSES,
            max_gap: DEFAULT_MAX_GAP,
        }
    }
}

/// Most recent fastest-flow arrival; all projections start here
#[derive(Debug, Clone, Copy)]
struct Anchor {
    seq: SeqNumber,
    at: Timestamp,
}

#[derive(Debug, Clone, Copy)]
struct ShortTimer {
    expected: SeqNumber,
    deadline: Timestamp,
    /// Armed from an expiry rather than an arrival
    timer_driven: bool,
}

/// What an arrival contributed to the models
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observation {
    Delta,
    Cross,
    Stale,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    predictions: u64,
    short_timeouts: u64,
    long_timeouts: u64,
    losses: u64,
    false_positives: u64,
    resets: u64,
    resyncs: u64,
    regressions: u64,
    late_long_expiries: u64,
}

/// Cross-path telemetry
#[derive(Debug, Clone, PartialEq)]
pub struct CrossPathDiagnostics {
    /// Current state
    pub state: CrossPathState,
    /// Flow ids, fastest first; empty while learning the order
    pub flow_order: Vec<u16>,
    /// Current delta prediction, if ready
    pub delta_prediction: Option<Duration>,
    /// Current cross-path prediction, if ready
    pub cross_prediction: Option<Duration>,
    /// Long timers outstanding
    pub long_timers: usize,
    /// Arrivals that caught up with a timer-driven short timer
    pub resyncs: u64,
    /// Regressions to path-difference learning
    pub regressions: u64,
    /// Per-flow statistics
    pub flows: Vec<FlowStats>,
}

/// Dual-timer multipath loss estimator
#[derive(Debug)]
pub struct CrossPathEstimator {
    config: CrossPathConfig,
    delta: Box<dyn Predictor>,
    cross: Box<dyn Predictor>,
    tracker: LossStatisticsTracker,
    flows: FlowTable,
    state: CrossPathState,
    /// Flow ids, fastest first
    order: Vec<u16>,
    /// Smoothed per-sequence interval on the fastest flow, µs
    nominal_delta_us: f64,
    anchor: Option<Anchor>,
    /// Sequence expected on another flow while learning the path difference
    awaited: Option<SeqNumber>,
    short: Option<ShortTimer>,
    long: BTreeMap<SeqNumber, Timestamp>,
    max_seen: Option<SeqNumber>,
    consecutive_losses: u32,
    counters: Counters,
    stopped: bool,
}

impl CrossPathEstimator {
    /// Create an estimator whose delta and cross predictors use `predictor`
    pub fn new(predictor: &PredictorConfig, config: CrossPathConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_predictors(
            predictor.build()?,
            predictor.build()?,
            config,
        ))
    }

    /// Create an estimator around existing predictors
    pub fn with_predictors(
        delta: Box<dyn Predictor>,
        cross: Box<dyn Predictor>,
        config: CrossPathConfig,
    ) -> Self {
        CrossPathEstimator {
            config,
            delta,
            cross,
            tracker: LossStatisticsTracker::new(),
            flows: FlowTable::new(config.window),
            state: CrossPathState::LearnFlowOrder,
            order: Vec::new(),
            nominal_delta_us: 0.0,
            anchor: None,
            awaited: None,
            short: None,
            long: BTreeMap::new(),
            max_seen: None,
            consecutive_losses: 0,
            counters: Counters::default(),
            stopped: false,
        }
    }

    pub fn state(&self) -> CrossPathState {
        self.state
    }

    /// The fastest flow, once ranked
    pub fn fastest_flow(&self) -> Option<u16> {
        self.order.first().copied()
    }

    /// Flow ids, fastest first
    pub fn flow_order(&self) -> &[u16] {
        &self.order
    }

    pub fn flows(&self) -> &FlowTable {
        &self.flows
    }

    /// Sequence number the short timer is waiting for
    pub fn expected(&self) -> Option<SeqNumber> {
        self.short.map(|s| s.expected)
    }

    /// Deadline of the short timer
    pub fn short_deadline(&self) -> Option<Timestamp> {
        self.short.map(|s| s.deadline)
    }

    /// Whether a long timer is outstanding for `seq`
    pub fn has_long_timer(&self, seq: SeqNumber) -> bool {
        self.long.contains_key(&seq)
    }

    pub fn long_timer_count(&self) -> usize {
        self.long.len()
    }

    pub fn delta_predictor(&self) -> &dyn Predictor {
        self.delta.as_ref()
    }

    pub fn cross_predictor(&self) -> &dyn Predictor {
        self.cross.as_ref()
    }

    pub fn tracker(&self) -> &LossStatisticsTracker {
        &self.tracker
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses
    }

    /// Cross-path specific telemetry
    pub fn cross_diagnostics(&self) -> CrossPathDiagnostics {
        CrossPathDiagnostics {
            state: self.state,
            flow_order: self.order.clone(),
            delta_prediction: self
                .delta
                .is_ready()
                .then(|| self.delta.last_prediction()),
            cross_prediction: self
                .cross
                .is_ready()
                .then(|| self.cross.last_prediction()),
            long_timers: self.long.len(),
            resyncs: self.counters.resyncs,
            regressions: self.counters.regressions,
            flows: self.flows.stats(),
        }
    }

    fn advance(&mut self, trigger: Trigger) -> bool {
        match self.state.next(trigger) {
            Some(next) => {
                if trigger == Trigger::ReferenceLost {
                    self.counters.regressions += 1;
                }
                if next != self.state {
                    tracing::debug!("cross-path {} -> {} ({:?})", self.state, next, trigger);
                }
                self.state = next;
                true
            }
            None => {
                tracing::trace!("{:?} ignored in {}", trigger, self.state);
                false
            }
        }
    }

    /// Rank flows once every flow has enough samples
    fn learn_flow_order(&mut self) -> bool {
        if self.flows.len() < 2 || !self.flows.all_have_samples(self.config.min_flow_samples) {
            return false;
        }

        let deltas: Vec<f64> = self
            .flows
            .iter()
            .filter_map(|f| f.average_delta())
            .filter(|d| *d > 0.0)
            .collect();
        if deltas.len() != self.flows.len() {
            return false;
        }
        let average_delta = deltas.iter().sum::<f64>() / deltas.len() as f64;

        let reference = self
            .flows
            .iter()
            .filter_map(|f| f.oldest())
            .map(|r| r.seq)
            .reduce(|a, b| if b.is_older(a) { b } else { a });
        let Some(reference) = reference else {
            return false;
        };

        let mut ranked: Vec<(i64, Timestamp, u16)> = self
            .flows
            .iter()
            .filter_map(|f| {
                let virtual_time = f.virtual_time(reference, average_delta)?;
                Some((virtual_time.round() as i64, f.first_arrival(), f.id()))
            })
            .collect();
        ranked.sort();
        self.order = ranked.into_iter().map(|(_, _, id)| id).collect();
        self.nominal_delta_us = average_delta;

        tracing::info!(
            "flow order learned: {:?} (average delta {:.0}us)",
            self.order,
            average_delta
        );
        self.seed_predictors();
        true
    }

    /// Replay the windows collected while ranking into both predictors
    fn seed_predictors(&mut self) {
        let Some(fastest) = self.fastest_flow() else {
            return;
        };

        // Every flow steps through the same global sequence space.
        let mut samples = Vec::new();
        for flow in self.flows.iter() {
            let records: Vec<&ArrivalRecord> = flow.records().collect();
            for pair in records.windows(2) {
                let steps = pair[0].seq.distance_to(pair[1].seq);
                if steps > 0 && steps <= self.config.max_gap as i32 {
                    samples.push((pair[1].at - pair[0].at) / steps as u32);
                }
            }
        }
        for sample in samples {
            self.delta.insert(sample);
        }

        let records: Vec<ArrivalRecord> = match self.flows.get(fastest) {
            Some(flow) => flow.records().copied().collect(),
            None => return,
        };
        self.anchor = records
            .iter()
            .copied()
            .reduce(|a, b| if b.seq.is_newer(a.seq) { b } else { a })
            .map(|r| Anchor { seq: r.seq, at: r.at });

        let others: Vec<ArrivalRecord> = self
            .flows
            .iter()
            .filter(|f| f.id() != fastest)
            .flat_map(|f| f.records().copied())
            .collect();
        for record in others {
            if let Some(sample) = self.cross_sample(record.seq, record.at) {
                self.cross.insert(sample);
            }
        }
    }

    /// When `seq` would reach us over the fastest flow
    fn projected(&self, seq: SeqNumber) -> Option<Timestamp> {
        let anchor = self.anchor?;
        if self.nominal_delta_us <= 0.0 {
            return None;
        }
        let steps = anchor.seq.distance_to(seq) as f64;
        Some(anchor.at.offset_micros((steps * self.nominal_delta_us).round() as i64))
    }

    fn cross_sample(&self, seq: SeqNumber, at: Timestamp) -> Option<Duration> {
        Some(at - self.projected(seq)?)
    }

    /// Feed the models from an arrival; the flow order must be known
    fn observe(&mut self, now: Timestamp, seq: SeqNumber, flow: u16) -> Observation {
        if self.fastest_flow() != Some(flow) {
            return match self.cross_sample(seq, now) {
                Some(sample) => {
                    self.cross.insert(sample);
                    Observation::Cross
                }
                None => Observation::Stale,
            };
        }

        match self.anchor {
            Some(anchor) if !seq.is_newer(anchor.seq) => Observation::Stale,
            Some(anchor) => {
                let steps = anchor.seq.distance_to(seq);
                if steps <= self.config.max_gap as i32 {
                    let sample = (now - anchor.at) / steps as u32;
                    self.delta.insert(sample);
                    let x = sample.as_micros() as f64;
                    self.nominal_delta_us += NOMINAL_DELTA_GAIN * (x - self.nominal_delta_us);
                } else {
                    tracing::warn!(
                        "fastest flow jumped {} -> {}, re-anchoring without a sample",
                        anchor.seq,
                        seq
                    );
                }
                self.anchor = Some(Anchor { seq, at: now });
                Observation::Delta
            }
            None => {
                self.anchor = Some(Anchor { seq, at: now });
                Observation::Delta
            }
        }
    }

    /// Record `seq` on the fastest flow as the path-difference reference
    fn anchor_reference(&mut self, seq: SeqNumber) {
        if self.advance(Trigger::ReferenceAnchored) {
            self.awaited = Some(seq.next());
            tracing::debug!("reference {} on fastest flow, awaiting {}", seq, seq.next());
        }
    }

    fn await_alternate(&mut self, seq: SeqNumber, on_fastest: bool, update: FlowUpdate) {
        let Some(awaited) = self.awaited else {
            return;
        };
        if on_fastest {
            if update.flow_seq_gap > 0 {
                tracing::debug!(
                    "fastest flow lost {} packet(s) while learning, re-anchoring",
                    update.flow_seq_gap
                );
                self.awaited = None;
                self.advance(Trigger::ReferenceLost);
                self.anchor_reference(seq);
            } else if seq == awaited {
                // Carried by the fastest flow itself; move the reference up.
                self.awaited = Some(seq.next());
            }
        } else if seq == awaited {
            self.awaited = None;
            self.advance(Trigger::AlternateArrived);
        } else if seq.is_newer(awaited) {
            tracing::debug!("awaited {} overtaken by {}, re-anchoring", awaited, seq);
            self.awaited = None;
            self.advance(Trigger::ReferenceLost);
        }
    }

    /// Declare what a flow-local gap skipped while no timers run
    ///
    /// Only an unambiguous gap counts: the unresolved global sequences between
    /// the flow's previous arrival and this one must number exactly the flow
    /// sequences skipped.
    fn declare_flow_gap(
        &mut self,
        now: Timestamp,
        seq: SeqNumber,
        position: FlowPosition,
        update: FlowUpdate,
        actions: &mut Vec<Action>,
    ) {
        let Some(previous) = update.gap_after else {
            return;
        };
        if update.flow_seq_gap == 0 || previous.distance_to(seq) > self.config.max_gap as i32 {
            return;
        }

        let missing: Vec<SeqNumber> = previous
            .range_exclusive(seq)
            .filter(|s| !self.tracker.is_resolved(*s))
            .collect();
        if missing.len() != update.flow_seq_gap as usize {
            tracing::trace!(
                "flow {} skipped {} packet(s) among {} candidates before {}",
                position.flow,
                update.flow_seq_gap,
                missing.len(),
                seq
            );
            return;
        }

        let first = position.flow_seq - update.flow_seq_gap;
        for (i, missing) in missing.into_iter().enumerate() {
            if !self.tracker.assume_packet_lost(now, missing) {
                continue;
            }
            self.counters.losses += 1;
            let flow_seq = first + i as u16;
            actions.push(Action::Emit(EstimatorEvent::Lost {
                seq: missing,
                flow: Some(FlowPosition {
                    flow: position.flow,
                    flow_seq,
                }),
            }));
            tracing::debug!(
                "assumed lost: {} (flow {} skipped {}) in {}",
                missing,
                position.flow,
                flow_seq,
                self.state
            );
        }
    }

    fn arm_short(
        &mut self,
        now: Timestamp,
        expected: SeqNumber,
        timer_driven: bool,
        actions: &mut Vec<Action>,
    ) {
        let Some(anchor) = self.anchor else {
            return;
        };
        let steps = anchor.seq.distance_to(expected) as i64;
        let delta = self.delta.last_prediction().as_micros() as i64;
        let deadline = future_deadline(
            now,
            anchor.at.offset_micros(steps * delta) + self.config.guard,
        );

        if self.short.is_some() {
            actions.push(Action::CancelTimer(TimerKey::Short));
        }
        self.short = Some(ShortTimer {
            expected,
            deadline,
            timer_driven,
        });
        self.counters.predictions += 1;
        actions.push(Action::ArmTimer {
            key: TimerKey::Short,
            deadline,
        });
        tracing::trace!("short timer: expecting {} by {}", expected, deadline);
    }

    fn arm_long(&mut self, now: Timestamp, seq: SeqNumber, actions: &mut Vec<Action>) {
        let wait = self.cross.last_prediction() + self.config.guard;
        let deadline = future_deadline(now, now + wait);
        self.long.insert(seq, deadline);
        actions.push(Action::ArmTimer {
            key: TimerKey::Long(seq),
            deadline,
        });
        tracing::trace!("long timer: {} by {}", seq, deadline);
    }

    fn needs_long_timer(&self, seq: SeqNumber) -> bool {
        !self.tracker.is_resolved(seq) && !self.long.contains_key(&seq)
    }

    /// Move the short timer past an arrival that reached or passed it
    fn reconcile_short(&mut self, now: Timestamp, seq: SeqNumber, actions: &mut Vec<Action>) {
        let Some(short) = self.short else {
            return;
        };
        if !seq.is_newer_or_equal(short.expected) {
            return;
        }
        if short.timer_driven {
            self.counters.resyncs += 1;
        }

        // Sequences the short timer never reached still get a safety timer.
        let skipped = short.expected.distance_to(seq);
        if skipped > self.config.max_gap as i32 {
            tracing::warn!(
                "short timer skipped {} sequences ({} -> {}), not covering them",
                skipped,
                short.expected,
                seq
            );
        } else {
            for missing in short.expected.prev().range_exclusive(seq) {
                if self.needs_long_timer(missing) {
                    self.arm_long(now, missing, actions);
                }
            }
        }

        self.arm_short(now, seq.next(), false, actions);
    }

    fn on_short_timeout(&mut self, now: Timestamp, actions: &mut Vec<Action>) {
        let Some(short) = self.short.take() else {
            return;
        };
        self.counters.short_timeouts += 1;

        let expected = short.expected;
        if self.needs_long_timer(expected) {
            self.arm_long(now, expected, actions);
        }
        self.arm_short(now, expected.next(), true, actions);
    }

    fn on_long_timeout(&mut self, now: Timestamp, seq: SeqNumber, actions: &mut Vec<Action>) {
        if self.long.remove(&seq).is_none() {
            return;
        }
        self.counters.long_timeouts += 1;

        if self.tracker.has_packet_been_received_recently(seq) {
            self.counters.late_long_expiries += 1;
            tracing::info!("long timer for {} expired after the packet arrived", seq);
            return;
        }

        if self.tracker.assume_packet_lost(now, seq) {
            self.counters.losses += 1;
            self.consecutive_losses += 1;
            actions.push(Action::Emit(EstimatorEvent::Lost { seq, flow: None }));
            tracing::debug!("assumed lost: {}", seq);
        }

        if self.consecutive_losses >= self.config.max_consecutive_losses {
            tracing::warn!(
                "{} consecutive losses, resetting cross-path estimator",
                self.consecutive_losses
            );
            self.full_reset(actions);
        }
    }

    fn cancel_timers(&mut self, actions: &mut Vec<Action>) {
        if self.short.take().is_some() {
            actions.push(Action::CancelTimer(TimerKey::Short));
        }
        for seq in std::mem::take(&mut self.long).into_keys() {
            actions.push(Action::CancelTimer(TimerKey::Long(seq)));
        }
    }

    fn full_reset(&mut self, actions: &mut Vec<Action>) {
        self.cancel_timers(actions);
        self.delta.reset();
        self.cross.reset();
        self.tracker.clear_history();
        self.flows.clear();
        self.order.clear();
        self.nominal_delta_us = 0.0;
        self.anchor = None;
        self.awaited = None;
        self.max_seen = None;
        self.consecutive_losses = 0;
        self.counters.resets += 1;
        if self.state != CrossPathState::LearnFlowOrder {
            tracing::debug!("cross-path {} -> {} (reset)", self.state, CrossPathState::LearnFlowOrder);
        }
        self.state = CrossPathState::LearnFlowOrder;
    }
}

impl Estimator for CrossPathEstimator {
    fn on_packet_arrival(&mut self, now: Timestamp, arrival: &Arrival, actions: &mut Vec<Action>) {
        if self.stopped {
            return;
        }
        let seq = arrival.seq;
        let position = arrival.flow.unwrap_or(FlowPosition {
            flow: 0,
            flow_seq: seq,
        });

        match self.tracker.on_packet_received(now, seq) {
            Reception::FalsePositive { .. } => {
                self.counters.false_positives += 1;
                actions.push(Action::Emit(EstimatorEvent::FalsePositive {
                    seq,
                    flow: Some(position),
                }));
            }
            Reception::Duplicate | Reception::Stale => return,
            Reception::New | Reception::Recovered => {}
        }
        self.consecutive_losses = 0;
        if self.max_seen.map_or(true, |max| seq.is_newer(max)) {
            self.max_seen = Some(seq);
        }

        if self.long.remove(&seq).is_some() {
            actions.push(Action::CancelTimer(TimerKey::Long(seq)));
        }

        let update = self.flows.record(
            position.flow,
            ArrivalRecord {
                seq,
                flow_seq: position.flow_seq,
                at: now,
            },
        );
        if !self.state.is_running() {
            self.declare_flow_gap(now, seq, position, update, actions);
        }

        if self.state == CrossPathState::LearnFlowOrder {
            if self.learn_flow_order() {
                self.advance(Trigger::FlowOrderLearned);
                // The windows, this arrival included, seeded the models.
                if self.fastest_flow() == Some(position.flow) {
                    self.anchor_reference(seq);
                }
            }
            return;
        }

        let observation = self.observe(now, seq, position.flow);
        let on_fastest = self.fastest_flow() == Some(position.flow);

        match self.state {
            CrossPathState::LearnFlowOrder => {}
            CrossPathState::LearnPathDifference => {
                if on_fastest && observation == Observation::Delta {
                    self.anchor_reference(seq);
                }
            }
            CrossPathState::LearnAwaitingAlternate => {
                self.await_alternate(seq, on_fastest, update);
            }
            CrossPathState::EstAwaitingFastest => {
                if !on_fastest {
                    return;
                }
                if update.flow_seq_gap > 0 {
                    self.awaited = None;
                    self.advance(Trigger::ReferenceLost);
                    self.anchor_reference(seq);
                } else if self.delta.is_ready() && self.cross.is_ready() {
                    self.advance(Trigger::PredictorsReady);
                    let next = self.max_seen.unwrap_or(seq).next();
                    self.arm_short(now, next, false, actions);
                }
            }
            CrossPathState::EstRunningA | CrossPathState::EstRunningB => {
                match observation {
                    Observation::Delta => {
                        self.advance(Trigger::DeltaSample);
                    }
                    Observation::Cross => {
                        self.advance(Trigger::CrossSample);
                    }
                    Observation::Stale => {}
                }
                self.reconcile_short(now, seq, actions);
            }
        }
    }

    fn on_rtx_packet_arrival(&mut self, _now: Timestamp, arrival: &Arrival, actions: &mut Vec<Action>) {
        if self.stopped {
            return;
        }
        let seq = arrival.seq;
        if self.tracker.on_retransmission_received(seq) == Reception::Duplicate {
            tracing::debug!("duplicate retransmission of {}", seq);
        }
        if self.long.remove(&seq).is_some() {
            actions.push(Action::CancelTimer(TimerKey::Long(seq)));
        }
    }

    fn on_timeout(&mut self, now: Timestamp, key: TimerKey, actions: &mut Vec<Action>) {
        if self.stopped {
            return;
        }
        match key {
            TimerKey::Short => self.on_short_timeout(now, actions),
            TimerKey::Long(seq) => self.on_long_timeout(now, seq, actions),
            TimerKey::Basic => {}
        }
    }

    fn note_false_positive_removed(&mut self, seq: SeqNumber) {
        self.tracker.false_positive_removed_before_retransmission(seq);
    }

    fn reset(&mut self, actions: &mut Vec<Action>) {
        self.full_reset(actions);
        self.stopped = false;
    }

    fn stop(&mut self, actions: &mut Vec<Action>) {
        self.cancel_timers(actions);
        self.stopped = true;
    }

    fn diagnostics(&self) -> EstimatorDiagnostics {
        EstimatorDiagnostics {
            state: self.state.as_str(),
            prediction_error_std_dev: self.delta.error_std_dev(),
            consecutive_losses: self.consecutive_losses,
            predictions: self.counters.predictions,
            timeouts: self.counters.short_timeouts + self.counters.long_timeouts,
            losses: self.counters.losses,
            false_positives: self.counters.false_positives,
            resets: self.counters.resets,
        }
    }

    fn loss_statistics(&self) -> LossStatistics {
        self.tracker.stats()
    }

    fn log_statistics(&self) {
        self.tracker.log_statistics(self.name());
        tracing::info!(
            "{}: state={} order={:?} delta_error_std_dev={:.1}us cross_error_std_dev={:.1}us short_timeouts={} long_timeouts={} late_long={} resyncs={} regressions={} resets={}",
            self.name(),
            self.state,
            self.order,
            self.delta.error_std_dev(),
            self.cross.error_std_dev(),
            self.counters.short_timeouts,
            self.counters.long_timeouts,
            self.counters.late_long_expiries,
            self.counters.resyncs,
            self.counters.regressions,
            self.counters.resets
        );
        for flow in self.flows.iter() {
            let stats = flow.stats();
            tracing::info!(
                "{}: flow {} packets={} fssn_gaps={} reordered={}",
                self.name(),
                stats.flow_id,
                stats.packets,
                stats.flow_seq_gaps,
                stats.reordered
            );
        }
    }

    fn name(&self) -> &'static str {
        "cross-path"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mprtp_io::TimerQueue;

    /// Virtual event loop around one estimator
    struct Harness {
        est: CrossPathEstimator,
        timers: TimerQueue<TimerKey>,
        events: Vec<(Timestamp, EstimatorEvent)>,
        now: Timestamp,
    }

    impl Harness {
        fn new(est: CrossPathEstimator) -> Self {
            Harness {
                est,
                timers: TimerQueue::new(),
                events: Vec::new(),
                now: Timestamp::ZERO,
            }
        }

        fn apply(&mut self, actions: Vec<Action>) {
            for action in actions {
                match action {
                    Action::ArmTimer { key, deadline } => {
                        self.timers.arm(key, deadline);
                    }
                    Action::CancelTimer(key) => {
                        self.timers.cancel(&key);
                    }
                    Action::Emit(event) => self.events.push((self.now, event)),
                }
            }
        }

        fn advance(&mut self, until: Timestamp) {
            while let Some((key, deadline)) = self.timers.pop_expired(until) {
                self.now = deadline;
                let mut actions = Vec::new();
                self.est.on_timeout(deadline, key, &mut actions);
                self.apply(actions);
            }
            self.now = until;
        }

        fn arrive(&mut self, at: Timestamp, seq: u16, flow: u16, flow_seq: u16) {
            self.advance(at);
            let mut actions = Vec::new();
            let arrival = Arrival::on_flow(SeqNumber::new(seq), flow, SeqNumber::new(flow_seq));
            self.est.on_packet_arrival(at, &arrival, &mut actions);
            self.apply(actions);
        }

        fn lost(&self) -> Vec<u16> {
            self.events
                .iter()
                .filter(|(_, e)| e.is_lost())
                .map(|(_, e)| e.seq().as_raw())
                .collect()
        }
    }

    fn quick_config() -> (PredictorConfig, CrossPathConfig) {
        let predictor = PredictorConfig {
            bias_samples: 2,
            ..PredictorConfig::default()
        };
        let config = CrossPathConfig {
            min_flow_samples: 2,
            ..CrossPathConfig::default()
        };
        (predictor, config)
    }

    /// Even sequences on flow 0 every 20ms, odd ones on flow 1 offset by
    /// 10ms plus `slow_delay_ms`
    fn feed(h: &mut Harness, range: std::ops::Range<u16>, slow_delay_ms: u64, skip: &[u16]) {
        for seq in range {
            if skip.contains(&seq) {
                continue;
            }
            let flow = seq % 2;
            let at = seq as u64 * 10 + if flow == 1 { slow_delay_ms } else { 0 };
            h.arrive(Timestamp::from_millis(at), seq, flow, seq / 2);
        }
    }

    #[test]
    fn test_learns_order_and_runs() {
        let est = CrossPathEstimator::new(&PredictorConfig::default(), CrossPathConfig::default())
            .unwrap();
        let mut h = Harness::new(est);
        feed(&mut h, 0..12, 0, &[]);

        assert!(h.est.state().is_running());
        assert_eq!(h.est.fastest_flow(), Some(0));
        assert_eq!(h.est.flow_order(), &[0, 1]);
        assert!(h.lost().is_empty());
        assert_eq!(h.timers.len(), 1);
        assert!(h.timers.is_armed(&TimerKey::Short));
    }

    #[test]
    fn test_slower_flow_first_in_id_order() {
        // Flow 0 carries odd sequences and is 6ms late: flow 1 is fastest
        let est = CrossPathEstimator::new(&PredictorConfig::default(), CrossPathConfig::default())
            .unwrap();
        let mut h = Harness::new(est);
        for seq in 0..16u16 {
            let flow = if seq % 2 == 1 { 0 } else { 1 };
            let at = seq as u64 * 10 + if flow == 0 { 6 } else { 0 };
            h.arrive(Timestamp::from_millis(at), seq, flow, seq / 2);
        }
        assert_eq!(h.est.fastest_flow(), Some(1));
        assert!(h.est.state().is_running());
    }

    #[test]
    fn test_loss_on_slow_flow_reported_by_long_timer() {
        let (predictor, config) = quick_config();
        let mut h = Harness::new(CrossPathEstimator::new(&predictor, config).unwrap());
        feed(&mut h, 0..7, 0, &[]);
        assert!(h.est.state().is_running());
        assert_eq!(h.est.expected(), Some(SeqNumber::new(7)));

        feed(&mut h, 7..20, 0, &[7]);
        assert_eq!(h.lost(), vec![7]);

        // Reported by the long timer shortly after it was due at 70ms
        let (at, event) = h.events[0];
        assert_eq!(event, EstimatorEvent::Lost { seq: SeqNumber::new(7), flow: None });
        assert!(at > Timestamp::from_millis(70));
        assert!(at <= Timestamp::from_millis(75));
    }

    #[test]
    fn test_late_slow_arrival_cancels_long_timer() {
        let (predictor, config) = quick_config();
        let mut h = Harness::new(CrossPathEstimator::new(&predictor, config).unwrap());
        feed(&mut h, 0..20, 4, &[]);
        assert!(h.est.state().is_running());
        assert!(h.lost().is_empty());
        assert_eq!(h.est.long_timer_count(), 0);
        assert!(h.est.cross_diagnostics().resyncs > 0);
    }

    #[test]
    fn test_no_duplicate_losses() {
        let (predictor, config) = quick_config();
        let mut h = Harness::new(CrossPathEstimator::new(&predictor, config).unwrap());
        feed(&mut h, 0..40, 3, &[13, 14, 15, 27]);
        let lost = h.lost();
        assert_eq!(lost, vec![13, 14, 15, 27]);
    }

    #[test]
    fn test_false_positive_for_very_late_packet() {
        let (predictor, config) = quick_config();
        let mut h = Harness::new(CrossPathEstimator::new(&predictor, config).unwrap());
        feed(&mut h, 0..12, 0, &[9]);
        assert_eq!(h.lost(), vec![9]);

        h.arrive(Timestamp::from_millis(125), 9, 1, 4);
        assert!(h.events.iter().any(|(_, e)| matches!(
            e,
            EstimatorEvent::FalsePositive { seq, .. } if seq.as_raw() == 9
        )));
        assert_eq!(h.est.diagnostics().false_positives, 1);
    }

    #[test]
    fn test_flow_gap_declared_while_learning() {
        let est = CrossPathEstimator::new(&PredictorConfig::default(), CrossPathConfig::default())
            .unwrap();
        let mut h = Harness::new(est);
        feed(&mut h, 0..9, 0, &[7]);
        assert_eq!(h.est.state(), CrossPathState::LearnAwaitingAlternate);
        assert!(h.lost().is_empty());

        // 9 is flow 1's next packet after 5; 7 is the only sequence unaccounted for
        feed(&mut h, 9..20, 0, &[]);
        assert_eq!(h.lost(), vec![7]);
        assert_eq!(
            h.events[0],
            (
                Timestamp::from_millis(90),
                EstimatorEvent::Lost {
                    seq: SeqNumber::new(7),
                    flow: Some(FlowPosition {
                        flow: 1,
                        flow_seq: SeqNumber::new(3),
                    }),
                }
            )
        );
        assert!(h.est.state().is_running());
        assert!(!h.est.has_long_timer(SeqNumber::new(7)));
        assert_eq!(h.est.diagnostics().losses, 1);

        // Arriving after all is a false positive, not a second loss
        h.arrive(Timestamp::from_millis(195), 7, 1, 3);
        assert_eq!(h.lost(), vec![7]);
        assert_eq!(h.est.diagnostics().false_positives, 1);
    }

    #[test]
    fn test_fastest_flow_loss_regresses_while_learning() {
        let (predictor, config) = quick_config();
        let mut h = Harness::new(CrossPathEstimator::new(&predictor, config).unwrap());
        feed(&mut h, 0..5, 0, &[]);
        assert_eq!(h.est.state(), CrossPathState::LearnAwaitingAlternate);

        // Flow 0 skips fssn 3 (seq 6) before seq 5 shows up
        h.arrive(Timestamp::from_millis(80), 8, 0, 4);
        assert_eq!(h.est.state(), CrossPathState::LearnAwaitingAlternate);
        assert_eq!(h.est.cross_diagnostics().regressions, 1);
        // 5, 6 and 7 are all missing, so the one skipped flow packet is ambiguous
        assert!(h.lost().is_empty());
    }

    #[test]
    fn test_awaited_overtaken_regresses() {
        let (predictor, config) = quick_config();
        let mut h = Harness::new(CrossPathEstimator::new(&predictor, config).unwrap());
        feed(&mut h, 0..5, 0, &[]);
        assert_eq!(h.est.state(), CrossPathState::LearnAwaitingAlternate);

        // Awaited 5 never comes; 7 arrives on the slow flow instead
        h.arrive(Timestamp::from_millis(70), 7, 1, 3);
        assert_eq!(h.est.state(), CrossPathState::LearnPathDifference);

        h.arrive(Timestamp::from_millis(80), 8, 0, 4);
        assert_eq!(h.est.state(), CrossPathState::LearnAwaitingAlternate);
    }

    #[test]
    fn test_single_flow_never_leaves_learning() {
        let est = CrossPathEstimator::new(&PredictorConfig::default(), CrossPathConfig::default())
            .unwrap();
        let mut h = Harness::new(est);
        for seq in 0..50u16 {
            let mut actions = Vec::new();
            let at = Timestamp::from_millis(seq as u64 * 10);
            h.est.on_packet_arrival(at, &Arrival::new(SeqNumber::new(seq)), &mut actions);
            assert!(actions.is_empty());
        }
        assert_eq!(h.est.state(), CrossPathState::LearnFlowOrder);
        assert_eq!(h.est.flows().len(), 1);
    }

    #[test]
    fn test_reset_cancels_all_timers() {
        let (predictor, config) = quick_config();
        let mut h = Harness::new(CrossPathEstimator::new(&predictor, config).unwrap());
        feed(&mut h, 0..7, 0, &[]);
        // Let the short timer for 7 expire so a long timer exists
        h.advance(Timestamp::from_micros(71_500));
        assert!(h.est.has_long_timer(SeqNumber::new(7)));

        let mut actions = Vec::new();
        h.est.reset(&mut actions);
        h.apply(actions);
        assert!(h.timers.is_empty());
        assert_eq!(h.est.state(), CrossPathState::LearnFlowOrder);
        assert!(h.est.flow_order().is_empty());
    }

    #[test]
    fn test_consecutive_loss_ceiling() {
        let (predictor, mut config) = quick_config();
        config.max_consecutive_losses = 4;
        let mut h = Harness::new(CrossPathEstimator::new(&predictor, config).unwrap());
        feed(&mut h, 0..7, 0, &[]);

        // Both flows stall
        h.advance(Timestamp::from_millis(500));
        assert_eq!(h.lost(), vec![7, 8, 9, 10]);
        assert_eq!(h.est.state(), CrossPathState::LearnFlowOrder);
        assert!(h.timers.is_empty());
        assert_eq!(h.est.diagnostics().resets, 1);
    }

    #[test]
    fn test_config_validation() {
        let config = CrossPathConfig {
            min_flow_samples: 1,
            ..CrossPathConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(CrossPathConfig::default().validate().is_ok());
    }
}
