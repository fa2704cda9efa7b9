//! Estimator capability
//!
//! Estimators never own a clock or a timer service. Every entry point takes
//! the current time and appends [`Action`]s to a caller-supplied buffer; the
//! event loop arms and cancels timers and delivers events accordingly. This
//! keeps the state machines deterministic under a virtual clock.

use crate::loss::LossStatistics;
use crate::sequence::SeqNumber;
use mprtp_io::Timestamp;
use std::fmt;
use std::time::Duration;

/// Smallest step between `now` and a deadline armed from an expiry handler
pub const MIN_TIMER_STEP: Duration = Duration::from_micros(1);

/// `deadline`, pushed strictly past `now`
///
/// A handler that re-arms from its own expiry must never produce a deadline
/// the event loop would treat as already due.
pub fn future_deadline(now: Timestamp, deadline: Timestamp) -> Timestamp {
    deadline.max(now + MIN_TIMER_STEP)
}

/// Identity of a timer owned by an estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Single-path predictive timer
    Basic,
    /// Cross-path timer for the next sequence on the fastest flow
    Short,
    /// Cross-path safety timer for one sequence past its short deadline
    Long(SeqNumber),
}

/// Position of a packet within its flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowPosition {
    /// Flow identifier
    pub flow: u16,
    /// Flow-local sequence number
    pub flow_seq: SeqNumber,
}

/// A received packet as seen by an estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arrival {
    /// Global sequence number
    pub seq: SeqNumber,
    /// Flow information, absent for single-path streams
    pub flow: Option<FlowPosition>,
}

impl Arrival {
    /// Arrival on a single-path stream
    pub fn new(seq: SeqNumber) -> Self {
        Arrival { seq, flow: None }
    }

    /// Arrival tagged with its flow
    pub fn on_flow(seq: SeqNumber, flow: u16, flow_seq: SeqNumber) -> Self {
        Arrival {
            seq,
            flow: Some(FlowPosition { flow, flow_seq }),
        }
    }

    /// Flow id, if known
    pub fn flow_id(&self) -> Option<u16> {
        self.flow.map(|f| f.flow)
    }
}

/// Loss signal produced by an estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorEvent {
    /// `seq` is assumed lost
    Lost {
        seq: SeqNumber,
        /// Flow the packet was expected on; `None` for path-independent losses
        flow: Option<FlowPosition>,
    },
    /// `seq` was assumed lost earlier and has now arrived
    FalsePositive {
        seq: SeqNumber,
        flow: Option<FlowPosition>,
    },
}

impl EstimatorEvent {
    /// Sequence number the event refers to
    pub fn seq(&self) -> SeqNumber {
        match *self {
            EstimatorEvent::Lost { seq, .. } | EstimatorEvent::FalsePositive { seq, .. } => seq,
        }
    }

    /// Whether this is a loss declaration
    pub fn is_lost(&self) -> bool {
        matches!(self, EstimatorEvent::Lost { .. })
    }
}

impl fmt::Display for EstimatorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (label, seq, flow) = match *self {
            EstimatorEvent::Lost { seq, flow } => ("Lost", seq, flow),
            EstimatorEvent::FalsePositive { seq, flow } => ("FalsePositive", seq, flow),
        };
        match flow {
            Some(pos) => write!(f, "{}({}, flow={}, fssn={})", label, seq, pos.flow, pos.flow_seq),
            None => write!(f, "{}({})", label, seq),
        }
    }
}

/// Side effect requested by an estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Arm `key` at `deadline`, replacing any live timer for `key`
    ArmTimer { key: TimerKey, deadline: Timestamp },
    /// Cancel the timer for `key`; harmless if it is not armed
    CancelTimer(TimerKey),
    /// Deliver an event to the registered handlers
    Emit(EstimatorEvent),
}

/// Telemetry snapshot of an estimator
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EstimatorDiagnostics {
    /// Current state name
    pub state: &'static str,
    /// Standard deviation of the main predictor's error, µs
    pub prediction_error_std_dev: f64,
    /// Timer-declared losses since the last arrival
    pub consecutive_losses: u32,
    /// Timers armed from a prediction
    pub predictions: u64,
    /// Timer expiries handled
    pub timeouts: u64,
    /// Lost events emitted
    pub losses: u64,
    /// FalsePositive events emitted
    pub false_positives: u64,
    /// Full resets, including circuit-breaker resets
    pub resets: u64,
}

/// Loss estimator driven by arrivals and timer expiries
pub trait Estimator: fmt::Debug + Send {
    /// Handle an original packet arrival
    fn on_packet_arrival(&mut self, now: Timestamp, arrival: &Arrival, actions: &mut Vec<Action>);

    /// Handle a retransmitted packet arrival
    ///
    /// Repairs resolve outstanding loss state but never feed the predictors.
    fn on_rtx_packet_arrival(
        &mut self,
        now: Timestamp,
        arrival: &Arrival,
        actions: &mut Vec<Action>,
    );

    /// Handle expiry of a timer this estimator armed
    ///
    /// Must tolerate keys that were cancelled after being queued.
    fn on_timeout(&mut self, now: Timestamp, key: TimerKey, actions: &mut Vec<Action>);

    /// A false positive for `seq` was withdrawn before a request was sent
    fn note_false_positive_removed(&mut self, _seq: SeqNumber) {}

    /// Discard history and cancel every timer
    fn reset(&mut self, actions: &mut Vec<Action>);

    /// Cancel every timer and ignore further input
    fn stop(&mut self, actions: &mut Vec<Action>);

    /// Telemetry snapshot
    fn diagnostics(&self) -> EstimatorDiagnostics;

    /// Loss bookkeeping counters
    fn loss_statistics(&self) -> LossStatistics;

    /// Log accumulated statistics at info level
    fn log_statistics(&self);

    /// Strategy name for logs
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_display() {
        let lost = EstimatorEvent::Lost {
            seq: SeqNumber::new(7),
            flow: None,
        };
        assert_eq!(lost.to_string(), "Lost(7)");
        assert!(lost.is_lost());

        let fp = EstimatorEvent::FalsePositive {
            seq: SeqNumber::new(8),
            flow: Some(FlowPosition {
                flow: 1,
                flow_seq: SeqNumber::new(4),
            }),
        };
        assert_eq!(fp.to_string(), "FalsePositive(8, flow=1, fssn=4)");
        assert_eq!(fp.seq(), SeqNumber::new(8));
    }

    #[test]
    fn test_future_deadline() {
        let now = Timestamp::from_millis(10);
        assert_eq!(future_deadline(now, Timestamp::from_millis(20)), Timestamp::from_millis(20));
        assert_eq!(future_deadline(now, now), Timestamp::from_micros(10_001));
        assert_eq!(future_deadline(now, Timestamp::ZERO), Timestamp::from_micros(10_001));
    }

    #[test]
    fn test_arrival_constructors() {
        let a = Arrival::on_flow(SeqNumber::new(3), 2, SeqNumber::new(1));
        assert_eq!(a.flow_id(), Some(2));
        assert_eq!(Arrival::new(SeqNumber::new(3)).flow_id(), None);
    }
}
