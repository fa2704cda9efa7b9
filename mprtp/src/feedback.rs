//! Receiver feedback bookkeeping
//!
//! The [`FeedbackManager`] picks a feedback mode from the negotiated session
//! capabilities and turns estimator events into the lists an RTCP reporter
//! drains once per reporting interval:
//!
//! - NACK mode: `Lost` events add to the assumed-lost list, `FalsePositive`
//!   events withdraw entries that have not been drained yet.
//! - ACK mode: every arrival is appended to the received list.
//!
//! Retransmission requests are recorded so that repaired packets can be
//! classified as recovered, late, duplicate or unrequested.

use crate::any::AnyEstimator;
use crate::driver::EstimatorDriver;
use crossbeam::channel::{self, Receiver, Sender};
use mprtp_io::Timestamp;
use mprtp_protocol::{
    Arrival, ConfigError, Estimator, EstimatorDiagnostics, EstimatorEvent, EstimatorKind,
    FeedbackMode, SeqNumber, SessionCapabilities,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Capacity of the comparison telemetry channel
pub const COMPARISON_CHANNEL_CAPACITY: usize = 1024;

/// Upper bound on remembered retransmission requests
pub const MAX_OUTSTANDING_REQUESTS: usize = 2048;

/// Requests older than this many late budgets are forgotten
const REQUEST_HORIZON_FACTOR: u32 = 4;

/// Feedback errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedbackError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Feedback manager is shut down")]
    ShutDown,

    #[error("Operation requires {expected:?} feedback, session uses {actual:?}")]
    WrongMode {
        expected: FeedbackMode,
        actual: FeedbackMode,
    },
}

/// Classification of a retransmitted packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtxOutcome {
    /// First repair of a requested packet within the late budget
    Recovered { latency: Duration },
    /// First repair of a requested packet past the late budget
    Late { latency: Duration },
    /// Repeat repair of an already answered request
    Duplicate,
    /// Repair for a sequence number never requested (or long forgotten)
    Unrequested,
}

/// Lists awaiting the next feedback report
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingFeedback {
    lost: Vec<SeqNumber>,
    received: Vec<SeqNumber>,
}

impl PendingFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `seq` for a NACK; false if already queued
    pub fn add_lost(&mut self, seq: SeqNumber) -> bool {
        if self.lost.contains(&seq) {
            return false;
        }
        self.lost.push(seq);
        true
    }

    /// Withdraw `seq` from the NACK queue; false if it was not queued
    pub fn remove_lost(&mut self, seq: SeqNumber) -> bool {
        match self.lost.iter().position(|s| *s == seq) {
            Some(idx) => {
                self.lost.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn add_received(&mut self, seq: SeqNumber) {
        self.received.push(seq);
    }

    pub fn lost(&self) -> &[SeqNumber] {
        &self.lost
    }

    pub fn received(&self) -> &[SeqNumber] {
        &self.received
    }

    /// Drain the NACK queue
    pub fn take_lost(&mut self) -> Vec<SeqNumber> {
        std::mem::take(&mut self.lost)
    }

    /// Drain the ACK queue
    pub fn take_received(&mut self) -> Vec<SeqNumber> {
        std::mem::take(&mut self.received)
    }

    pub fn is_empty(&self) -> bool {
        self.lost.is_empty() && self.received.is_empty()
    }

    pub fn clear(&mut self) {
        self.lost.clear();
        self.received.clear();
    }
}

/// Shared view of the pending lists
///
/// Cloneable and `Send`, so a reporter on another thread can drain the
/// lists while the event loop keeps filling them.
#[derive(Debug, Clone)]
pub struct FeedbackHandle {
    pending: Arc<Mutex<PendingFeedback>>,
}

impl FeedbackHandle {
    /// Drain the sequence numbers to NACK
    pub fn get_assumed_lost(&self) -> Vec<SeqNumber> {
        self.pending.lock().take_lost()
    }

    /// Drain the sequence numbers to ACK
    pub fn get_received(&self) -> Vec<SeqNumber> {
        self.pending.lock().take_received()
    }

    /// Number of queued NACK entries
    pub fn pending_lost(&self) -> usize {
        self.pending.lock().lost().len()
    }

    /// Copy of the current lists
    pub fn snapshot(&self) -> PendingFeedback {
        self.pending.lock().clone()
    }
}

/// Feedback counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedbackStats {
    /// Original packets delivered
    pub packets: u64,
    /// Retransmitted packets delivered
    pub rtx_packets: u64,
    /// Sequence numbers queued for NACK
    pub losses_reported: u64,
    /// FalsePositive events from the primary estimator
    pub false_positives: u64,
    /// False positives withdrawn before the NACK was drained
    pub false_positives_withdrawn: u64,
    /// False positives whose NACK had already been drained
    pub already_sent: u64,
    /// Retransmission requests recorded
    pub rtx_requested: u64,
    pub rtx_recovered: u64,
    pub rtx_late: u64,
    pub rtx_duplicate: u64,
    pub rtx_unrequested: u64,
    /// Sum of request-to-repair latencies, µs
    pub rtx_latency_total_us: u64,
    /// Events produced by the comparison estimator
    pub comparison_events: u64,
    /// Comparison events dropped on a full channel
    pub comparison_dropped: u64,
}

impl FeedbackStats {
    /// Mean request-to-repair latency over recovered and late repairs
    pub fn mean_rtx_latency(&self) -> Duration {
        let answered = self.rtx_recovered + self.rtx_late;
        if answered == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.rtx_latency_total_us / answered)
    }
}

/// Event from the comparison estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComparisonEvent {
    /// When the event was produced
    pub at: Timestamp,
    /// Strategy that produced it
    pub estimator: EstimatorKind,
    pub event: EstimatorEvent,
}

#[derive(Debug, Clone, Copy)]
struct RtxRequest {
    requested_at: Timestamp,
    flow: Option<u16>,
    answered: bool,
}

/// Feedback manager for one media stream
#[derive(Debug)]
pub struct FeedbackManager {
    mode: FeedbackMode,
    primary: Option<EstimatorDriver>,
    comparison: Option<EstimatorDriver>,
    pending: Arc<Mutex<PendingFeedback>>,
    requests: HashMap<SeqNumber, RtxRequest>,
    rtx_late_after: Duration,
    comparison_rx: Receiver<ComparisonEvent>,
    comparison_dropped: Arc<AtomicU64>,
    stats: FeedbackStats,
    shut_down: bool,
}

impl FeedbackManager {
    /// Select the feedback mode and build the estimators it needs
    pub fn new(caps: &SessionCapabilities) -> Result<Self, FeedbackError> {
        caps.validate()?;
        let (primary, comparison) = if caps.feedback_mode() == FeedbackMode::Nack {
            let primary = AnyEstimator::build(caps.primary, &caps.predictor)?;
            let comparison = caps
                .comparison
                .map(|kind| AnyEstimator::build(kind, &caps.predictor))
                .transpose()?;
            (Some(primary), comparison)
        } else {
            (None, None)
        };
        Self::with_estimators(caps, primary, comparison)
    }

    /// Use prebuilt estimators
    ///
    /// Estimators are ignored unless the capabilities select NACK mode.
    pub fn with_estimators(
        caps: &SessionCapabilities,
        primary: Option<AnyEstimator>,
        comparison: Option<AnyEstimator>,
    ) -> Result<Self, FeedbackError> {
        caps.validate()?;
        let mode = caps.feedback_mode();
        let (tx, comparison_rx) = channel::bounded(COMPARISON_CHANNEL_CAPACITY);
        let comparison_dropped = Arc::new(AtomicU64::new(0));

        let (primary, comparison) = if mode == FeedbackMode::Nack {
            let primary = match primary {
                Some(estimator) => estimator,
                None => AnyEstimator::build(caps.primary, &caps.predictor)?,
            };
            let comparison = comparison.map(|estimator| {
                let mut driver = EstimatorDriver::new(estimator);
                let kind = driver.estimator().kind();
                driver.set_lost_handler(forward_to(tx.clone(), kind, Arc::clone(&comparison_dropped)));
                driver.set_false_positive_handler(forward_to(
                    tx.clone(),
                    kind,
                    Arc::clone(&comparison_dropped),
                ));
                driver
            });
            (Some(EstimatorDriver::new(primary)), comparison)
        } else {
            (None, None)
        };

        tracing::info!(
            "Feedback mode {:?}: primary={} comparison={}",
            mode,
            primary
                .as_ref()
                .map(|d| d.estimator().name())
                .unwrap_or("none"),
            comparison
                .as_ref()
                .map(|d| d.estimator().name())
                .unwrap_or("none")
        );

        Ok(FeedbackManager {
            mode,
            primary,
            comparison,
            pending: Arc::new(Mutex::new(PendingFeedback::new())),
            requests: HashMap::new(),
            rtx_late_after: caps.rtx_late_after,
            comparison_rx,
            comparison_dropped,
            stats: FeedbackStats::default(),
            shut_down: false,
        })
    }

    /// Deliver an original packet arrival
    ///
    /// Returns the primary estimator's events, including any produced by
    /// timers that fell due before `now`.
    pub fn on_packet_arrival(
        &mut self,
        now: Timestamp,
        arrival: &Arrival,
    ) -> Result<Vec<EstimatorEvent>, FeedbackError> {
        self.ensure_running()?;
        self.stats.packets += 1;

        match self.mode {
            FeedbackMode::Ack => {
                self.pending.lock().add_received(arrival.seq);
                Ok(Vec::new())
            }
            FeedbackMode::Nack => {
                let events = match self.primary.as_mut() {
                    Some(driver) => driver.on_packet_arrival(now, arrival),
                    None => Vec::new(),
                };
                self.handle_events(&events);
                if let Some(driver) = self.comparison.as_mut() {
                    let extra = driver.on_packet_arrival(now, arrival);
                    self.stats.comparison_events += extra.len() as u64;
                }
                Ok(events)
            }
            FeedbackMode::None => Ok(Vec::new()),
        }
    }

    /// Deliver a retransmitted packet and classify it
    pub fn on_rtx_packet_arrival(
        &mut self,
        now: Timestamp,
        arrival: &Arrival,
    ) -> Result<RtxOutcome, FeedbackError> {
        self.ensure_running()?;
        self.ensure_mode(FeedbackMode::Nack)?;
        self.stats.rtx_packets += 1;

        let events = match self.primary.as_mut() {
            Some(driver) => driver.on_rtx_packet_arrival(now, arrival),
            None => Vec::new(),
        };
        self.handle_events(&events);
        if let Some(driver) = self.comparison.as_mut() {
            let extra = driver.on_rtx_packet_arrival(now, arrival);
            self.stats.comparison_events += extra.len() as u64;
        }

        let outcome = self.reconcile(now, arrival.seq);
        match outcome {
            RtxOutcome::Recovered { latency } => {
                self.stats.rtx_recovered += 1;
                self.stats.rtx_latency_total_us += latency.as_micros() as u64;
            }
            RtxOutcome::Late { latency } => {
                self.stats.rtx_late += 1;
                self.stats.rtx_latency_total_us += latency.as_micros() as u64;
                tracing::debug!("Late retransmission of {} after {:?}", arrival.seq, latency);
            }
            RtxOutcome::Duplicate => {
                self.stats.rtx_duplicate += 1;
                tracing::debug!("Duplicate retransmission of {}", arrival.seq);
            }
            RtxOutcome::Unrequested => {
                self.stats.rtx_unrequested += 1;
                tracing::debug!("Unrequested retransmission of {}", arrival.seq);
            }
        }
        Ok(outcome)
    }

    /// Record that a retransmission of `seq` was requested at `now`
    ///
    /// A repeated request for an unanswered sequence keeps the first
    /// request time.
    pub fn on_rtx_requested(
        &mut self,
        now: Timestamp,
        seq: SeqNumber,
        flow: Option<u16>,
    ) -> Result<(), FeedbackError> {
        self.ensure_running()?;
        self.ensure_mode(FeedbackMode::Nack)?;
        self.prune_requests(now);
        self.stats.rtx_requested += 1;

        let request = self.requests.entry(seq).or_insert(RtxRequest {
            requested_at: now,
            flow,
            answered: false,
        });
        if request.answered {
            *request = RtxRequest {
                requested_at: now,
                flow,
                answered: false,
            };
        }
        tracing::trace!("Retransmission of {} requested (flow {:?})", seq, request.flow);
        Ok(())
    }

    /// Drain the sequence numbers to NACK
    pub fn get_assumed_lost(&self) -> Vec<SeqNumber> {
        self.pending.lock().take_lost()
    }

    /// Drain the sequence numbers to ACK
    pub fn get_received(&self) -> Vec<SeqNumber> {
        self.pending.lock().take_received()
    }

    /// Fire estimator timers due at or before `now`
    ///
    /// Returns the primary estimator's events.
    pub fn poll_timers(&mut self, now: Timestamp) -> Vec<EstimatorEvent> {
        if self.shut_down {
            return Vec::new();
        }
        let events = match self.primary.as_mut() {
            Some(driver) => driver.poll_timers(now),
            None => Vec::new(),
        };
        self.handle_events(&events);
        if let Some(driver) = self.comparison.as_mut() {
            let extra = driver.poll_timers(now);
            self.stats.comparison_events += extra.len() as u64;
        }
        events
    }

    /// Earliest timer deadline across the estimators
    pub fn next_deadline(&self) -> Option<Timestamp> {
        [self.primary.as_ref(), self.comparison.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(|d| d.next_deadline())
            .min()
    }

    /// Stop the estimators and log final statistics
    ///
    /// Calling it again has no effect.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        for driver in [self.primary.as_mut(), self.comparison.as_mut()]
            .into_iter()
            .flatten()
        {
            driver.stop();
            driver.estimator().log_statistics();
        }
        let stats = self.stats();
        tracing::info!(
            "Feedback shut down: packets={} rtx={} nacked={} false_positives={} withdrawn={} already_sent={}",
            stats.packets,
            stats.rtx_packets,
            stats.losses_reported,
            stats.false_positives,
            stats.false_positives_withdrawn,
            stats.already_sent
        );
    }

    /// Reset the estimators, drop pending feedback and outstanding requests
    ///
    /// Clears a previous shutdown; counters are kept.
    pub fn reset(&mut self) {
        for driver in [self.primary.as_mut(), self.comparison.as_mut()]
            .into_iter()
            .flatten()
        {
            driver.reset();
        }
        self.pending.lock().clear();
        self.requests.clear();
        self.shut_down = false;
        tracing::debug!("Feedback manager reset");
    }

    /// Shared handle to the pending lists
    pub fn feedback_handle(&self) -> FeedbackHandle {
        FeedbackHandle {
            pending: Arc::clone(&self.pending),
        }
    }

    /// Receiver for the comparison estimator's events
    pub fn comparison_events(&self) -> Receiver<ComparisonEvent> {
        self.comparison_rx.clone()
    }

    pub fn mode(&self) -> FeedbackMode {
        self.mode
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn stats(&self) -> FeedbackStats {
        FeedbackStats {
            comparison_dropped: self.comparison_dropped.load(Ordering::Relaxed),
            ..self.stats.clone()
        }
    }

    /// Retransmission requests still remembered
    pub fn outstanding_requests(&self) -> usize {
        self.requests.values().filter(|r| !r.answered).count()
    }

    pub fn primary(&self) -> Option<&EstimatorDriver> {
        self.primary.as_ref()
    }

    pub fn comparison(&self) -> Option<&EstimatorDriver> {
        self.comparison.as_ref()
    }

    /// Primary estimator telemetry
    pub fn diagnostics(&self) -> Option<EstimatorDiagnostics> {
        self.primary.as_ref().map(|d| d.estimator().diagnostics())
    }

    fn ensure_running(&self) -> Result<(), FeedbackError> {
        if self.shut_down {
            return Err(FeedbackError::ShutDown);
        }
        Ok(())
    }

    fn ensure_mode(&self, expected: FeedbackMode) -> Result<(), FeedbackError> {
        if self.mode != expected {
            return Err(FeedbackError::WrongMode {
                expected,
                actual: self.mode,
            });
        }
        Ok(())
    }

    /// Apply primary estimator events to the pending lists
    fn handle_events(&mut self, events: &[EstimatorEvent]) {
        for event in events {
            match *event {
                EstimatorEvent::Lost { seq, .. } => {
                    if self.pending.lock().add_lost(seq) {
                        self.stats.losses_reported += 1;
                        tracing::debug!("Queued NACK for {}", event);
                    }
                }
                EstimatorEvent::FalsePositive { seq, .. } => {
                    self.stats.false_positives += 1;
                    if self.pending.lock().remove_lost(seq) {
                        self.stats.false_positives_withdrawn += 1;
                        if let Some(driver) = self.primary.as_mut() {
                            driver.estimator_mut().note_false_positive_removed(seq);
                        }
                        tracing::debug!("Withdrew NACK for {}", event);
                    } else {
                        self.stats.already_sent += 1;
                        tracing::debug!("{}: NACK already sent", event);
                    }
                }
            }
        }
    }

    fn reconcile(&mut self, now: Timestamp, seq: SeqNumber) -> RtxOutcome {
        let Some(request) = self.requests.get_mut(&seq) else {
            return RtxOutcome::Unrequested;
        };
        if request.answered {
            return RtxOutcome::Duplicate;
        }
        request.answered = true;
        let latency = now - request.requested_at;
        if latency > self.rtx_late_after {
            RtxOutcome::Late { latency }
        } else {
            RtxOutcome::Recovered { latency }
        }
    }

    fn prune_requests(&mut self, now: Timestamp) {
        let horizon = self.rtx_late_after * REQUEST_HORIZON_FACTOR;
        self.requests
            .retain(|_, r| now.saturating_duration_since(r.requested_at) <= horizon);

        while self.requests.len() >= MAX_OUTSTANDING_REQUESTS {
            let oldest = self
                .requests
                .iter()
                .min_by_key(|(_, r)| r.requested_at)
                .map(|(seq, _)| *seq);
            match oldest {
                Some(seq) => {
                    self.requests.remove(&seq);
                }
                None => break,
            }
        }
    }
}

fn forward_to(
    tx: Sender<ComparisonEvent>,
    estimator: EstimatorKind,
    dropped: Arc<AtomicU64>,
) -> impl FnMut(Timestamp, &EstimatorEvent) + Send + 'static {
    move |at, event| {
        let sent = tx.try_send(ComparisonEvent {
            at,
            estimator,
            event: *event,
        });
        if sent.is_err() {
            dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn seq(v: u16) -> SeqNumber {
        SeqNumber::new(v)
    }

    fn ms(v: u64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    fn warm_up(manager: &mut FeedbackManager) {
        for i in 1..=10u16 {
            manager
                .on_packet_arrival(ms(40 * i as u64), &Arrival::new(seq(i)))
                .unwrap();
        }
    }

    #[test]
    fn test_ack_mode_collects_received() {
        let mut manager = FeedbackManager::new(&SessionCapabilities::ack_only()).unwrap();
        assert_eq!(manager.mode(), FeedbackMode::Ack);
        assert!(manager.primary().is_none());

        for i in [1u16, 2, 4] {
            manager.on_packet_arrival(ms(i as u64), &Arrival::new(seq(i))).unwrap();
        }
        assert_eq!(manager.get_received(), vec![seq(1), seq(2), seq(4)]);
        assert!(manager.get_received().is_empty());
        assert!(manager.get_assumed_lost().is_empty());

        assert_eq!(
            manager.on_rtx_requested(ms(10), seq(3), None),
            Err(FeedbackError::WrongMode {
                expected: FeedbackMode::Nack,
                actual: FeedbackMode::Ack
            })
        );
    }

    #[test]
    fn test_none_mode_ignores_arrivals() {
        let caps = SessionCapabilities {
            nack: false,
            ack: false,
            ..SessionCapabilities::nack_with_rtx()
        };
        let mut manager = FeedbackManager::new(&caps).unwrap();
        assert_eq!(manager.mode(), FeedbackMode::None);
        assert!(manager.on_packet_arrival(ms(1), &Arrival::new(seq(1))).unwrap().is_empty());
        assert!(manager.feedback_handle().snapshot().is_empty());
    }

    #[test]
    fn test_lost_queued_once_and_drained() {
        let mut manager = FeedbackManager::new(&SessionCapabilities::nack_with_rtx()).unwrap();
        warm_up(&mut manager);

        let events = manager.on_packet_arrival(ms(480), &Arrival::new(seq(12))).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(manager.get_assumed_lost(), vec![seq(11)]);
        assert!(manager.get_assumed_lost().is_empty());
        assert_eq!(manager.stats().losses_reported, 1);
    }

    #[test]
    fn test_false_positive_withdrawn_before_drain() {
        let mut manager = FeedbackManager::new(&SessionCapabilities::nack_with_rtx()).unwrap();
        warm_up(&mut manager);
        manager.poll_timers(ms(450));
        assert_eq!(manager.feedback_handle().pending_lost(), 1);

        manager.on_packet_arrival(ms(460), &Arrival::new(seq(11))).unwrap();
        assert!(manager.get_assumed_lost().is_empty());

        let stats = manager.stats();
        assert_eq!(stats.false_positives, 1);
        assert_eq!(stats.false_positives_withdrawn, 1);
        assert_eq!(stats.already_sent, 0);
        let primary = manager.primary().unwrap().estimator();
        assert_eq!(primary.loss_statistics().false_positives_removed_before_rtx, 1);
    }

    #[test]
    fn test_false_positive_after_drain() {
        let mut manager = FeedbackManager::new(&SessionCapabilities::nack_with_rtx()).unwrap();
        warm_up(&mut manager);
        manager.poll_timers(ms(450));
        assert_eq!(manager.get_assumed_lost(), vec![seq(11)]);

        manager.on_packet_arrival(ms(460), &Arrival::new(seq(11))).unwrap();
        let stats = manager.stats();
        assert_eq!(stats.false_positives, 1);
        assert_eq!(stats.already_sent, 1);
        assert_eq!(stats.false_positives_withdrawn, 0);
    }

    #[test]
    fn test_rtx_reconciliation() {
        let mut manager = FeedbackManager::new(&SessionCapabilities::nack_with_rtx()).unwrap();

        manager.on_rtx_requested(ms(500), seq(11), None).unwrap();
        manager.on_rtx_requested(ms(520), seq(11), None).unwrap();
        assert_eq!(manager.outstanding_requests(), 1);

        assert_eq!(
            manager.on_rtx_packet_arrival(ms(550), &Arrival::new(seq(11))).unwrap(),
            RtxOutcome::Recovered {
                latency: Duration::from_millis(50)
            }
        );
        assert_eq!(
            manager.on_rtx_packet_arrival(ms(560), &Arrival::new(seq(11))).unwrap(),
            RtxOutcome::Duplicate
        );
        assert_eq!(
            manager.on_rtx_packet_arrival(ms(570), &Arrival::new(seq(99))).unwrap(),
            RtxOutcome::Unrequested
        );

        manager.on_rtx_requested(ms(600), seq(12), Some(1)).unwrap();
        assert_eq!(
            manager.on_rtx_packet_arrival(ms(1200), &Arrival::new(seq(12))).unwrap(),
            RtxOutcome::Late {
                latency: Duration::from_millis(600)
            }
        );

        let stats = manager.stats();
        assert_eq!(stats.rtx_recovered, 1);
        assert_eq!(stats.rtx_late, 1);
        assert_eq!(stats.rtx_duplicate, 1);
        assert_eq!(stats.rtx_unrequested, 1);
        assert_eq!(stats.mean_rtx_latency(), Duration::from_millis(325));
    }

    #[test]
    fn test_old_requests_are_forgotten() {
        let mut manager = FeedbackManager::new(&SessionCapabilities::nack_with_rtx()).unwrap();
        manager.on_rtx_requested(ms(0), seq(1), None).unwrap();
        // Past four late budgets the first request is pruned
        manager.on_rtx_requested(ms(2_500), seq(2), None).unwrap();
        assert_eq!(manager.outstanding_requests(), 1);
        assert_eq!(
            manager.on_rtx_packet_arrival(ms(2_510), &Arrival::new(seq(1))).unwrap(),
            RtxOutcome::Unrequested
        );
    }

    #[test]
    fn test_comparison_events_do_not_touch_pending() {
        let caps = SessionCapabilities {
            comparison: Some(EstimatorKind::SinglePath),
            ..SessionCapabilities::multipath_nack()
        };
        let mut manager = FeedbackManager::new(&caps).unwrap();
        let rx = manager.comparison_events();

        // One flow only: the cross-path primary stays in learning
        for i in 1..=10u16 {
            manager
                .on_packet_arrival(ms(40 * i as u64), &Arrival::on_flow(seq(i), 0, seq(i)))
                .unwrap();
        }
        manager.poll_timers(ms(450));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.at, ms(441));
        assert_eq!(event.estimator, EstimatorKind::SinglePath);
        assert_eq!(
            event.event,
            EstimatorEvent::Lost {
                seq: seq(11),
                flow: None
            }
        );
        assert!(manager.get_assumed_lost().is_empty());
        assert_eq!(manager.stats().comparison_events, 1);
        assert_eq!(manager.stats().comparison_dropped, 0);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut manager = FeedbackManager::new(&SessionCapabilities::nack_with_rtx()).unwrap();
        warm_up(&mut manager);
        assert!(manager.next_deadline().is_some());

        manager.shutdown();
        manager.shutdown();
        assert!(manager.is_shut_down());
        assert_eq!(manager.next_deadline(), None);
        assert_eq!(
            manager.on_packet_arrival(ms(500), &Arrival::new(seq(11))),
            Err(FeedbackError::ShutDown)
        );
        assert!(manager.poll_timers(ms(10_000)).is_empty());

        manager.reset();
        assert!(!manager.is_shut_down());
        assert!(manager.on_packet_arrival(ms(500), &Arrival::new(seq(11))).is_ok());
    }

    #[test]
    fn test_invalid_capabilities() {
        let caps = SessionCapabilities {
            comparison: Some(EstimatorKind::CrossPath),
            ..SessionCapabilities::ack_only()
        };
        assert_eq!(
            FeedbackManager::new(&caps).unwrap_err(),
            FeedbackError::Config(ConfigError::ComparisonWithoutNack)
        );
    }

    #[test]
    fn test_handle_drains_from_other_thread() {
        let mut manager = FeedbackManager::new(&SessionCapabilities::nack_with_rtx()).unwrap();
        let handle = manager.feedback_handle();
        warm_up(&mut manager);
        manager.poll_timers(ms(450));

        let drained = std::thread::spawn(move || handle.get_assumed_lost())
            .join()
            .unwrap();
        assert_eq!(drained, vec![seq(11)]);
        assert!(manager.get_assumed_lost().is_empty());
    }

    proptest! {
        #[test]
        fn prop_nack_queue_holds_each_sequence_once(
            ops in prop::collection::vec((any::<bool>(), 0u16..16), 1..200),
        ) {
            let mut pending = PendingFeedback::new();
            let mut model: Vec<SeqNumber> = Vec::new();
            for (add, raw) in ops {
                let s = seq(raw);
                let queued = model.contains(&s);
                if add {
                    prop_assert_eq!(pending.add_lost(s), !queued);
                    if !queued {
                        model.push(s);
                    }
                } else {
                    prop_assert_eq!(pending.remove_lost(s), queued);
                    model.retain(|m| *m != s);
                }
                prop_assert_eq!(pending.lost(), model.as_slice());
            }
            prop_assert_eq!(pending.take_lost(), model);
            prop_assert!(pending.is_empty());
        }
    }
}
