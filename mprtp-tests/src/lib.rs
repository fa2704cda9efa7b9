//! Shared fixtures for the MPRTP integration tests
//!
//! Arrival traces are built with explicit virtual timestamps and replayed
//! through an [`EstimatorDriver`], recording every event with the time it
//! was delivered.

use mprtp::{EstimatorDriver, EstimatorEvent};
use mprtp_io::Timestamp;
use mprtp_protocol::{Arrival, Estimator, SeqNumber};
use parking_lot::Mutex;
use std::sync::Arc;

pub fn seq(v: u16) -> SeqNumber {
    SeqNumber::new(v)
}

pub fn ms(v: u64) -> Timestamp {
    Timestamp::from_millis(v)
}

/// One arrival of a trace
pub type TraceEntry = (Timestamp, Arrival);

/// Single-path stream: `count` packets from `first`, one every `interval_ms`
///
/// Packet `i` arrives at `(i + 1) * interval_ms`.
pub fn periodic(first: u16, count: u16, interval_ms: u64, skip: &[u16]) -> Vec<TraceEntry> {
    (0..count)
        .map(|i| first.wrapping_add(i))
        .enumerate()
        .filter(|(_, s)| !skip.contains(s))
        .map(|(i, s)| (ms((i as u64 + 1) * interval_ms), Arrival::new(seq(s))))
        .collect()
}

/// Two-flow stream: even sequences on flow 0 every 20ms, odd ones on flow 1
/// offset by 10ms plus `slow_delay_ms`
pub fn interleaved(range: std::ops::Range<u16>, slow_delay_ms: u64, skip: &[u16]) -> Vec<TraceEntry> {
    range
        .filter(|s| !skip.contains(s))
        .map(|s| {
            let flow = s % 2;
            let at = s as u64 * 10 + if flow == 1 { slow_delay_ms } else { 0 };
            (ms(at), Arrival::on_flow(seq(s), flow, seq(s / 2)))
        })
        .collect()
}

/// Driver plus a log of delivered events
pub struct Replay<E: Estimator> {
    pub driver: EstimatorDriver<E>,
    log: Arc<Mutex<Vec<(Timestamp, EstimatorEvent)>>>,
}

impl<E: Estimator> Replay<E> {
    pub fn new(estimator: E) -> Self {
        let mut driver = EstimatorDriver::new(estimator);
        let log = Arc::new(Mutex::new(Vec::new()));
        let lost = Arc::clone(&log);
        driver.set_lost_handler(move |at, event| lost.lock().push((at, *event)));
        let late = Arc::clone(&log);
        driver.set_false_positive_handler(move |at, event| late.lock().push((at, *event)));
        Replay { driver, log }
    }

    /// Deliver every entry in order
    pub fn feed(&mut self, trace: &[TraceEntry]) {
        for (at, arrival) in trace {
            self.driver.on_packet_arrival(*at, arrival);
        }
    }

    /// Fire timers up to `until`
    pub fn run_until(&mut self, until: Timestamp) {
        self.driver.poll_timers(until);
    }

    /// Every event delivered so far
    pub fn events(&self) -> Vec<(Timestamp, EstimatorEvent)> {
        self.log.lock().clone()
    }

    /// Sequence numbers declared lost, in declaration order
    pub fn lost(&self) -> Vec<u16> {
        self.log
            .lock()
            .iter()
            .filter(|(_, e)| e.is_lost())
            .map(|(_, e)| e.seq().as_raw())
            .collect()
    }

    /// Sequence numbers reported as false positives
    pub fn false_positives(&self) -> Vec<u16> {
        self.log
            .lock()
            .iter()
            .filter(|(_, e)| !e.is_lost())
            .map(|(_, e)| e.seq().as_raw())
            .collect()
    }
}
