//! Virtual-time trace simulator
//!
//! Synthesises a multipath stream from the configured flows, replays it
//! through a [`FeedbackManager`] in arrival order and scores the loss
//! declarations against the packets that were actually dropped.
//!
//! Reporting ticks drain the pending feedback; every NACKed sequence is
//! requested and its repair delivered one retransmission round trip later.

use crate::config::{Config, ConfigError};
use mprtp::{FeedbackManager, FeedbackStats, RtxOutcome};
use mprtp_io::{IntervalTimer, Timestamp};
use mprtp_multipath::FlowStats;
use mprtp_protocol::{Arrival, Estimator, EstimatorDiagnostics, EstimatorEvent, SeqNumber};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

/// Time simulated past the last delivery so trailing timers can fire
pub const DRAIN_TAIL: Duration = Duration::from_secs(1);

/// One packet of a synthesised trace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracePacket {
    /// Global sequence number
    pub seq: SeqNumber,
    /// Flow the packet was sent on
    pub flow: u16,
    /// Flow-local sequence number
    pub flow_seq: SeqNumber,
    /// Send time
    pub sent: Timestamp,
    /// Send time plus path delay, without jitter
    pub nominal_arrival: Timestamp,
    /// Actual arrival; `None` when dropped
    pub arrival: Option<Timestamp>,
}

fn ms_to_timestamp(ms: f64) -> Timestamp {
    Timestamp::from_micros((ms * 1_000.0).round().max(0.0) as u64)
}

/// Build a trace from `config`, drawing jitter and loss from `rng`
///
/// Each flow sends on its own interval; global sequence numbers follow send
/// order across flows.
pub fn generate_trace<R: Rng>(config: &Config, rng: &mut R) -> Vec<TracePacket> {
    let mut next_send: Vec<f64> = config.flows.iter().map(|f| f.offset_ms).collect();
    let mut flow_seq: Vec<u16> = vec![0; config.flows.len()];
    let mut trace = Vec::with_capacity(config.simulation.packets);

    for i in 0..config.simulation.packets {
        let Some(slot) = (0..config.flows.len())
            .min_by(|a, b| next_send[*a].total_cmp(&next_send[*b]).then(a.cmp(b)))
        else {
            break;
        };
        let flow = &config.flows[slot];
        let sent_ms = next_send[slot];
        next_send[slot] += flow.interval_ms;

        let jitter_ms = if flow.jitter_ms > 0.0 {
            rng.gen_range(0.0..flow.jitter_ms)
        } else {
            0.0
        };
        let dropped = flow.loss > 0.0 && rng.gen::<f64>() < flow.loss;

        trace.push(TracePacket {
            seq: SeqNumber::from_wrapping(config.simulation.start_seq as u32 + i as u32),
            flow: flow.id,
            flow_seq: SeqNumber::new(flow_seq[slot]),
            sent: ms_to_timestamp(sent_ms),
            nominal_arrival: ms_to_timestamp(sent_ms + flow.extra_delay_ms),
            arrival: (!dropped).then(|| ms_to_timestamp(sent_ms + flow.extra_delay_ms + jitter_ms)),
        });
        flow_seq[slot] = flow_seq[slot].wrapping_add(1);
    }
    trace
}

/// Outcome of a simulation run
#[derive(Debug, Clone, Default)]
pub struct SimReport {
    /// Primary estimator name, or "none"
    pub estimator: &'static str,
    pub packets_sent: u64,
    /// Original packets delivered
    pub delivered: u64,
    /// Packets dropped by the simulated paths
    pub true_losses: u64,
    /// Dropped packets the estimator declared lost
    pub detected_losses: u64,
    /// Dropped packets never declared lost
    pub missed_losses: u64,
    /// Delivered packets declared lost
    pub false_positives: u64,
    /// Sum over detected losses of declaration time minus nominal arrival, µs
    pub detection_delay_total_us: u64,
    /// Reporting ticks
    pub reports: u64,
    /// Trace sequence numbers drained for NACK
    pub nacks_sent: u64,
    /// NACKs for sequence numbers past the end of the trace
    pub stray_nacks: u64,
    /// Sequence numbers drained for ACK
    pub acks_sent: u64,
    /// Repairs classified as recovered
    pub repaired: u64,
    pub feedback: FeedbackStats,
    pub diagnostics: Option<EstimatorDiagnostics>,
    /// Per-flow counters seen by a cross-path estimator
    pub flows: Vec<FlowStats>,
    /// Virtual time simulated
    pub duration: Duration,
}

impl SimReport {
    /// Mean time from nominal arrival to loss declaration
    pub fn mean_detection_delay(&self) -> Duration {
        if self.detected_losses == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.detection_delay_total_us / self.detected_losses)
    }

    /// Share of dropped packets that were declared lost
    pub fn detection_rate(&self) -> f64 {
        if self.true_losses == 0 {
            return 1.0;
        }
        self.detected_losses as f64 / self.true_losses as f64
    }

    /// Share of loss declarations that were wrong
    pub fn false_positive_rate(&self) -> f64 {
        let declared = self.detected_losses + self.false_positives;
        if declared == 0 {
            return 0.0;
        }
        self.false_positives as f64 / declared as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Delivery {
    at: Timestamp,
    ordinal: u64,
    index: usize,
    rtx: bool,
}

/// Replays one trace through a feedback manager
#[derive(Debug)]
pub struct Simulator {
    manager: FeedbackManager,
    trace: Vec<TracePacket>,
    index_by_seq: HashMap<SeqNumber, usize>,
    declared: HashMap<usize, Timestamp>,
    deliveries: BinaryHeap<Reverse<Delivery>>,
    next_ordinal: u64,
    report_timer: IntervalTimer,
    rtx_rtt: Duration,
    report: SimReport,
}

impl Simulator {
    /// Generate a trace from `config` and prepare to replay it
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut rng = match config.simulation.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let trace = generate_trace(config, &mut rng);
        Self::with_trace(config, trace)
    }

    /// Replay a prepared trace
    pub fn with_trace(config: &Config, trace: Vec<TracePacket>) -> Result<Self, ConfigError> {
        config.validate()?;
        let manager = FeedbackManager::new(&config.capabilities()?)?;

        let mut sim = Simulator {
            manager,
            index_by_seq: trace.iter().enumerate().map(|(i, p)| (p.seq, i)).collect(),
            trace,
            declared: HashMap::new(),
            deliveries: BinaryHeap::new(),
            next_ordinal: 0,
            report_timer: IntervalTimer::new(config.report_interval(), Timestamp::ZERO),
            rtx_rtt: config.rtx_rtt(),
            report: SimReport::default(),
        };
        for index in 0..sim.trace.len() {
            if let Some(at) = sim.trace[index].arrival {
                sim.schedule(at, index, false);
            }
        }
        Ok(sim)
    }

    /// Run to completion
    pub fn run(mut self) -> SimReport {
        let last = self
            .deliveries
            .iter()
            .map(|Reverse(d)| d.at)
            .chain(self.trace.iter().map(|p| p.nominal_arrival))
            .max()
            .unwrap_or(Timestamp::ZERO);
        let mut end = last + DRAIN_TAIL;

        while let Some(Reverse(delivery)) = self.deliveries.pop() {
            self.advance_to(delivery.at);
            self.deliver(delivery);
            end = end.max(delivery.at + DRAIN_TAIL);
        }
        self.advance_to(end);
        self.finish(end)
    }

    fn schedule(&mut self, at: Timestamp, index: usize, rtx: bool) {
        self.deliveries.push(Reverse(Delivery {
            at,
            ordinal: self.next_ordinal,
            index,
            rtx,
        }));
        self.next_ordinal += 1;
    }

    /// Fire timers and reporting ticks due strictly before `at`
    fn advance_to(&mut self, at: Timestamp) {
        loop {
            let tick = self.report_timer.next_expiration();
            match self.manager.next_deadline() {
                Some(deadline) if deadline < tick => {
                    if deadline >= at {
                        break;
                    }
                    let events = self.manager.poll_timers(deadline);
                    self.record(deadline, &events);
                }
                _ => {
                    if tick >= at {
                        break;
                    }
                    self.report_tick(tick);
                }
            }
        }
    }

    fn deliver(&mut self, delivery: Delivery) {
        let packet = self.trace[delivery.index];
        let arrival = Arrival::on_flow(packet.seq, packet.flow, packet.flow_seq);

        if delivery.rtx {
            match self.manager.on_rtx_packet_arrival(delivery.at, &arrival) {
                Ok(RtxOutcome::Recovered { .. }) => self.report.repaired += 1,
                Ok(outcome) => tracing::trace!("repair of {}: {:?}", packet.seq, outcome),
                Err(e) => tracing::warn!("repair of {} rejected: {}", packet.seq, e),
            }
            return;
        }

        self.report.delivered += 1;
        match self.manager.on_packet_arrival(delivery.at, &arrival) {
            Ok(events) => self.record(delivery.at, &events),
            Err(e) => tracing::warn!("arrival of {} rejected: {}", packet.seq, e),
        }
    }

    fn record(&mut self, at: Timestamp, events: &[EstimatorEvent]) {
        for event in events.iter().filter(|e| e.is_lost()) {
            if let Some(&index) = self.index_by_seq.get(&event.seq()) {
                self.declared.entry(index).or_insert(at);
            }
        }
    }

    fn report_tick(&mut self, tick: Timestamp) {
        if !self.report_timer.try_fire(tick) {
            return;
        }
        self.report.reports += 1;
        self.report.acks_sent += self.manager.get_received().len() as u64;

        let lost = self.manager.get_assumed_lost();
        if lost.is_empty() {
            return;
        }
        tracing::debug!("report at {}: NACK {:?}", tick, lost);
        for seq in lost {
            let Some(&index) = self.index_by_seq.get(&seq) else {
                // The stream ended; the estimator keeps expecting packets.
                self.report.stray_nacks += 1;
                continue;
            };
            self.report.nacks_sent += 1;
            if let Err(e) = self.manager.on_rtx_requested(tick, seq, None) {
                tracing::warn!("cannot request {}: {}", seq, e);
                continue;
            }
            self.schedule(tick + self.rtx_rtt, index, true);
        }
    }

    fn finish(mut self, end: Timestamp) -> SimReport {
        self.report.acks_sent += self.manager.get_received().len() as u64;
        for seq in self.manager.get_assumed_lost() {
            if self.index_by_seq.contains_key(&seq) {
                self.report.nacks_sent += 1;
            } else {
                self.report.stray_nacks += 1;
            }
        }

        for (index, packet) in self.trace.iter().enumerate() {
            let declared = self.declared.get(&index);
            match (packet.arrival, declared) {
                (None, Some(at)) => {
                    self.report.true_losses += 1;
                    self.report.detected_losses += 1;
                    self.report.detection_delay_total_us +=
                        at.saturating_duration_since(packet.nominal_arrival).as_micros() as u64;
                }
                (None, None) => {
                    self.report.true_losses += 1;
                    self.report.missed_losses += 1;
                }
                (Some(_), Some(_)) => self.report.false_positives += 1,
                (Some(_), None) => {}
            }
        }
        self.report.packets_sent = self.trace.len() as u64;

        if let Some(driver) = self.manager.primary() {
            let estimator = driver.estimator();
            self.report.estimator = estimator.name();
            self.report.diagnostics = Some(estimator.diagnostics());
            if let Some(cross) = estimator.as_cross_path() {
                self.report.flows = cross.flows().stats();
            }
        } else {
            self.report.estimator = "none";
        }

        self.manager.shutdown();
        self.report.feedback = self.manager.stats();
        self.report.duration = end.saturating_duration_since(Timestamp::ZERO);
        self.report
    }
}

/// Generate and replay the trace described by `config`
pub fn run(config: &Config) -> Result<SimReport, ConfigError> {
    Ok(Simulator::new(config)?.run())
}
