//! Per-flow arrival windows
//!
//! Each flow keeps the last N arrival records in arrival order together with
//! a few counters. Flows are created on first arrival and live until the
//! owning table is cleared.

use mprtp_io::Timestamp;
use mprtp_protocol::SeqNumber;
use std::collections::VecDeque;

/// Default arrival records kept per flow
pub const DEFAULT_FLOW_WINDOW: usize = 16;

/// One packet arrival on a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrivalRecord {
    /// Global sequence number
    pub seq: SeqNumber,
    /// Flow-local sequence number
    pub flow_seq: SeqNumber,
    /// Arrival time
    pub at: Timestamp,
}

/// Per-flow statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowStats {
    /// Flow identifier
    pub flow_id: u16,
    /// Packets received on this flow
    pub packets: u64,
    /// Flow-local sequence numbers skipped (in-path loss)
    pub flow_seq_gaps: u64,
    /// Arrivals older than the flow's newest flow-local sequence
    pub reordered: u64,
    /// Time of the most recent arrival
    pub last_arrival: Option<Timestamp>,
}

/// Outcome of recording an arrival
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowUpdate {
    /// The flow was created by this arrival
    pub new_flow: bool,
    /// Flow-local sequence numbers skipped by this arrival
    pub flow_seq_gap: u16,
    /// Newest global sequence on the flow before the skipped ones
    pub gap_after: Option<SeqNumber>,
    /// The arrival was older than the flow's newest flow-local sequence
    pub reordered: bool,
}

/// Sliding window of arrivals on one flow
#[derive(Debug, Clone)]
pub struct Flow {
    id: u16,
    window: VecDeque<ArrivalRecord>,
    capacity: usize,
    max_seq: Option<SeqNumber>,
    max_flow_seq: Option<SeqNumber>,
    first_arrival: Timestamp,
    stats: FlowStats,
}

impl Flow {
    fn new(id: u16, capacity: usize, first_arrival: Timestamp) -> Self {
        Flow {
            id,
            window: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            max_seq: None,
            max_flow_seq: None,
            first_arrival,
            stats: FlowStats {
                flow_id: id,
                ..FlowStats::default()
            },
        }
    }

    fn record(&mut self, record: ArrivalRecord) -> FlowUpdate {
        let mut update = FlowUpdate::default();

        match self.max_flow_seq {
            None => self.max_flow_seq = Some(record.flow_seq),
            Some(max) if record.flow_seq.is_newer(max) => {
                let skipped = max.distance_to(record.flow_seq) - 1;
                update.flow_seq_gap = skipped as u16;
                if skipped > 0 {
                    update.gap_after = self.max_seq;
                }
                self.stats.flow_seq_gaps += skipped as u64;
                self.max_flow_seq = Some(record.flow_seq);
            }
            Some(_) => {
                update.reordered = true;
                self.stats.reordered += 1;
            }
        }

        if self.max_seq.map_or(true, |max| record.seq.is_newer(max)) {
            self.max_seq = Some(record.seq);
        }

        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(record);
        self.stats.packets += 1;
        self.stats.last_arrival = Some(record.at);
        update
    }

    /// Flow identifier
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Records currently in the window
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Check if the window is empty
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Window contents, oldest arrival first
    pub fn records(&self) -> impl Iterator<Item = &ArrivalRecord> {
        self.window.iter()
    }

    /// Most recent arrival
    pub fn newest(&self) -> Option<&ArrivalRecord> {
        self.window.back()
    }

    /// Oldest arrival still in the window
    pub fn oldest(&self) -> Option<&ArrivalRecord> {
        self.window.front()
    }

    /// Newest global sequence seen on this flow
    pub fn max_seq(&self) -> Option<SeqNumber> {
        self.max_seq
    }

    /// Time of the flow's first arrival
    pub fn first_arrival(&self) -> Timestamp {
        self.first_arrival
    }

    /// Flow statistics
    pub fn stats(&self) -> &FlowStats {
        &self.stats
    }

    /// Average arrival interval per global sequence step across the window, µs
    ///
    /// `None` until the window spans a positive sequence distance.
    pub fn average_delta(&self) -> Option<f64> {
        let first = self.oldest()?;
        let last = self.newest()?;
        let steps = first.seq.distance_to(last.seq);
        if steps <= 0 {
            return None;
        }
        Some(last.at.signed_micros_since(first.at) as f64 / steps as f64)
    }

    /// Time at which this flow would have carried `reference`, µs
    ///
    /// Extrapolates the newest arrival backwards by the sequence distance
    /// times `delta_us`.
    pub fn virtual_time(&self, reference: SeqNumber, delta_us: f64) -> Option<f64> {
        let last = self.newest()?;
        let steps = reference.distance_to(last.seq) as f64;
        Some(last.at.as_micros() as f64 - steps * delta_us)
    }
}

/// All flows seen by an estimator, in creation order
#[derive(Debug, Clone)]
pub struct FlowTable {
    flows: Vec<Flow>,
    window: usize,
}

impl FlowTable {
    /// Create an empty table whose flows keep `window` records each
    pub fn new(window: usize) -> Self {
        FlowTable {
            flows: Vec::new(),
            window,
        }
    }

    /// Record an arrival, creating the flow if needed
    pub fn record(&mut self, flow_id: u16, record: ArrivalRecord) -> FlowUpdate {
        let index = match self.flows.iter().position(|f| f.id == flow_id) {
            Some(index) => index,
            None => {
                tracing::debug!("new flow {}", flow_id);
                self.flows.push(Flow::new(flow_id, self.window, record.at));
                self.flows.len() - 1
            }
        };
        let is_new = self.flows[index].is_empty();
        let mut update = self.flows[index].record(record);
        update.new_flow = is_new;
        update
    }

    /// Look up a flow
    pub fn get(&self, flow_id: u16) -> Option<&Flow> {
        self.flows.iter().find(|f| f.id == flow_id)
    }

    /// Iterate flows in creation order
    pub fn iter(&self) -> impl Iterator<Item = &Flow> {
        self.flows.iter()
    }

    /// Number of flows
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Check if no flow has been seen
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Whether every known flow holds at least `min` records
    pub fn all_have_samples(&self, min: usize) -> bool {
        !self.flows.is_empty() && self.flows.iter().all(|f| f.len() >= min)
    }

    /// Statistics for every flow
    pub fn stats(&self) -> Vec<FlowStats> {
        self.flows.iter().map(|f| f.stats.clone()).collect()
    }

    /// Drop every flow
    pub fn clear(&mut self) {
        self.flows.clear();
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new(DEFAULT_FLOW_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rec(seq: u16, flow_seq: u16, ms: u64) -> ArrivalRecord {
        ArrivalRecord {
            seq: SeqNumber::new(seq),
            flow_seq: SeqNumber::new(flow_seq),
            at: Timestamp::from_millis(ms),
        }
    }

    #[test]
    fn test_lazy_creation_and_window_bound() {
        let mut table = FlowTable::new(4);
        assert!(table.record(1, rec(0, 0, 0)).new_flow);
        for i in 1..10u16 {
            assert!(!table.record(1, rec(i * 2, i, i as u64 * 20)).new_flow);
        }
        let flow = table.get(1).unwrap();
        assert_eq!(flow.len(), 4);
        assert_eq!(flow.oldest().unwrap().seq, SeqNumber::new(12));
        assert_eq!(flow.stats().packets, 10);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_flow_seq_gap_and_reorder() {
        let mut table = FlowTable::default();
        table.record(0, rec(0, 0, 0));
        let update = table.record(0, rec(6, 3, 60));
        assert_eq!(update.flow_seq_gap, 2);
        assert_eq!(update.gap_after, Some(SeqNumber::new(0)));
        assert_eq!(table.record(0, rec(8, 4, 80)).gap_after, None);

        let update = table.record(0, rec(4, 2, 65));
        assert!(update.reordered);

        let stats = &table.get(0).unwrap().stats();
        assert_eq!(stats.flow_seq_gaps, 2);
        assert_eq!(stats.reordered, 1);
        // The window maximum does not move backwards
        assert_eq!(table.get(0).unwrap().max_seq(), Some(SeqNumber::new(8)));
    }

    #[test]
    fn test_average_delta_and_virtual_time() {
        let mut table = FlowTable::default();
        for i in 0..4u16 {
            table.record(0, rec(i * 2, i, 100 + i as u64 * 20));
        }
        let flow = table.get(0).unwrap();
        let delta = flow.average_delta().unwrap();
        assert!((delta - 10_000.0).abs() < 1e-6);

        // Newest arrival is seq 6 at 160ms; seq 0 would have arrived at 100ms
        let vt = flow.virtual_time(SeqNumber::new(0), delta).unwrap();
        assert!((vt - 100_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_average_delta_needs_progress() {
        let mut table = FlowTable::default();
        table.record(0, rec(5, 0, 0));
        assert!(table.get(0).unwrap().average_delta().is_none());
        assert!(table.all_have_samples(1));
        assert!(!table.all_have_samples(2));
    }

    proptest! {
        #[test]
        fn prop_window_maximum_never_moves_backwards(
            start in any::<u16>(),
            steps in prop::collection::vec(-20i32..40, 1..300),
        ) {
            let mut table = FlowTable::new(8);
            let mut seq = SeqNumber::new(start);
            let mut previous: Option<SeqNumber> = None;
            for (i, step) in steps.into_iter().enumerate() {
                seq = SeqNumber::new((seq.as_raw() as i32 + step).rem_euclid(1 << 16) as u16);
                table.record(3, rec(seq.as_raw(), seq.as_raw(), i as u64));

                let max = table.get(3).and_then(|f| f.max_seq());
                prop_assert!(max.is_some());
                if let (Some(before), Some(after)) = (previous, max) {
                    prop_assert!(after.is_newer_or_equal(before));
                }
                previous = max;
            }
            prop_assert!(table.get(3).map_or(false, |f| f.len() <= 8));
        }
    }
}
