//! Loss statistics tracking
//!
//! Records, per sequence number, whether a packet was assumed lost by an
//! estimator, received, or turned out to be a false positive. Timer expiry
//! handlers consult it instead of trusting that cancellation raced correctly.
//!
//! Entries live in a fixed ring indexed by the low bits of the sequence
//! number, so history is bounded: an entry ages out when a sequence number
//! one full ring ahead claims its slot.

use crate::sequence::SeqNumber;
use mprtp_io::Timestamp;
use std::time::Duration;

/// Default number of sequence numbers remembered
pub const DEFAULT_TRACKER_HISTORY: usize = 1024;

/// Lifecycle of a tracked sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    /// Received without ever being assumed lost
    Received,
    /// Declared lost, not (yet) received
    AssumedLost { at: Timestamp },
    /// Declared lost, then the original arrived
    FalsePositive { late_by: Duration },
    /// Declared lost and repaired by a retransmission
    Recovered,
}

/// Result of recording a reception
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reception {
    /// First reception, never assumed lost
    New,
    /// Had been assumed lost; arrived `late_by` after the declaration
    FalsePositive { late_by: Duration },
    /// Repair of a packet that had been assumed lost
    Recovered,
    /// Already received
    Duplicate,
    /// So old that its slot belongs to a newer sequence; not recorded
    Stale,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    seq: SeqNumber,
    status: PacketStatus,
}

/// Counters accumulated by a [`LossStatisticsTracker`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LossStatistics {
    /// Distinct packets received
    pub received: u64,
    /// Packets declared lost
    pub assumed_lost: u64,
    /// Declared-lost packets whose original later arrived
    pub false_positives: u64,
    /// False positives withdrawn before a retransmission request left
    pub false_positives_removed_before_rtx: u64,
    /// Declared-lost packets repaired by retransmission
    pub recovered: u64,
    /// Declared-lost packets that aged out without any arrival
    pub confirmed_lost: u64,
    /// Duplicate receptions
    pub duplicates: u64,
    /// Receptions too old to record
    pub stale: u64,
    /// Sum of false-positive lateness, µs
    pub false_positive_delay_us: u64,
}

impl LossStatistics {
    /// Fraction of loss declarations that were wrong (0.0 to 1.0)
    pub fn false_positive_rate(&self) -> f64 {
        if self.assumed_lost == 0 {
            0.0
        } else {
            self.false_positives as f64 / self.assumed_lost as f64
        }
    }

    /// Mean time between a wrong declaration and the packet's arrival
    pub fn mean_false_positive_delay(&self) -> Duration {
        if self.false_positives == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(self.false_positive_delay_us / self.false_positives)
        }
    }
}

/// Bounded per-sequence loss bookkeeping
#[derive(Debug, Clone)]
pub struct LossStatisticsTracker {
    slots: Vec<Option<Entry>>,
    mask: usize,
    stats: LossStatistics,
}

impl LossStatisticsTracker {
    /// Create a tracker remembering [`DEFAULT_TRACKER_HISTORY`] sequence numbers
    pub fn new() -> Self {
        Self::with_history(DEFAULT_TRACKER_HISTORY)
    }

    /// Create a tracker remembering about `history` sequence numbers
    ///
    /// The history is rounded up to a power of two no larger than the
    /// sequence space.
    pub fn with_history(history: usize) -> Self {
        let size = history.clamp(2, 1 << 16).next_power_of_two();
        LossStatisticsTracker {
            slots: vec![None; size],
            mask: size - 1,
            stats: LossStatistics::default(),
        }
    }

    /// Number of sequence numbers remembered
    pub fn history(&self) -> usize {
        self.slots.len()
    }

    fn index(&self, seq: SeqNumber) -> usize {
        seq.as_raw() as usize & self.mask
    }

    fn entry(&self, seq: SeqNumber) -> Option<Entry> {
        self.slots[self.index(seq)].filter(|e| e.seq == seq)
    }

    /// Record `status` for `seq`
    ///
    /// Returns false without touching the slot if it holds a newer sequence.
    fn store(&mut self, seq: SeqNumber, status: PacketStatus) -> bool {
        let index = self.index(seq);
        if let Some(old) = self.slots[index] {
            if old.seq.is_newer(seq) {
                return false;
            }
            if old.seq != seq {
                if let PacketStatus::AssumedLost { .. } = old.status {
                    self.stats.confirmed_lost += 1;
                }
            }
        }
        self.slots[index] = Some(Entry { seq, status });
        true
    }

    fn stale(&mut self, seq: SeqNumber) -> Reception {
        self.stats.stale += 1;
        tracing::debug!("{} is older than the tracked history, ignoring", seq);
        Reception::Stale
    }

    /// Status of `seq` if it is still remembered
    pub fn status(&self, seq: SeqNumber) -> Option<PacketStatus> {
        self.entry(seq).map(|e| e.status)
    }

    /// Declare `seq` lost at `now`
    ///
    /// Returns false, leaving the tracker untouched, if `seq` was already
    /// declared lost or has been received.
    pub fn assume_packet_lost(&mut self, now: Timestamp, seq: SeqNumber) -> bool {
        if self.entry(seq).is_some() || !self.store(seq, PacketStatus::AssumedLost { at: now }) {
            return false;
        }
        self.stats.assumed_lost += 1;
        true
    }

    /// Whether `seq` is declared lost and still outstanding
    pub fn is_packet_assumed_lost(&self, seq: SeqNumber) -> bool {
        matches!(self.status(seq), Some(PacketStatus::AssumedLost { .. }))
    }

    /// Whether `seq` has been received (original or repair) recently
    pub fn has_packet_been_received_recently(&self, seq: SeqNumber) -> bool {
        matches!(
            self.status(seq),
            Some(PacketStatus::Received)
                | Some(PacketStatus::FalsePositive { .. })
                | Some(PacketStatus::Recovered)
        )
    }

    /// Whether `seq` was declared lost or received, so needs no further action
    pub fn is_resolved(&self, seq: SeqNumber) -> bool {
        self.entry(seq).is_some()
    }

    /// Record arrival of the original packet `seq`
    pub fn on_packet_received(&mut self, now: Timestamp, seq: SeqNumber) -> Reception {
        match self.status(seq) {
            None => {
                if !self.store(seq, PacketStatus::Received) {
                    return self.stale(seq);
                }
                self.stats.received += 1;
                Reception::New
            }
            Some(PacketStatus::AssumedLost { at }) => {
                let late_by = now - at;
                self.store(seq, PacketStatus::FalsePositive { late_by });
                self.stats.received += 1;
                self.stats.false_positives += 1;
                self.stats.false_positive_delay_us +=
                    late_by.as_micros().try_into().unwrap_or(u64::MAX);
                tracing::debug!("false positive for {} (late by {:?})", seq, late_by);
                Reception::FalsePositive { late_by }
            }
            Some(_) => {
                self.stats.duplicates += 1;
                Reception::Duplicate
            }
        }
    }

    /// Record arrival of a retransmission of `seq`
    pub fn on_retransmission_received(&mut self, seq: SeqNumber) -> Reception {
        match self.status(seq) {
            Some(PacketStatus::AssumedLost { .. }) => {
                self.store(seq, PacketStatus::Recovered);
                self.stats.received += 1;
                self.stats.recovered += 1;
                Reception::Recovered
            }
            None => {
                // Repair for something this tracker never declared lost,
                // e.g. requested by a peer estimator or before a reset.
                if !self.store(seq, PacketStatus::Received) {
                    return self.stale(seq);
                }
                self.stats.received += 1;
                Reception::New
            }
            Some(_) => {
                self.stats.duplicates += 1;
                Reception::Duplicate
            }
        }
    }

    /// Note that a false positive was withdrawn before any request was sent
    pub fn false_positive_removed_before_retransmission(&mut self, seq: SeqNumber) {
        if matches!(self.status(seq), Some(PacketStatus::FalsePositive { .. })) {
            self.stats.false_positives_removed_before_rtx += 1;
        }
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> LossStatistics {
        self.stats
    }

    /// Forget all history and counters
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.stats = LossStatistics::default();
    }

    /// Forget per-sequence history, keeping the counters
    pub fn clear_history(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    /// Log the counters at info level
    pub fn log_statistics(&self, label: &str) {
        let s = &self.stats;
        tracing::info!(
            "{}: received={} assumed_lost={} false_positives={} ({:.2}%) removed_before_rtx={} recovered={} confirmed_lost={} duplicates={} mean_fp_delay={:?}",
            label,
            s.received,
            s.assumed_lost,
            s.false_positives,
            s.false_positive_rate() * 100.0,
            s.false_positives_removed_before_rtx,
            s.recovered,
            s.confirmed_lost,
            s.duplicates,
            s.mean_false_positive_delay()
        );
    }
}

impl Default for LossStatisticsTracker {
    fn default() -> Self {
        Self::new()
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

    #[test]
    fn test_assume_lost_at_most_once() {
        let mut tracker = LossStatisticsTracker::new();
        assert!(tracker.assume_packet_lost(ms(10), seq(5)));
        assert!(!tracker.assume_packet_lost(ms(20), seq(5)));
        assert!(tracker.is_packet_assumed_lost(seq(5)));
        assert_eq!(tracker.stats().assumed_lost, 1);
    }

    #[test]
    fn test_received_cannot_be_assumed_lost() {
        let mut tracker = LossStatisticsTracker::new();
        assert_eq!(tracker.on_packet_received(ms(0), seq(7)), Reception::New);
        assert!(tracker.has_packet_been_received_recently(seq(7)));
        assert!(!tracker.assume_packet_lost(ms(5), seq(7)));
    }

    #[test]
    fn test_false_positive() {
        let mut tracker = LossStatisticsTracker::new();
        tracker.assume_packet_lost(ms(100), seq(9));

        let reception = tracker.on_packet_received(ms(130), seq(9));
        assert_eq!(
            reception,
            Reception::FalsePositive {
                late_by: Duration::from_millis(30)
            }
        );
        assert!(!tracker.is_packet_assumed_lost(seq(9)));
        assert!(tracker.has_packet_been_received_recently(seq(9)));

        tracker.false_positive_removed_before_retransmission(seq(9));
        let stats = tracker.stats();
        assert_eq!(stats.false_positives, 1);
        assert_eq!(stats.false_positives_removed_before_rtx, 1);
        assert_eq!(stats.mean_false_positive_delay(), Duration::from_millis(30));
        assert_eq!(stats.false_positive_rate(), 1.0);

        assert_eq!(tracker.on_packet_received(ms(140), seq(9)), Reception::Duplicate);
    }

    #[test]
    fn test_retransmission_recovers() {
        let mut tracker = LossStatisticsTracker::new();
        tracker.assume_packet_lost(ms(0), seq(3));
        assert_eq!(
            tracker.on_retransmission_received(seq(3)),
            Reception::Recovered
        );
        assert_eq!(
            tracker.on_retransmission_received(seq(3)),
            Reception::Duplicate
        );
        assert_eq!(tracker.stats().recovered, 1);
    }

    #[test]
    fn test_history_is_bounded_and_ages_out() {
        let mut tracker = LossStatisticsTracker::with_history(16);
        assert_eq!(tracker.history(), 16);

        tracker.assume_packet_lost(ms(0), seq(1));
        // Sequence 17 shares the slot and evicts the outstanding loss
        tracker.on_packet_received(ms(1), seq(17));

        assert!(!tracker.is_packet_assumed_lost(seq(1)));
        assert!(tracker.status(seq(1)).is_none());
        assert_eq!(tracker.stats().confirmed_lost, 1);
    }

    #[test]
    fn test_stale_arrival_keeps_newer_loss() {
        let mut tracker = LossStatisticsTracker::with_history(16);
        tracker.assume_packet_lost(ms(0), seq(40));

        // 24 maps to the same slot but is older than the outstanding loss
        assert_eq!(tracker.on_packet_received(ms(1), seq(24)), Reception::Stale);
        assert_eq!(tracker.on_retransmission_received(seq(24)), Reception::Stale);
        assert!(!tracker.assume_packet_lost(ms(2), seq(8)));
        assert!(tracker.is_packet_assumed_lost(seq(40)));

        assert!(matches!(
            tracker.on_packet_received(ms(30), seq(40)),
            Reception::FalsePositive { .. }
        ));
        let stats = tracker.stats();
        assert_eq!(stats.stale, 2);
        assert_eq!(stats.confirmed_lost, 0);
        assert_eq!(stats.assumed_lost, 1);
    }

    #[test]
    fn test_wraparound_slots() {
        let mut tracker = LossStatisticsTracker::with_history(8);
        tracker.on_packet_received(ms(0), seq(u16::MAX));
        tracker.on_packet_received(ms(1), seq(0));
        assert!(tracker.has_packet_been_received_recently(seq(u16::MAX)));
        assert!(tracker.has_packet_been_received_recently(seq(0)));
    }

    #[test]
    fn test_reset() {
        let mut tracker = LossStatisticsTracker::new();
        tracker.assume_packet_lost(ms(0), seq(1));
        tracker.reset();
        assert!(!tracker.is_resolved(seq(1)));
        assert_eq!(tracker.stats(), LossStatistics::default());
    }

    proptest! {
        #[test]
        fn prop_older_slot_mates_never_evict(newest in any::<u16>(), laps in 1u16..64) {
            let mut tracker = LossStatisticsTracker::with_history(16);
            let newest = SeqNumber::new(newest);
            prop_assert!(tracker.assume_packet_lost(ms(0), newest));

            for lap in 1..=laps {
                let older = newest - lap * 16;
                prop_assert_eq!(tracker.on_packet_received(ms(1), older), Reception::Stale);
                prop_assert!(tracker.is_packet_assumed_lost(newest));
            }
            prop_assert_eq!(tracker.stats().stale, laps as u64);
            prop_assert_eq!(tracker.stats().confirmed_lost, 0);
        }
    }
}
