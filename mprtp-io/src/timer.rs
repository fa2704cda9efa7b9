//! Keyed timer queue
//!
//! The event loop's timer service. Timers live in an arena of generational
//! slots and are addressed either by a caller-chosen key or by the
//! [`TimerHandle`] returned when they were armed. Arming a key that already has
//! a live timer replaces it, so "cancel then re-arm" is a single call and at
//! most one timer per key can ever be outstanding.
//!
//! A handle from a cancelled or replaced timer is stale: its slot generation
//! has moved on, so it can neither fire nor cancel the slot's new occupant.

use crate::time::Timestamp;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::hash::Hash;
use thiserror::Error;

/// Timer queue errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
    #[error("Timer handle {0:?} is stale")]
    StaleHandle(TimerHandle),
}

/// Generational reference to an armed timer
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle {
    index: u32,
    generation: u32,
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimerHandle({}v{})", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<K> {
    generation: u32,
    entry: Option<(K, Timestamp)>,
}

/// Heap entry: deadline, then arming order for FIFO among equal deadlines
type HeapEntry = Reverse<(Timestamp, u64, TimerHandle)>;

/// Timer queue keyed by `K`
pub struct TimerQueue<K> {
    slots: Vec<Slot<K>>,
    free: Vec<u32>,
    by_key: HashMap<K, TimerHandle>,
    heap: BinaryHeap<HeapEntry>,
    next_order: u64,
}

impl<K> TimerQueue<K>
where
    K: Copy + Eq + Hash + fmt::Debug,
{
    /// Create an empty timer queue
    pub fn new() -> Self {
        TimerQueue {
            slots: Vec::new(),
            free: Vec::new(),
            by_key: HashMap::new(),
            heap: BinaryHeap::new(),
            next_order: 0,
        }
    }

    /// Arm a timer for `key` at `deadline`, replacing any live timer for `key`
    pub fn arm(&mut self, key: K, deadline: Timestamp) -> TimerHandle {
        self.cancel(&key);

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.entry = Some((key, deadline));
        let handle = TimerHandle {
            index,
            generation: slot.generation,
        };

        self.by_key.insert(key, handle);
        self.heap
            .push(Reverse((deadline, self.next_order, handle)));
        self.next_order += 1;
        self.maybe_compact();

        tracing::trace!("armed {:?} at {} ({:?})", key, deadline, handle);
        handle
    }

    /// Cancel the live timer for `key`
    ///
    /// Returns false if no timer was armed for it. Cancelling is always safe,
    /// including for a timer that has already been popped.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.by_key.remove(key) {
            Some(handle) => {
                self.release(handle);
                true
            }
            None => false,
        }
    }

    /// Cancel a timer by handle, returning its key
    pub fn cancel_handle(&mut self, handle: TimerHandle) -> Result<K, TimerError> {
        let key = self
            .live_entry(handle)
            .map(|(key, _)| key)
            .ok_or(TimerError::StaleHandle(handle))?;
        self.by_key.remove(&key);
        self.release(handle);
        Ok(key)
    }

    /// Check whether a timer is armed for `key`
    pub fn is_armed(&self, key: &K) -> bool {
        self.by_key.contains_key(key)
    }

    /// Deadline of the live timer for `key`
    pub fn deadline(&self, key: &K) -> Option<Timestamp> {
        let handle = *self.by_key.get(key)?;
        self.live_entry(handle).map(|(_, deadline)| deadline)
    }

    /// Whether `handle` still refers to a live timer
    pub fn is_live(&self, handle: TimerHandle) -> bool {
        self.live_entry(handle).is_some()
    }

    /// Earliest deadline among live timers
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.by_key
            .values()
            .filter_map(|&handle| self.live_entry(handle))
            .map(|(_, deadline)| deadline)
            .min()
    }

    /// Pop the earliest timer whose deadline is at or before `now`
    ///
    /// Timers are returned one at a time so that a handler arming a new,
    /// already-expired timer sees it fire in deadline order on the next call.
    pub fn pop_expired(&mut self, now: Timestamp) -> Option<(K, Timestamp)> {
        while let Some(Reverse((deadline, _, handle))) = self.heap.peek().copied() {
            if deadline > now {
                return None;
            }
            self.heap.pop();

            if let Some((key, _)) = self.live_entry(handle) {
                self.by_key.remove(&key);
                self.release(handle);
                return Some((key, deadline));
            }
        }
        None
    }

    /// Keys of all live timers
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.by_key.keys()
    }

    /// Number of live timers
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Check if no timer is armed
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Cancel every timer
    pub fn clear(&mut self) {
        let handles: Vec<TimerHandle> = self.by_key.drain().map(|(_, h)| h).collect();
        for handle in handles {
            self.release(handle);
        }
        self.heap.clear();
    }

    fn live_entry(&self, handle: TimerHandle) -> Option<(K, Timestamp)> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry
    }

    fn release(&mut self, handle: TimerHandle) {
        if let Some(slot) = self.slots.get_mut(handle.index as usize) {
            if slot.generation == handle.generation {
                slot.entry = None;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(handle.index);
            }
        }
    }

    /// Drop heap entries of cancelled timers once they dominate the heap
    fn maybe_compact(&mut self) {
        if self.heap.len() <= 64 + 4 * self.by_key.len() {
            return;
        }
        let live: Vec<HeapEntry> = self
            .heap
            .drain()
            .filter(|Reverse((_, _, handle))| {
                let slot = &self.slots[handle.index as usize];
                slot.generation == handle.generation && slot.entry.is_some()
            })
            .collect();
        self.heap = live.into();
    }
}

impl<K> Default for TimerQueue<K>
where
    K: Copy + Eq + Hash + fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K: fmt::Debug> fmt::Debug for TimerQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("armed", &self.by_key.len())
            .field("heap", &self.heap.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ts(ms: u64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    #[test]
    fn test_pop_in_deadline_order() {
        let mut queue = TimerQueue::new();
        queue.arm("b", ts(20));
        queue.arm("a", ts(10));
        queue.arm("c", ts(30));

        assert_eq!(queue.next_deadline(), Some(ts(10)));
        assert_eq!(queue.pop_expired(ts(25)), Some(("a", ts(10))));
        assert_eq!(queue.pop_expired(ts(25)), Some(("b", ts(20))));
        assert_eq!(queue.pop_expired(ts(25)), None);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_rearm_replaces() {
        let mut queue = TimerQueue::new();
        let first = queue.arm(1u16, ts(10));
        let second = queue.arm(1u16, ts(50));

        assert_eq!(queue.len(), 1);
        assert!(!queue.is_live(first));
        assert!(queue.is_live(second));
        assert_eq!(queue.deadline(&1), Some(ts(50)));

        // The replaced deadline never fires
        assert_eq!(queue.pop_expired(ts(40)), None);
        assert_eq!(queue.pop_expired(ts(50)), Some((1, ts(50))));
    }

    #[test]
    fn test_cancel() {
        let mut queue = TimerQueue::new();
        queue.arm('x', ts(10));
        assert!(queue.cancel(&'x'));
        assert!(!queue.cancel(&'x'));
        assert!(queue.is_empty());
        assert_eq!(queue.pop_expired(ts(100)), None);
    }

    #[test]
    fn test_stale_handle_cannot_cancel_new_occupant() {
        let mut queue = TimerQueue::new();
        let old = queue.arm(1u32, ts(10));
        queue.cancel(&1);

        // Slot is reused with a bumped generation
        let new = queue.arm(2u32, ts(20));
        assert_eq!(queue.cancel_handle(old), Err(TimerError::StaleHandle(old)));
        assert!(queue.is_armed(&2));
        assert_eq!(queue.cancel_handle(new), Ok(2));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_equal_deadlines_fifo() {
        let mut queue = TimerQueue::new();
        queue.arm(3u8, ts(10));
        queue.arm(1u8, ts(10));
        queue.arm(2u8, ts(10));

        let order: Vec<u8> = std::iter::from_fn(|| queue.pop_expired(ts(10)))
            .map(|(k, _)| k)
            .collect();
        assert_eq!(order, vec![3, 1, 2]);
    }

    #[test]
    fn test_heap_compaction_keeps_live_timers() {
        let mut queue = TimerQueue::new();
        for i in 0..1_000u64 {
            queue.arm(0u8, ts(1_000 + i));
        }
        queue.arm(1u8, ts(5));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_expired(ts(5)), Some((1, ts(5))));
        assert_eq!(queue.pop_expired(ts(5_000)), Some((0, ts(1_999))));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut queue = TimerQueue::new();
        let handle = queue.arm(1u8, ts(1));
        queue.arm(2u8, ts(2));
        queue.clear();

        assert!(queue.is_empty());
        assert!(!queue.is_live(handle));
        assert_eq!(queue.pop_expired(ts(10)), None);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Arm(u8, u64),
        Cancel(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0u8..8, 0u64..1_000).prop_map(|(k, d)| Op::Arm(k, d)),
            1 => (0u8..8).prop_map(Op::Cancel),
        ]
    }

    proptest! {
        #[test]
        fn prop_pops_live_timers_in_deadline_order(
            ops in prop::collection::vec(op_strategy(), 1..200),
        ) {
            let mut queue = TimerQueue::new();
            let mut model = HashMap::new();
            for op in ops {
                match op {
                    Op::Arm(key, deadline) => {
                        queue.arm(key, ts(deadline));
                        model.insert(key, ts(deadline));
                    }
                    Op::Cancel(key) => {
                        prop_assert_eq!(queue.cancel(&key), model.remove(&key).is_some());
                    }
                }
            }
            prop_assert_eq!(queue.len(), model.len());
            prop_assert_eq!(queue.next_deadline(), model.values().min().copied());

            let mut last = Timestamp::ZERO;
            while let Some((key, deadline)) = queue.pop_expired(ts(1_000)) {
                prop_assert!(deadline >= last);
                prop_assert_eq!(model.remove(&key), Some(deadline));
                last = deadline;
            }
            prop_assert!(model.is_empty());
        }
    }
}
