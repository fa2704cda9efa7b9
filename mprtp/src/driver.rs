//! Estimator driver
//!
//! Owns one estimator and its timers. Applies the estimator's actions to a
//! [`TimerQueue`], fires expired timers in deadline order, and delivers
//! events both to registered handlers and back to the caller.
//!
//! Ordering: on an arrival at `now`, timers due strictly before `now` fire
//! first; a timer due exactly at `now` loses to the arrival, which cancels or
//! re-arms it synchronously.

use crate::any::AnyEstimator;
use mprtp_io::{Timestamp, TimerQueue};
use mprtp_protocol::{Action, Arrival, Estimator, EstimatorEvent, TimerKey};
use std::fmt;

/// Callback invoked for each delivered event
pub type EventHandler = Box<dyn FnMut(Timestamp, &EstimatorEvent) + Send>;

/// Event-loop glue for one estimator
pub struct EstimatorDriver<E = AnyEstimator> {
    estimator: E,
    timers: TimerQueue<TimerKey>,
    actions: Vec<Action>,
    lost_handler: Option<EventHandler>,
    false_positive_handler: Option<EventHandler>,
}

impl<E: Estimator> EstimatorDriver<E> {
    /// Wrap an estimator
    pub fn new(estimator: E) -> Self {
        EstimatorDriver {
            estimator,
            timers: TimerQueue::new(),
            actions: Vec::with_capacity(8),
            lost_handler: None,
            false_positive_handler: None,
        }
    }

    /// Register the handler for `Lost` events
    pub fn set_lost_handler<F>(&mut self, handler: F)
    where
        F: FnMut(Timestamp, &EstimatorEvent) + Send + 'static,
    {
        self.lost_handler = Some(Box::new(handler));
    }

    /// Register the handler for `FalsePositive` events
    pub fn set_false_positive_handler<F>(&mut self, handler: F)
    where
        F: FnMut(Timestamp, &EstimatorEvent) + Send + 'static,
    {
        self.false_positive_handler = Some(Box::new(handler));
    }

    /// The wrapped estimator
    pub fn estimator(&self) -> &E {
        &self.estimator
    }

    /// The wrapped estimator, mutably
    ///
    /// Actions produced by calling into it directly are not applied; use the
    /// driver's own entry points for anything that may arm timers.
    pub fn estimator_mut(&mut self) -> &mut E {
        &mut self.estimator
    }

    /// Deliver an original packet arrival
    pub fn on_packet_arrival(&mut self, now: Timestamp, arrival: &Arrival) -> Vec<EstimatorEvent> {
        let mut events = self.fire_before(now);
        self.estimator
            .on_packet_arrival(now, arrival, &mut self.actions);
        self.apply(now, &mut events);
        events
    }

    /// Deliver a retransmitted packet arrival
    pub fn on_rtx_packet_arrival(
        &mut self,
        now: Timestamp,
        arrival: &Arrival,
    ) -> Vec<EstimatorEvent> {
        let mut events = self.fire_before(now);
        self.estimator
            .on_rtx_packet_arrival(now, arrival, &mut self.actions);
        self.apply(now, &mut events);
        events
    }

    /// Fire every timer due at or before `now`
    pub fn poll_timers(&mut self, now: Timestamp) -> Vec<EstimatorEvent> {
        let mut events = Vec::new();
        while let Some((key, deadline)) = self.timers.pop_expired(now) {
            self.fire(key, deadline, &mut events);
        }
        events
    }

    /// Earliest armed deadline
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.timers.next_deadline()
    }

    /// Whether a timer is armed for `key`
    pub fn has_timer(&self, key: &TimerKey) -> bool {
        self.timers.is_armed(key)
    }

    /// Number of armed timers
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Reset the estimator and drop its timers
    pub fn reset(&mut self) {
        self.estimator.reset(&mut self.actions);
        self.actions.clear();
        self.timers.clear();
    }

    /// Stop the estimator and drop its timers
    pub fn stop(&mut self) {
        self.estimator.stop(&mut self.actions);
        self.actions.clear();
        self.timers.clear();
    }

    fn fire_before(&mut self, now: Timestamp) -> Vec<EstimatorEvent> {
        let mut events = Vec::new();
        while let Some(deadline) = self.timers.next_deadline() {
            if deadline >= now {
                break;
            }
            match self.timers.pop_expired(deadline) {
                Some((key, deadline)) => self.fire(key, deadline, &mut events),
                None => break,
            }
        }
        events
    }

    /// Run an expiry handler at the timer's own deadline
    fn fire(&mut self, key: TimerKey, deadline: Timestamp, events: &mut Vec<EstimatorEvent>) {
        tracing::trace!("{:?} fired at {}", key, deadline);
        self.estimator.on_timeout(deadline, key, &mut self.actions);
        self.apply(deadline, events);
    }

    fn apply(&mut self, now: Timestamp, events: &mut Vec<EstimatorEvent>) {
        for action in self.actions.drain(..) {
            match action {
                Action::ArmTimer { key, deadline } => {
                    self.timers.arm(key, deadline);
                }
                Action::CancelTimer(key) => {
                    self.timers.cancel(&key);
                }
                Action::Emit(event) => {
                    let handler = match event {
                        EstimatorEvent::Lost { .. } => self.lost_handler.as_mut(),
                        EstimatorEvent::FalsePositive { .. } => {
                            self.false_positive_handler.as_mut()
                        }
                    };
                    if let Some(handler) = handler {
                        handler(now, &event);
                    }
                    events.push(event);
                }
            }
        }
    }
}

impl<E: fmt::Debug> fmt::Debug for EstimatorDriver<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EstimatorDriver")
            .field("estimator", &self.estimator)
            .field("timers", &self.timers)
            .field("lost_handler", &self.lost_handler.is_some())
            .field("false_positive_handler", &self.false_positive_handler.is_some())
            .finish()
    }
}
