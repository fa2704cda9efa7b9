//! MPRTP timing primitives
//!
//! This crate provides the clock and timer abstractions the loss-detection
//! engine runs on: microsecond timestamps, a keyed timer queue with
//! generational handles, and a periodic interval timer.

pub mod time;
pub mod timer;

pub use time::{IntervalTimer, Timestamp};
pub use timer::{TimerError, TimerHandle, TimerQueue};
