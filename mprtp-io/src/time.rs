//! Time utilities for the loss-detection engine
//!
//! All estimator decisions are made against explicit timestamps handed in by the
//! event loop, so the same code runs against a wall clock or a simulated one.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::time::{Duration, Instant};

/// Monotonic timestamp in microseconds since a session epoch
///
/// The epoch is arbitrary (session start in a live stack, zero in a
/// simulation). Subtraction saturates at zero so that reordered events never
/// produce a negative interval.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The session epoch
    pub const ZERO: Timestamp = Timestamp(0);

    /// Create a timestamp from microseconds since the epoch
    #[inline]
    pub const fn from_micros(micros: u64) -> Self {
        Timestamp(micros)
    }

    /// Create a timestamp from milliseconds since the epoch
    #[inline]
    pub const fn from_millis(millis: u64) -> Self {
        Timestamp(millis * 1_000)
    }

    /// Timestamp of `instant` relative to `epoch`
    ///
    /// Instants before the epoch map to the epoch itself.
    pub fn from_instant(epoch: Instant, instant: Instant) -> Self {
        let micros = instant
            .saturating_duration_since(epoch)
            .as_micros()
            .try_into()
            .unwrap_or(u64::MAX);
        Timestamp(micros)
    }

    /// Microseconds since the epoch
    #[inline]
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Duration elapsed since `earlier`, zero if `earlier` is later
    #[inline]
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }

    /// Signed microsecond difference `self - other`
    #[inline]
    pub fn signed_micros_since(self, other: Timestamp) -> i64 {
        self.0 as i64 - other.0 as i64
    }

    /// Shift by a signed number of microseconds, clamped at the epoch
    pub fn offset_micros(self, micros: i64) -> Timestamp {
        if micros >= 0 {
            Timestamp(self.0.saturating_add(micros as u64))
        } else {
            Timestamp(self.0.saturating_sub(micros.unsigned_abs()))
        }
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}us)", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}ms", self.0 / 1_000, self.0 % 1_000)
    }
}

fn duration_micros(duration: Duration) -> u64 {
    duration.as_micros().try_into().unwrap_or(u64::MAX)
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, duration: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(duration_micros(duration)))
    }
}

impl AddAssign<Duration> for Timestamp {
    fn add_assign(&mut self, duration: Duration) {
        *self = *self + duration;
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, duration: Duration) -> Timestamp {
        Timestamp(self.0.saturating_sub(duration_micros(duration)))
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    fn sub(self, other: Timestamp) -> Duration {
        self.saturating_duration_since(other)
    }
}

/// Timer for periodic operations
///
/// Used for the feedback reporting interval: the reporter drains pending
/// NACK/ACK lists each time the timer fires.
#[derive(Debug, Clone)]
pub struct IntervalTimer {
    interval: Duration,
    last_fire: Timestamp,
}

impl IntervalTimer {
    /// Create a new timer with the given interval, starting at `start`
    pub fn new(interval: Duration, start: Timestamp) -> Self {
        IntervalTimer {
            interval,
            last_fire: start,
        }
    }

    /// Configured interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Check if the timer has expired at `now`
    pub fn expired(&self, now: Timestamp) -> bool {
        now - self.last_fire >= self.interval
    }

    /// Reset the timer to start counting from `now`
    pub fn reset(&mut self, now: Timestamp) {
        self.last_fire = now;
    }

    /// Next expiration time
    pub fn next_expiration(&self) -> Timestamp {
        self.last_fire + self.interval
    }

    /// Get time until next expiration
    pub fn time_until_expiration(&self, now: Timestamp) -> Duration {
        self.next_expiration() - now
    }

    /// Fire the timer if expired, returning true if it fired
    ///
    /// The next period is anchored on the nominal expiration, not on `now`, so
    /// a late poll does not stretch the reporting cadence.
    pub fn try_fire(&mut self, now: Timestamp) -> bool {
        if !self.expired(now) {
            return false;
        }
        self.last_fire = self.next_expiration();
        if self.expired(now) {
            // Fell more than one period behind; resynchronise.
            self.last_fire = now;
        }
        true
    }
}
