//! Sequence Number Handling
//!
//! RTP uses 16-bit sequence numbers that wrap around. This module provides a
//! wrapped sequence number type whose ordering and distance account for the
//! wrap, so that "max received" bookkeeping never compares raw values.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Size of the sequence space
pub const SEQ_SPACE: u32 = 1 << 16;

/// Half of the sequence space; forward distances below this are "newer"
pub const HALF_SEQ_SPACE: u16 = 1 << 15;

/// Sequence number with 16-bit wraparound semantics
///
/// `a` is newer than `b` when `(a - b) mod 65536` lies in `1..32768`.
/// The derived `Ord` is raw numeric order and only suitable for keying
/// containers; use [`SeqNumber::is_newer`] and friends for protocol ordering.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct SeqNumber(u16);

impl SeqNumber {
    /// Create a new sequence number
    #[inline]
    pub const fn new(value: u16) -> Self {
        SeqNumber(value)
    }

    /// Create a sequence number from a wider value, keeping the low 16 bits
    #[inline]
    pub const fn from_wrapping(value: u32) -> Self {
        SeqNumber(value as u16)
    }

    /// Get the raw sequence number value
    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    /// Increment the sequence number by 1
    #[inline]
    pub fn increment(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }

    /// Get the next sequence number
    #[inline]
    pub fn next(self) -> Self {
        SeqNumber(self.0.wrapping_add(1))
    }

    /// Get the previous sequence number
    #[inline]
    pub fn prev(self) -> Self {
        SeqNumber(self.0.wrapping_sub(1))
    }

    /// Signed forward distance from this sequence number to `other`
    ///
    /// Positive values mean `other` is ahead of `self`. The result lies in
    /// `-32768..=32767`; the exact half-space distance is reported negative,
    /// matching [`SeqNumber::is_newer`] which does not treat it as newer.
    #[inline]
    pub fn distance_to(self, other: SeqNumber) -> i32 {
        other.0.wrapping_sub(self.0) as i16 as i32
    }

    /// Check if this sequence number is newer than `other`
    #[inline]
    pub fn is_newer(self, other: SeqNumber) -> bool {
        is_newer(self, other)
    }

    /// Check if this sequence number is newer than or equal to `other`
    #[inline]
    pub fn is_newer_or_equal(self, other: SeqNumber) -> bool {
        self == other || is_newer(self, other)
    }

    /// Check if this sequence number is older than `other`
    #[inline]
    pub fn is_older(self, other: SeqNumber) -> bool {
        is_newer(other, self)
    }

    /// Iterate the sequence numbers strictly between `self` and `end`
    ///
    /// Empty when `end` is not newer than `self.next()`.
    pub fn range_exclusive(self, end: SeqNumber) -> impl Iterator<Item = SeqNumber> {
        let count = self.distance_to(end).max(1) - 1;
        let start = self;
        (1..=count).map(move |i| start + i as u16)
    }
}

/// `a` is newer than `b` under 16-bit wraparound
#[inline]
pub fn is_newer(a: SeqNumber, b: SeqNumber) -> bool {
    let diff = a.0.wrapping_sub(b.0);
    diff != 0 && diff < HALF_SEQ_SPACE
}

/// Signed forward distance from `a` to `b`
#[inline]
pub fn distance(a: SeqNumber, b: SeqNumber) -> i32 {
    a.distance_to(b)
}

/// The newer of two sequence numbers
#[inline]
pub fn newest(a: SeqNumber, b: SeqNumber) -> SeqNumber {
    if is_newer(b, a) {
        b
    } else {
        a
    }
}

impl fmt::Debug for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeqNumber({})", self.0)
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for SeqNumber {
    fn from(value: u16) -> Self {
        SeqNumber(value)
    }
}

impl From<SeqNumber> for u16 {
    fn from(seq: SeqNumber) -> u16 {
        seq.0
    }
}

impl Add<u16> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: u16) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u16> for SeqNumber {
    fn add_assign(&mut self, rhs: u16) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<u16> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: u16) -> SeqNumber {
        SeqNumber(self.0.wrapping_sub(rhs))
    }
}

impl SubAssign<u16> for SeqNumber {
    fn sub_assign(&mut self, rhs: u16) {
        self.0 = self.0.wrapping_sub(rhs);
    }
}

impl Sub for SeqNumber {
    type Output = i32;

    /// Signed distance `self - rhs`
    fn sub(self, rhs: SeqNumber) -> i32 {
        rhs.distance_to(self)
    }
}
