//! Sequence Id Handling
//!
//! D2DP numbers stream bytes with 32-bit counters that wrap around. Two ids
//! are compared on the circle: `a` is before `b` when the forward distance
//! from `a` to `b` is shorter than half of the number space.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// Half of the sequence space (2^31)
pub const HALF_RANGE: u32 = 0x8000_0000;

/// 32-bit sequence id with circular comparison
///
/// `SeqId` deliberately does not implement `Ord`: the circular order is not
/// transitive over the whole number space, so it must not leak into sorted
/// collections.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct SeqId(u32);

impl SeqId {
    /// Create a new sequence id
    #[inline]
    pub const fn new(value: u32) -> Self {
        SeqId(value)
    }

    /// Get the raw value
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Signed circular distance `self - other`
    ///
    /// For the antipodal pair (`self - other == 2^31`) the result is
    /// `i32::MIN` in both directions, so each of the two values is reported
    /// as "not after" the other.
    #[inline]
    pub fn sub(self, other: SeqId) -> i32 {
        let diff = self.0.wrapping_sub(other.0);
        if diff == HALF_RANGE {
            i32::MIN
        } else {
            diff as i32
        }
    }

    #[inline]
    pub fn eq(self, other: SeqId) -> bool {
        self.sub(other) == 0
    }

    #[inline]
    pub fn lt(self, other: SeqId) -> bool {
        self.sub(other) < 0
    }

    #[inline]
    pub fn le(self, other: SeqId) -> bool {
        self.sub(other) <= 0
    }

    #[inline]
    pub fn gt(self, other: SeqId) -> bool {
        self.sub(other) > 0
    }

    #[inline]
    pub fn ge(self, other: SeqId) -> bool {
        self.sub(other) >= 0
    }
}

impl fmt::Debug for SeqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeqId({})", self.0)
    }
}

impl fmt::Display for SeqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SeqId {
    fn from(value: u32) -> Self {
        SeqId(value)
    }
}

impl From<SeqId> for u32 {
    fn from(seq: SeqId) -> u32 {
        seq.0
    }
}

impl Add<u32> for SeqId {
    type Output = SeqId;

    fn add(self, rhs: u32) -> SeqId {
        SeqId(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u32> for SeqId {
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<u32> for SeqId {
    type Output = SeqId;

    fn sub(self, rhs: u32) -> SeqId {
        SeqId(self.0.wrapping_sub(rhs))
    }
}
