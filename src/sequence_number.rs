use std::fmt::{Debug, Display, Formatter};
use std::ops::{Add, AddAssign};

/// Per-circuit datagram sequence number. Arithmetic wraps at 2^32.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SequenceNumber(u32);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl SequenceNumber {
    /// Sequence numbers on a fresh circuit start here. Zero is never sent, [Self::next] skips it
    ///  when the counter wraps.
    pub const FIRST: SequenceNumber = SequenceNumber(1);

    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> SequenceNumber {
        match *self + 1 {
            SequenceNumber(0) => Self::FIRST,
            next => next,
        }
    }

    /// Wrap-aware 'newer than': `self` is considered newer if it is less than half the number
    ///  space ahead of `other`
    pub fn is_newer_than(&self, other: SequenceNumber) -> bool {
        let diff = self.0.wrapping_sub(other.0);
        diff != 0 && diff < 0x8000_0000
    }
}

impl Add<u32> for SequenceNumber {
    type Output = SequenceNumber;

    fn add(self, rhs: u32) -> Self::Output {
        SequenceNumber(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u32> for SequenceNumber {
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}
