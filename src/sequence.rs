use std::fmt::{Display, Formatter};
use std::ops::{Add, AddAssign, Sub};

/// Sequence number of a DATA frame. Sequence numbers are 16 bit and wrap around, so they are
///  deliberately not `Ord`: comparisons only make sense relative to a window base, see
///  [SeqNum::distance_from] and [SeqNum::is_in_window].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct SeqNum(u16);

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNum {
    pub const ZERO: SeqNum = SeqNum(0);

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    pub fn next(&self) -> SeqNum {
        SeqNum(self.0.wrapping_add(1))
    }

    pub fn prev(&self) -> SeqNum {
        SeqNum(self.0.wrapping_sub(1))
    }

    /// number of steps forward from `base` to `self`, modulo 2^16
    pub fn distance_from(&self, base: SeqNum) -> u16 {
        self.0.wrapping_sub(base.0)
    }

    /// true iff `self` is one of the `size` sequence numbers starting at `base`
    pub fn is_in_window(&self, base: SeqNum, size: u16) -> bool {
        self.distance_from(base) < size
    }
}

impl Add<u16> for SeqNum {
    type Output = SeqNum;

    fn add(self, rhs: u16) -> Self::Output {
        SeqNum(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u16> for SeqNum {
    fn add_assign(&mut self, rhs: u16) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<u16> for SeqNum {
    type Output = SeqNum;

    fn sub(self, rhs: u16) -> Self::Output {
        SeqNum(self.0.wrapping_sub(rhs))
    }
}
