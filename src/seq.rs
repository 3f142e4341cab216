use std::fmt::{Display, Formatter};

/// A 7-bit link sequence number with wrap-around arithmetic.
///
/// Both sides of the link keep two of these counters - one for the Information
///  frames they originate and one for the Information frames they expect - and
///  all comparisons are modulo 128.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SeqNum(u8);

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNum {
    pub const ZERO: SeqNum = SeqNum(0);
    pub const MODULUS: u8 = 128;
    const MASK: u8 = 0x7f;

    pub fn from_raw(value: u8) -> Self {
        Self(value & Self::MASK)
    }

    pub fn to_raw(&self) -> u8 {
        self.0
    }

    pub fn next(&self) -> SeqNum {
        SeqNum((self.0 + 1) & Self::MASK)
    }

    pub fn prev(&self) -> SeqNum {
        SeqNum(self.0.wrapping_sub(1) & Self::MASK)
    }

    /// Iterate from `self` (inclusive) to `end` (exclusive), wrapping modulo 128.
    /// An empty range if `end == self`, the full cycle minus one otherwise at most.
    pub fn walk_to(self, end: SeqNum) -> impl Iterator<Item = SeqNum> {
        let steps = end.0.wrapping_sub(self.0) & Self::MASK;
        (0..steps).map(move |offset| SeqNum((self.0 + offset) & Self::MASK))
    }
}
