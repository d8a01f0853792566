//! Wrapping sequence numbers
//!
//! Every sequence-consuming datagram (handshake, keepalive, data) carries a
//! 32-bit sequence number. Comparisons are modular: the half-space before a
//! reference value counts as older, the half-space after it as newer.

use std::fmt;

/// Half of the 32-bit sequence space; the boundary of "older than".
const HALF_SPACE: u32 = 1 << 31;

/// A wrapping 32-bit sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SequenceNumber(u32);

impl SequenceNumber {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Uniformly random initial value for a new connection.
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// Modular successor.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Modular less-than: `self` is older than `other` when the wrapping
    /// distance from `self` to `other` lies in (0, 2^31].
    pub fn is_before(self, other: SequenceNumber) -> bool {
        let distance = other.0.wrapping_sub(self.0);
        distance != 0 && distance <= HALF_SPACE
    }

    /// Modular less-than-or-equal; cumulative acknowledgements compare
    /// queued sequences against the acked value with this.
    pub fn is_before_or_eq(self, other: SequenceNumber) -> bool {
        self == other || self.is_before(other)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_wraps() {
        assert_eq!(SequenceNumber::new(0).next(), SequenceNumber::new(1));
        assert_eq!(SequenceNumber::new(u32::MAX).next(), SequenceNumber::new(0));
    }

    #[test]
    fn test_is_before() {
        let a = SequenceNumber::new(10);
        let b = SequenceNumber::new(20);
        assert!(a.is_before(b));
        assert!(!b.is_before(a));
        assert!(!a.is_before(a));
    }

    #[test]
    fn test_is_before_across_wrap() {
        let high = SequenceNumber::new(u32::MAX - 2);
        let low = SequenceNumber::new(5);
        assert!(high.is_before(low));
        assert!(!low.is_before(high));
    }

    #[test]
    fn test_half_space_boundary() {
        let origin = SequenceNumber::new(0);
        // Exactly half the space away still counts as newer.
        assert!(origin.is_before(SequenceNumber::new(HALF_SPACE)));
        // One past the half-space boundary counts as older.
        assert!(!origin.is_before(SequenceNumber::new(HALF_SPACE + 1)));
    }

    #[test]
    fn test_is_before_or_eq() {
        let s = SequenceNumber::new(42);
        assert!(s.is_before_or_eq(s));
        assert!(s.is_before_or_eq(s.next()));
        assert!(!s.next().is_before_or_eq(s));
    }
}
