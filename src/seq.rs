use std::fmt::{Display, Formatter};
use std::ops::{Add, AddAssign};

/// Sequence number of a datagram in one direction of one peer connection.
///
/// Sequence numbers are 64 bit internally, so they never wrap in practice. Only the lower 32 bits
///  travel on the wire, and the receiving side reconstructs the full value relative to a
///  reference value it expects to be close (see [SeqNo::from_wire]).
///
/// This is unambiguous as long as the reconstructed value is less than 2^31 away from the
///  reference, which is guaranteed by limiting the receive window.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct SeqNo(u64);

impl Display for SeqNo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNo {
    /// Sequence numbers of data fragments start at 1, so ZERO means 'nothing yet'
    pub const ZERO: SeqNo = SeqNo(0);

    const WIRE_SPAN: u64 = 1 << 32;
    const HALF_WIRE_SPAN: u64 = 1 << 31;

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    /// the part of the sequence number that is transmitted
    pub fn to_wire(&self) -> u32 {
        self.0 as u32
    }

    /// Reconstruct a full sequence number from its 32-bit wire representation, choosing the
    ///  value closest to `reference`
    pub fn from_wire(wire: u32, reference: SeqNo) -> SeqNo {
        let candidate = (reference.0 & !(Self::WIRE_SPAN - 1)) | wire as u64;

        if candidate.saturating_add(Self::HALF_WIRE_SPAN) < reference.0 {
            // the reference is close to the upper end of its 32-bit 'epoch', and the wire value
            //  belongs to the next one
            match candidate.checked_add(Self::WIRE_SPAN) {
                Some(next) => SeqNo(next),
                None => SeqNo(candidate),
            }
        }
        else if candidate > reference.0.saturating_add(Self::HALF_WIRE_SPAN) && candidate >= Self::WIRE_SPAN {
            SeqNo(candidate - Self::WIRE_SPAN)
        }
        else {
            SeqNo(candidate)
        }
    }

    pub fn next(&self) -> SeqNo {
        SeqNo(self.0 + 1)
    }

    pub fn checked_sub(&self, other: u64) -> Option<SeqNo> {
        self.0.checked_sub(other).map(SeqNo)
    }

    /// number of sequence numbers from `other` (excl) up to self (incl), or 0 if `other` is
    ///  not smaller
    pub fn distance_from(&self, other: SeqNo) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl Add<u64> for SeqNo {
    type Output = SeqNo;

    fn add(self, rhs: u64) -> Self::Output {
        SeqNo(self.0 + rhs)
    }
}

impl AddAssign<u64> for SeqNo {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}
