use std::fmt::{Debug, Display, Formatter};

/// Packet sequence number, 31 bits with wrap-around.
///
/// The derived `Ord` is the raw numeric order and is meant for use as a
///  container key only: the protocol-level "is a before b" question is
///  answered by [`PacketId::blind_diff`], which interprets the distance of
///  two ids in the window (-2^30, +2^30]. Distances outside that window are
///  meaningless, so callers must keep live ids reasonably close together
///  (the flow window takes care of that).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PacketId(u32);

impl Display for PacketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl Debug for PacketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl PacketId {
    pub const ZERO: PacketId = PacketId(0);

    const MASK: u32 = 0x7fff_ffff;
    const HALF: u32 = 0x4000_0000;

    pub fn from_raw(value: u32) -> Self {
        PacketId(value & Self::MASK)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> PacketId {
        PacketId(self.0.wrapping_add(1) & Self::MASK)
    }

    pub fn prev(&self) -> PacketId {
        PacketId(self.0.wrapping_sub(1) & Self::MASK)
    }

    /// Signed modular distance `self - other`, interpreted in (-2^30, +2^30].
    ///
    /// `self` is after `other` iff the result is positive.
    pub fn blind_diff(self, other: PacketId) -> i32 {
        let d = self.0.wrapping_sub(other.0) & Self::MASK;
        if d <= Self::HALF {
            d as i32
        }
        else {
            ((d as i64) - 0x8000_0000) as i32
        }
    }
}


/// Message sequence number: a plain 32-bit wrapping counter. On the wire
///  only the low 29 bits of a data packet's message number are carried.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SequenceNumber(u32);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn from_raw(value: u32) -> Self {
        SequenceNumber(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_add(1))
    }
}
