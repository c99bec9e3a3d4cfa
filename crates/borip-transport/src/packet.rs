//! BorIP data-plane packet header.
//!
//! When `HEADER` is `ON`, every UDP datagram starts with a 4-byte header:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 1 | flags |
//! | 1 | 1 | notification |
//! | 2 | 2 | packet index, little-endian, wrapping |
//!
//! The index lets the receiver count dropped datagrams; the flags mark stream
//! boundaries and sample loss on the sending side.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use borip_core::stream::Overrun;

/// Size of the packet header in bytes.
pub const HEADER_LEN: usize = 4;

/// Header flag set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const NONE: Self = Self(0x00);
    pub const HARDWARE_OVERRUN: Self = Self(0x01);
    pub const NETWORK_OVERRUN: Self = Self(0x02);
    pub const BUFFER_OVERRUN: Self = Self(0x04);
    pub const EMPTY_PAYLOAD: Self = Self(0x08);
    pub const STREAM_START: Self = Self(0x10);
    pub const STREAM_END: Self = Self(0x20);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl From<Overrun> for PacketFlags {
    fn from(kind: Overrun) -> Self {
        match kind {
            Overrun::Hardware => PacketFlags::HARDWARE_OVERRUN,
            Overrun::Network => PacketFlags::NETWORK_OVERRUN,
            Overrun::Buffer => PacketFlags::BUFFER_OVERRUN,
        }
    }
}

impl BitOr for PacketFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PacketFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for PacketFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketFlags(0x{:02X})", self.0)
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub flags: PacketFlags,
    pub notification: u8,
    pub idx: u16,
}

impl PacketHeader {
    pub fn new(flags: PacketFlags, idx: u16) -> Self {
        Self {
            flags,
            notification: 0,
            idx,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let idx = self.idx.to_le_bytes();
        [self.flags.bits(), self.notification, idx[0], idx[1]]
    }

    /// Decode the header at the start of `datagram`. Returns `None` if the
    /// datagram is shorter than a header.
    pub fn decode(datagram: &[u8]) -> Option<Self> {
        let bytes: &[u8; HEADER_LEN] = datagram.get(..HEADER_LEN)?.try_into().ok()?;
        Some(Self {
            flags: PacketFlags::from_bits(bytes[0]),
            notification: bytes[1],
            idx: u16::from_le_bytes([bytes[2], bytes[3]]),
        })
    }
}

/// Tracks packet indices on the receiving side and counts gaps.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    expected: Option<u16>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a received header and return how many packets were dropped
    /// since the previous one.
    pub fn observe(&mut self, header: &PacketHeader) -> u16 {
        let dropped = match self.expected {
            Some(expected) if !header.flags.contains(PacketFlags::STREAM_START) => {
                header.idx.wrapping_sub(expected)
            }
            _ => 0,
        };
        self.expected = Some(header.idx.wrapping_add(1));
        dropped
    }

    pub fn reset(&mut self) {
        self.expected = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let header = PacketHeader::new(
            PacketFlags::STREAM_START | PacketFlags::HARDWARE_OVERRUN,
            0x1234,
        );
        assert_eq!(header.encode(), [0x11, 0x00, 0x34, 0x12]);
        assert_eq!(PacketHeader::decode(&[0x11, 0x00, 0x34, 0x12, 0xAA]), Some(header));
        assert_eq!(PacketHeader::decode(&[0x11, 0x00, 0x34]), None);
    }

    #[test]
    fn end_of_stream_flags() {
        let flags = PacketFlags::STREAM_END | PacketFlags::EMPTY_PAYLOAD;
        assert_eq!(flags.bits(), 0x28);
        assert!(flags.contains(PacketFlags::STREAM_END));
        assert!(!flags.contains(PacketFlags::STREAM_START));
    }

    #[test]
    fn overrun_maps_to_flag() {
        assert_eq!(PacketFlags::from(Overrun::Network), PacketFlags::NETWORK_OVERRUN);
        assert_eq!(PacketFlags::from(Overrun::Buffer).bits(), 0x04);
    }

    #[test]
    fn sequence_tracker_counts_gaps() {
        let mut tracker = SequenceTracker::new();
        let h = |flags, idx| PacketHeader::new(flags, idx);

        assert_eq!(tracker.observe(&h(PacketFlags::STREAM_START, 7)), 0);
        assert_eq!(tracker.observe(&h(PacketFlags::NONE, 8)), 0);
        assert_eq!(tracker.observe(&h(PacketFlags::NONE, 11)), 2);
        assert_eq!(tracker.observe(&h(PacketFlags::STREAM_START, 0)), 0);
        assert_eq!(tracker.observe(&h(PacketFlags::NONE, 1)), 0);
    }

    #[test]
    fn sequence_tracker_wraps() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(&PacketHeader::new(PacketFlags::NONE, u16::MAX));
        assert_eq!(tracker.observe(&PacketHeader::new(PacketFlags::NONE, 0)), 0);
        assert_eq!(tracker.observe(&PacketHeader::new(PacketFlags::NONE, 3)), 2);
    }
}
