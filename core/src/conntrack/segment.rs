//! Observed TCP segments.

use crate::conntrack::seq::Seq;

use std::time::Instant;

// TCP flags.
pub const FIN: u8 = 0b0000_0001;
pub const SYN: u8 = 0b0000_0010;
pub const RST: u8 = 0b0000_0100;
pub const PSH: u8 = 0b0000_1000;
pub const ACK: u8 = 0b0001_0000;
pub const URG: u8 = 0b0010_0000;

/// One observed TCP segment: sequence and acknowledgment numbers, flag
/// bits, payload bytes, and the capture timestamp.
///
/// Link-layer and IP parsing happen upstream; the assembler only sees this
/// transport-layer view.
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    /// Raw sequence number of the segment.
    pub seq: Seq,
    /// Raw acknowledgment number.
    pub ack: Seq,
    /// TCP flag bits.
    pub flags: u8,
    /// Payload bytes.
    pub payload: &'a [u8],
    /// Capture timestamp.
    pub seen: Instant,
}

impl<'a> Segment<'a> {
    pub fn new(seq: u32, ack: u32, flags: u8, payload: &'a [u8], seen: Instant) -> Self {
        Segment {
            seq: Seq(seq),
            ack: Seq(ack),
            flags,
            payload,
            seen,
        }
    }

    #[inline]
    pub fn syn(&self) -> bool {
        self.flags & SYN != 0
    }

    #[inline]
    pub fn fin(&self) -> bool {
        self.flags & FIN != 0
    }

    #[inline]
    pub fn rst(&self) -> bool {
        self.flags & RST != 0
    }

    #[inline]
    pub fn has_ack(&self) -> bool {
        self.flags & ACK != 0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
