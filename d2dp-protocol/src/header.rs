//! D2DP Frame Header
//!
//! Every datagram starts with a fixed 16-byte header in network byte order:
//!
//! ```text
//!  0               1               2               3
//! +-------+-------+---------------+-------------------------------+
//! | ver   | flags                 | length / SACK count           |
//! +-------+-----------------------+-------------------------------+
//! | sequence id / cumulative ack                                  |
//! +---------------------------------------------------------------+
//! | packet id (64 bits)                                           |
//! +---------------------------------------------------------------+
//! ```
//!
//! DATA frames carry `length` payload bytes after the header. ACK frames carry
//! `count` SACK pairs `(left, right)` instead, each a closed interval of
//! sequence ids received out of order.

use crate::params::{HEADER_SIZE, MAX_SACK_PAIRS, PROTOCOL_VERSION, SACK_PAIR_SIZE};
use crate::wrap::SeqId;
use bytes::{Buf, BufMut};
use thiserror::Error;

/// Frame is an acknowledgement
pub const FLAG_ACK: u16 = 0x0001;

/// Receiver asks the peer to stop sending new data
pub const FLAG_SUSPEND: u16 = 0x0002;

const FLAG_MASK: u16 = 0x0FFF;
const KNOWN_FLAGS: u16 = FLAG_ACK | FLAG_SUSPEND;
const VERSION_SHIFT: u16 = 12;

/// Closed interval `[left, right]` of sequence ids held by the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SackPair {
    pub left: SeqId,
    pub right: SeqId,
}

impl SackPair {
    pub fn new(left: SeqId, right: SeqId) -> Self {
        SackPair { left, right }
    }
}

/// Frame type specific part of the header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    /// Payload of `length` bytes follows the header
    Data { length: u16 },
    /// Acknowledgement with optional selective ranges
    Ack { suspend: bool, sacks: Vec<SackPair> },
}

/// Decoded frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    /// Sequence id of the first payload byte (DATA) or cumulative ack (ACK)
    pub seq_id: SeqId,
    /// Per-direction strictly increasing frame counter
    pub packet_id: u64,
}

impl FrameHeader {
    /// Create a DATA frame header
    pub fn data(seq_id: SeqId, packet_id: u64, length: u16) -> Self {
        FrameHeader {
            kind: FrameKind::Data { length },
            seq_id,
            packet_id,
        }
    }

    /// Create an ACK frame header
    pub fn ack(cumulative: SeqId, packet_id: u64, suspend: bool, sacks: Vec<SackPair>) -> Self {
        FrameHeader {
            kind: FrameKind::Ack { suspend, sacks },
            seq_id: cumulative,
            packet_id,
        }
    }

    #[inline]
    pub fn is_ack(&self) -> bool {
        matches!(self.kind, FrameKind::Ack { .. })
    }

    /// Raw flags field including the version nibble
    pub fn flags(&self) -> u16 {
        let mut flags = (PROTOCOL_VERSION as u16) << VERSION_SHIFT;
        if let FrameKind::Ack { suspend, .. } = &self.kind {
            flags |= FLAG_ACK;
            if *suspend {
                flags |= FLAG_SUSPEND;
            }
        }
        flags
    }

    /// Number of bytes `encode` writes
    pub fn encoded_len(&self) -> usize {
        match &self.kind {
            FrameKind::Data { .. } => HEADER_SIZE,
            FrameKind::Ack { sacks, .. } => HEADER_SIZE + sacks.len() * SACK_PAIR_SIZE,
        }
    }

    /// Serialize the header (and SACK list) into `out`
    ///
    /// Returns the number of bytes written. DATA payload is not written; the
    /// caller places it right after the header.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, HeaderError> {
        let needed = self.encoded_len();
        if out.len() < needed {
            return Err(HeaderError::BufferTooSmall {
                needed,
                available: out.len(),
            });
        }

        let len_or_count = match &self.kind {
            FrameKind::Data { length } => *length,
            FrameKind::Ack { sacks, .. } => {
                if sacks.len() > MAX_SACK_PAIRS {
                    return Err(HeaderError::TooManySackPairs(sacks.len()));
                }
                sacks.len() as u16
            }
        };

        let mut buf = &mut out[..needed];
        buf.put_u16(self.flags());
        buf.put_u16(len_or_count);
        buf.put_u32(self.seq_id.as_raw());
        buf.put_u64(self.packet_id);

        if let FrameKind::Ack { sacks, .. } = &self.kind {
            for pair in sacks {
                buf.put_u32(pair.left.as_raw());
                buf.put_u32(pair.right.as_raw());
            }
        }

        Ok(needed)
    }

    /// Parse and validate a frame
    ///
    /// On success returns the header and the number of bytes it occupies; for
    /// DATA frames the payload is `bytes[consumed..]`. On failure nothing is
    /// consumed.
    pub fn decode(bytes: &[u8], max_payload: usize) -> Result<(Self, usize), HeaderError> {
        if bytes.len() < HEADER_SIZE {
            return Err(HeaderError::Truncated {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let mut buf = &bytes[..HEADER_SIZE];
        let raw_flags = buf.get_u16();
        let len_or_count = buf.get_u16();
        let seq_id = SeqId::new(buf.get_u32());
        let packet_id = buf.get_u64();

        let version = (raw_flags >> VERSION_SHIFT) as u8;
        if version != PROTOCOL_VERSION {
            return Err(HeaderError::UnsupportedVersion(version));
        }

        let flags = raw_flags & FLAG_MASK;
        if flags & !KNOWN_FLAGS != 0 {
            return Err(HeaderError::UnknownFlags(flags));
        }

        if flags & FLAG_ACK == 0 {
            if flags & FLAG_SUSPEND != 0 {
                return Err(HeaderError::SuspendOnData);
            }

            let length = len_or_count as usize;
            if length == 0 || length > max_payload {
                return Err(HeaderError::InvalidLength(len_or_count));
            }
            let actual = bytes.len() - HEADER_SIZE;
            if actual != length {
                return Err(HeaderError::LengthMismatch {
                    declared: length,
                    actual,
                });
            }

            return Ok((FrameHeader::data(seq_id, packet_id, len_or_count), HEADER_SIZE));
        }

        let count = len_or_count as usize;
        if count > MAX_SACK_PAIRS {
            return Err(HeaderError::TooManySackPairs(count));
        }
        let total = HEADER_SIZE + count * SACK_PAIR_SIZE;
        if bytes.len() != total {
            return Err(HeaderError::LengthMismatch {
                declared: total,
                actual: bytes.len(),
            });
        }

        let mut buf = &bytes[HEADER_SIZE..total];
        let mut sacks = Vec::with_capacity(count);
        // the first pair must start strictly after the cumulative ack, every
        // next one strictly after the gap following the previous pair
        let mut floor = seq_id;
        for index in 0..count {
            let left = SeqId::new(buf.get_u32());
            let right = SeqId::new(buf.get_u32());

            if left.gt(right) {
                return Err(HeaderError::SackInverted { index });
            }
            if !left.gt(floor) {
                return Err(HeaderError::SackOrder { index });
            }

            sacks.push(SackPair { left, right });
            floor = right + 1;
        }

        let suspend = flags & FLAG_SUSPEND != 0;
        Ok((FrameHeader::ack(seq_id, packet_id, suspend, sacks), total))
    }
}

/// Header parsing and serialization errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown flags: {0:#06x}")]
    UnknownFlags(u16),

    #[error("SUSPEND flag on a data frame")]
    SuspendOnData,

    #[error("Invalid data length: {0}")]
    InvalidLength(u16),

    #[error("Length mismatch: declared {declared} bytes, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Too many SACK pairs: {0}")]
    TooManySackPairs(usize),

    #[error("SACK pair {index} has left edge after right edge")]
    SackInverted { index: usize },

    #[error("SACK pair {index} is out of order")]
    SackOrder { index: usize },

    #[error("Buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}
