//! Packetizer version 2 segment framing.
//!
//! One segment on the wire (all integers little endian):
//!
//! ```text
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! | ver/crc| f-user | dest   | id     | segment index   | rsvd=0 | SOF<<7 |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! |                     payload, padded to 8 bytes                        |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! | l-user | EOF&1  | last   | rsvd   |            CRC-32                 |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! ```
//!
//! Byte 0 carries the version (low nibble, always 2) and the CRC-enable bit
//! (bit 5). `last` records how many bytes of the final 8-byte payload word
//! are real data (1..=8). The CRC is polynomial 0x04C11DB7, reflected in
//! and out, initial 0xFFFFFFFF, final xor 0xFFFFFFFF, computed over every
//! byte of the segment before the CRC field, with the initial remainder
//! rolled across the segments of one frame per destination.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Result, WireError};

/// Bytes in a segment header.
pub const HEADER_SIZE: usize = 8;

/// Bytes in a segment trailer.
pub const TRAILER_SIZE: usize = 8;

/// Smallest legal segment: header, one payload word, trailer.
pub const MIN_SEGMENT: usize = 24;

/// Protocol version in the header's low nibble.
pub const VERSION: u8 = 0x2;

const CRC_ENABLE_BIT: u8 = 0x20;
const SOF_BIT: u8 = 0x80;
const EOF_BIT: u8 = 0x01;

/// Raw header layout.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawHeader {
    version: u8,
    first_user: u8,
    dest: u8,
    id: u8,
    index: [u8; 2],
    reserved: u8,
    sof: u8,
}

/// Raw trailer layout.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawTrailer {
    last_user: u8,
    eof: u8,
    last: u8,
    reserved: u8,
    crc: [u8; 4],
}

/// Parsed segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// First-user sideband byte, copied into the reassembled frame.
    pub first_user: u8,
    /// Destination the segment belongs to.
    pub dest: u8,
    /// Application transaction id.
    pub id: u8,
    /// Segment index within the frame.
    pub index: u16,
    /// Start-of-frame marker.
    pub sof: bool,
    /// CRC coverage advertised by the sender.
    pub crc_enabled: bool,
}

impl SegmentHeader {
    /// Parse the first [`HEADER_SIZE`] bytes of a segment.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let (raw, _) = RawHeader::ref_from_prefix(bytes)
            .map_err(|_| WireError::Truncated { expected: HEADER_SIZE, actual: bytes.len() })?;

        if raw.version & 0x0F != VERSION {
            return Err(WireError::UnsupportedVersion(raw.version & 0x0F));
        }

        Ok(Self {
            first_user: raw.first_user,
            dest: raw.dest,
            id: raw.id,
            index: u16::from_le_bytes(raw.index),
            sof: raw.sof & SOF_BIT != 0,
            crc_enabled: raw.version & CRC_ENABLE_BIT != 0,
        })
    }

    /// Write the header into the first [`HEADER_SIZE`] bytes of `out`.
    pub fn encode(&self, out: &mut [u8]) -> Result<()> {
        if out.len() < HEADER_SIZE {
            return Err(WireError::Truncated { expected: HEADER_SIZE, actual: out.len() });
        }
        let raw = RawHeader {
            version: VERSION | if self.crc_enabled { CRC_ENABLE_BIT } else { 0 },
            first_user: self.first_user,
            dest: self.dest,
            id: self.id,
            index: self.index.to_le_bytes(),
            reserved: 0,
            sof: if self.sof { SOF_BIT } else { 0 },
        };
        out[..HEADER_SIZE].copy_from_slice(raw.as_bytes());
        Ok(())
    }
}

/// Parsed segment trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentTrailer {
    /// Last-user sideband byte, valid on the EOF segment.
    pub last_user: u8,
    /// End-of-frame marker.
    pub eof: bool,
    /// Payload bytes in the final 8-byte word, 1..=8.
    pub last: u8,
    /// Segment CRC (zero when CRC is disabled).
    pub crc: u32,
}

impl SegmentTrailer {
    /// Parse the last [`TRAILER_SIZE`] bytes of a segment.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let (_, raw) = RawTrailer::ref_from_suffix(bytes)
            .map_err(|_| WireError::Truncated { expected: TRAILER_SIZE, actual: bytes.len() })?;

        if raw.last == 0 || raw.last > 8 {
            return Err(WireError::InvalidField { field: "last", value: u32::from(raw.last) });
        }

        Ok(Self {
            last_user: raw.last_user,
            eof: raw.eof & EOF_BIT != 0,
            last: raw.last,
            crc: u32::from_le_bytes(raw.crc),
        })
    }

    /// Write the trailer into the last [`TRAILER_SIZE`] bytes of `out`.
    pub fn encode(&self, out: &mut [u8]) -> Result<()> {
        let len = out.len();
        if len < TRAILER_SIZE {
            return Err(WireError::Truncated { expected: TRAILER_SIZE, actual: len });
        }
        let raw = RawTrailer {
            last_user: self.last_user,
            eof: if self.eof { EOF_BIT } else { 0 },
            last: self.last,
            reserved: 0,
            crc: self.crc.to_le_bytes(),
        };
        out[len - TRAILER_SIZE..].copy_from_slice(raw.as_bytes());
        Ok(())
    }
}

/// Per-destination rolling CRC-32 state.
///
/// The CRC of segment *k* continues from the interim remainder left by
/// segment *k − 1*, so a receiver detects a missing segment even when every
/// individual CRC is self-consistent. [`RollingCrc::reset`] restores the
/// initial remainder; call it whenever destination state is reset.
#[derive(Debug, Default, Clone, Copy)]
pub struct RollingCrc {
    prev: Option<u32>,
}

impl RollingCrc {
    /// Fresh state with the initial remainder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checksum `data`, rolling the remainder into the next call.
    pub fn compute(&mut self, data: &[u8]) -> u32 {
        let mut hasher = match self.prev {
            Some(prev) => crc32fast::Hasher::new_with_initial(prev),
            None => crc32fast::Hasher::new(),
        };
        hasher.update(data);
        let crc = hasher.finalize();
        self.prev = Some(crc);
        crc
    }

    /// Restore the initial remainder.
    pub fn reset(&mut self) {
        self.prev = None;
    }
}

/// Round a payload byte count up to the 8-byte segment alignment.
pub fn padded_len(payload: usize) -> usize {
    payload.div_ceil(8) * 8
}

/// Payload bytes occupied in the final 8-byte word (the trailer `last`
/// field); 8 for an exact multiple.
pub fn last_word_bytes(payload: usize) -> u8 {
    let rem = payload % 8;
    if rem == 0 { 8 } else { rem as u8 }
}
