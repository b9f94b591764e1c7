//! SRP version 3 wire format.
//!
//! A request is five little-endian 32-bit words, followed by payload for
//! writes:
//!
//! ```text
//! word 0: version=3 (bits 7:0) | type (bits 9:8) | ignore-resp (bit 14)
//!         | timeout count (bits 31:24)
//! word 1: transaction id
//! word 2: address low
//! word 3: address high
//! word 4: size - 1
//! ```
//!
//! Types: 0 = read, 1 = write, 2 = posted write, 3 = verify. Read and
//! verify responses carry the data followed by a 4-byte tail word: bits
//! 7:0 are the AXI failure code, bit 8 flags an AXI timeout, any other
//! nonzero bit is surfaced verbatim.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Result, WireError};

/// Request header length in bytes.
pub const HEADER_SIZE: usize = 20;

/// Response tail length in bytes.
pub const TAIL_SIZE: usize = 4;

/// Protocol version in word 0 bits 7:0.
pub const VERSION: u8 = 0x03;

/// Bits of word 0 compared between request and response; the bits the
/// firmware rewrites in flight (13:10) are masked out.
pub const RESPONSE_MASK: u32 = 0xFFFF_C3FF;

const TIMEOUT_COUNT: u32 = 0x0A00_0000;

/// Access type carried in word 0 bits 9:8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrpKind {
    /// Register read.
    Read,
    /// Register write with response.
    Write,
    /// Posted register write, no response expected.
    Post,
    /// Verify readback.
    Verify,
}

impl SrpKind {
    fn to_bits(self) -> u32 {
        match self {
            Self::Read => 0,
            Self::Write => 1,
            Self::Post => 2,
            Self::Verify => 3,
        }
    }

    fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            1 => Self::Write,
            2 => Self::Post,
            3 => Self::Verify,
            _ => Self::Read,
        }
    }

    /// True when the request carries write payload after the header.
    pub fn carries_payload(self) -> bool {
        matches!(self, Self::Write | Self::Post)
    }
}

/// Raw header layout: five unaligned little-endian words.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawHeader {
    word0: [u8; 4],
    id: [u8; 4],
    addr_low: [u8; 4],
    addr_high: [u8; 4],
    size_m1: [u8; 4],
}

/// Parsed SRP v3 request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrpHeader {
    /// Access type.
    pub kind: SrpKind,
    /// Transaction id.
    pub id: u32,
    /// Target address.
    pub address: u64,
    /// Transfer size in bytes (the wire stores `size - 1`).
    pub size: u32,
}

impl SrpHeader {
    /// Parse the first [`HEADER_SIZE`] bytes of a frame.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let (raw, _) = RawHeader::ref_from_prefix(bytes)
            .map_err(|_| WireError::Truncated { expected: HEADER_SIZE, actual: bytes.len() })?;

        let word0 = u32::from_le_bytes(raw.word0);
        let version = (word0 & 0xFF) as u8;
        if version != VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }

        let size_m1 = u32::from_le_bytes(raw.size_m1);
        if size_m1 == u32::MAX {
            return Err(WireError::InvalidField { field: "size", value: size_m1 });
        }

        Ok(Self {
            kind: SrpKind::from_bits(word0 >> 8),
            id: u32::from_le_bytes(raw.id),
            address: u64::from(u32::from_le_bytes(raw.addr_low))
                | (u64::from(u32::from_le_bytes(raw.addr_high)) << 32),
            size: size_m1 + 1,
        })
    }

    /// Header word 0 as emitted for this request.
    pub fn word0(&self) -> u32 {
        u32::from(VERSION) | (self.kind.to_bits() << 8) | TIMEOUT_COUNT
    }

    /// Encode the header into the first [`HEADER_SIZE`] bytes of `out`.
    pub fn encode(&self, out: &mut [u8]) -> Result<()> {
        if out.len() < HEADER_SIZE {
            return Err(WireError::Truncated { expected: HEADER_SIZE, actual: out.len() });
        }
        if self.size == 0 {
            return Err(WireError::InvalidField { field: "size", value: 0 });
        }
        let raw = RawHeader {
            word0: self.word0().to_le_bytes(),
            id: self.id.to_le_bytes(),
            addr_low: ((self.address & 0xFFFF_FFFF) as u32).to_le_bytes(),
            addr_high: ((self.address >> 32) as u32).to_le_bytes(),
            size_m1: (self.size - 1).to_le_bytes(),
        };
        out[..HEADER_SIZE].copy_from_slice(raw.as_bytes());
        Ok(())
    }

    /// Expected total frame length for this request on the wire.
    pub fn request_len(&self) -> usize {
        HEADER_SIZE + if self.kind.carries_payload() { self.size as usize } else { 0 }
    }

    /// Expected total frame length of the matching response.
    pub fn response_len(&self) -> usize {
        match self.kind {
            SrpKind::Read | SrpKind::Verify => HEADER_SIZE + self.size as usize + TAIL_SIZE,
            SrpKind::Write | SrpKind::Post => HEADER_SIZE + TAIL_SIZE,
        }
    }
}

/// Failure indication decoded from a response tail word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailStatus {
    /// Transaction completed cleanly.
    Ok,
    /// AXI bus returned a failure code (bits 7:0).
    AxiFail(u8),
    /// AXI transaction timed out in the firmware (bit 8).
    AxiTimeout,
    /// Some other failure bit; surfaced verbatim.
    Other(u32),
}

/// Decode a response tail word.
pub fn tail_status(tail: u32) -> TailStatus {
    if tail == 0 {
        TailStatus::Ok
    } else if tail & 0xFF != 0 {
        TailStatus::AxiFail((tail & 0xFF) as u8)
    } else if tail & 0x100 != 0 {
        TailStatus::AxiTimeout
    } else {
        TailStatus::Other(tail)
    }
}
