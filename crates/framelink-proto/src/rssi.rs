//! RSSI segment headers.
//!
//! Every segment starts with an 8-byte header (network byte order):
//!
//! ```text
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! | flags  | hd len | seq    | ack    | spare  | spare  |    checksum     |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! ```
//!
//! Flags: SYN (0x80), ACK (0x40), EACK (0x20), RST (0x10), NUL (0x08),
//! BUSY (0x01). Sequence and acknowledge are 8-bit modular counters. The
//! checksum is the 16-bit ones-complement fold of the header's big-endian
//! words excluding the checksum field itself; payload bytes are covered by
//! the layers above, not here.
//!
//! A SYN segment extends the header to 24 bytes and carries the negotiated
//! connection parameters; its checksum sits in the last two bytes of the
//! extended header.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Result, WireError};

/// Plain header size in bytes.
pub const HEADER_SIZE: usize = 8;

/// SYN header size in bytes.
pub const SYN_SIZE: usize = 24;

/// RSSI protocol version carried in SYN segments.
pub const VERSION: u8 = 1;

/// Header flag bits (byte 0).
pub mod flag {
    /// Connection request.
    pub const SYN: u8 = 0x80;
    /// Acknowledge field is valid.
    pub const ACK: u8 = 0x40;
    /// Extended acknowledge (parsed, never emitted).
    pub const EACK: u8 = 0x20;
    /// Connection reset.
    pub const RST: u8 = 0x10;
    /// Keep-alive segment.
    pub const NUL: u8 = 0x08;
    /// Receiver flow-control back-pressure.
    pub const BUSY: u8 = 0x01;
}

/// Raw plain header layout.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawHeader {
    flags: u8,
    header_len: u8,
    sequence: u8,
    acknowledge: u8,
    spare: [u8; 2],
    checksum: [u8; 2],
}

/// Negotiated parameters carried by a SYN segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynParams {
    /// Protocol version.
    pub version: u8,
    /// Checksum coverage requested.
    pub chk: bool,
    /// Maximum outstanding unacknowledged segments.
    pub max_outstanding: u8,
    /// Maximum segment size in bytes.
    pub max_segment: u16,
    /// Retransmission timeout, in timeout units.
    pub retran_tout: u16,
    /// Cumulative acknowledge timeout, in timeout units.
    pub cum_ack_tout: u16,
    /// Null (keep-alive) timeout, in timeout units.
    pub null_tout: u16,
    /// Retransmissions allowed before the connection errors.
    pub max_retran: u8,
    /// Acknowledgements that may accumulate before one is forced out.
    pub max_cum_ack: u8,
    /// Timeout unit exponent: timeouts are multiples of 10^unit µs.
    pub timeout_unit: u8,
    /// Connection identifier.
    pub conn_id: u32,
}

/// Parsed RSSI segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Raw flag bits.
    pub flags: u8,
    /// Sender sequence number.
    pub sequence: u8,
    /// Cumulative acknowledge number.
    pub acknowledge: u8,
    /// SYN parameter extension, present on SYN segments.
    pub syn: Option<SynParams>,
}

impl Segment {
    /// Parse and checksum-verify a segment header.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let (raw, _) = RawHeader::ref_from_prefix(bytes)
            .map_err(|_| WireError::Truncated { expected: HEADER_SIZE, actual: bytes.len() })?;

        let header_len = usize::from(raw.header_len);
        let expect_len = if raw.flags & flag::SYN != 0 { SYN_SIZE } else { HEADER_SIZE };
        if header_len != expect_len {
            return Err(WireError::InvalidField {
                field: "header_len",
                value: u32::from(raw.header_len),
            });
        }
        if bytes.len() < header_len {
            return Err(WireError::Truncated { expected: header_len, actual: bytes.len() });
        }

        let stored = u16::from_be_bytes([bytes[header_len - 2], bytes[header_len - 1]]);
        if stored != checksum(&bytes[..header_len]) {
            return Err(WireError::ChecksumMismatch);
        }

        let syn = if raw.flags & flag::SYN != 0 { Some(parse_syn(bytes)?) } else { None };

        Ok(Self {
            flags: raw.flags,
            sequence: raw.sequence,
            acknowledge: raw.acknowledge,
            syn,
        })
    }

    /// Header length this segment occupies on the wire.
    pub fn header_len(&self) -> usize {
        if self.syn.is_some() { SYN_SIZE } else { HEADER_SIZE }
    }

    /// SYN flag.
    pub fn is_syn(&self) -> bool {
        self.flags & flag::SYN != 0
    }

    /// ACK flag.
    pub fn is_ack(&self) -> bool {
        self.flags & flag::ACK != 0
    }

    /// RST flag.
    pub fn is_rst(&self) -> bool {
        self.flags & flag::RST != 0
    }

    /// NUL (keep-alive) flag.
    pub fn is_nul(&self) -> bool {
        self.flags & flag::NUL != 0
    }

    /// BUSY flow-control flag.
    pub fn is_busy(&self) -> bool {
        self.flags & flag::BUSY != 0
    }
}

fn parse_syn(bytes: &[u8]) -> Result<SynParams> {
    let version = bytes[4] >> 4;
    if version != VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }

    Ok(SynParams {
        version,
        chk: bytes[4] & 0x04 != 0,
        max_outstanding: bytes[5],
        max_segment: u16::from_be_bytes([bytes[6], bytes[7]]),
        retran_tout: u16::from_be_bytes([bytes[8], bytes[9]]),
        cum_ack_tout: u16::from_be_bytes([bytes[10], bytes[11]]),
        null_tout: u16::from_be_bytes([bytes[12], bytes[13]]),
        max_retran: bytes[14],
        max_cum_ack: bytes[15],
        timeout_unit: bytes[16],
        conn_id: u32::from_be_bytes([bytes[18], bytes[19], bytes[20], bytes[21]]),
    })
}

/// Encode a plain 8-byte header with a valid checksum.
pub fn encode_plain(flags: u8, sequence: u8, acknowledge: u8, out: &mut [u8]) -> Result<()> {
    if out.len() < HEADER_SIZE {
        return Err(WireError::Truncated { expected: HEADER_SIZE, actual: out.len() });
    }
    let raw = RawHeader {
        flags: flags & !flag::SYN,
        header_len: HEADER_SIZE as u8,
        sequence,
        acknowledge,
        spare: [0; 2],
        checksum: [0; 2],
    };
    out[..HEADER_SIZE].copy_from_slice(raw.as_bytes());
    stamp_checksum(&mut out[..HEADER_SIZE]);
    Ok(())
}

/// Encode a 24-byte SYN header with a valid checksum.
pub fn encode_syn(
    flags: u8,
    sequence: u8,
    acknowledge: u8,
    params: &SynParams,
    out: &mut [u8],
) -> Result<()> {
    if out.len() < SYN_SIZE {
        return Err(WireError::Truncated { expected: SYN_SIZE, actual: out.len() });
    }
    let header = &mut out[..SYN_SIZE];
    header.fill(0);
    header[0] = flags | flag::SYN;
    header[1] = SYN_SIZE as u8;
    header[2] = sequence;
    header[3] = acknowledge;
    header[4] = (params.version << 4) | if params.chk { 0x04 } else { 0 };
    header[5] = params.max_outstanding;
    header[6..8].copy_from_slice(&params.max_segment.to_be_bytes());
    header[8..10].copy_from_slice(&params.retran_tout.to_be_bytes());
    header[10..12].copy_from_slice(&params.cum_ack_tout.to_be_bytes());
    header[12..14].copy_from_slice(&params.null_tout.to_be_bytes());
    header[14] = params.max_retran;
    header[15] = params.max_cum_ack;
    header[16] = params.timeout_unit;
    header[18..22].copy_from_slice(&params.conn_id.to_be_bytes());
    stamp_checksum(header);
    Ok(())
}

/// Ones-complement checksum of a header, excluding its checksum field.
fn checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut idx = 0;
    while idx + 2 <= header.len() - 2 {
        sum += u32::from(u16::from_be_bytes([header[idx], header[idx + 1]]));
        idx += 2;
    }
    sum = (sum & 0xFFFF) + (sum >> 16);
    (sum ^ 0xFFFF) as u16
}

fn stamp_checksum(header: &mut [u8]) {
    let sum = checksum(header);
    let len = header.len();
    header[len - 2..].copy_from_slice(&sum.to_be_bytes());
}
