//! Wire codecs for the framelink protocol stack.
//!
//! Pure encode/parse layers with no I/O and no state machines:
//!
//! - [`packetizer`]: version 2 segment framing: 8-byte header, 8-byte
//!   trailer with CRC-32, 8-byte alignment rules.
//! - [`rssi`]: reliable-transport headers: flag byte, 8-bit sequence
//!   numbers, ones-complement checksum, SYN parameter extension.
//! - [`srp`]: register-protocol version 3: five-word request header and
//!   the response tail word.
//!
//! Fixed-size layouts are parsed in place with `zerocopy`; every multi-byte
//! field is stored as a byte array so casting from unaligned network bytes
//! is always valid.

mod error;
pub mod packetizer;
pub mod rssi;
pub mod srp;

pub use error::{Result, WireError};
