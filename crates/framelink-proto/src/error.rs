//! Codec error type.
//!
//! Parse failures are recoverable by design: the engines log them, bump a
//! drop counter and reset local state. Nothing here propagates across an
//! engine boundary.

use thiserror::Error;

/// Result alias for the wire codecs.
pub type Result<T> = std::result::Result<T, WireError>;

/// Errors raised while parsing or building wire structures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// The byte slice is shorter than the structure requires.
    #[error("truncated: need {expected} bytes, have {actual}")]
    Truncated {
        /// Bytes the structure occupies
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// The version field does not match this codec.
    #[error("unsupported protocol version {0:#x}")]
    UnsupportedVersion(u8),

    /// A checksum or CRC did not validate.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// A field value is outside its legal range.
    #[error("field {field} has invalid value {value}")]
    InvalidField {
        /// Name of the offending field
        field: &'static str,
        /// Raw value observed
        value: u32,
    },
}
