//! Terminal transaction errors and their stable completion codes.
//!
//! A transaction completes with a `u32` code: zero for success, one of the
//! constants in [`code`] otherwise. The codes are stable across releases
//! (they are reported over bridge protocols and recorded by callers), so the
//! enum converts losslessly in both directions. The AXI failure code from
//! an SRP tail travels in the low byte of [`code::AXI_FAIL`].

use thiserror::Error;

/// Stable completion codes carried on transactions.
pub mod code {
    /// Success.
    pub const OK: u32 = 0;
    /// Deadline expired before a response arrived.
    pub const TIMEOUT: u32 = 0x0100_0000;
    /// Verify readback did not match the written data.
    pub const VERIFY: u32 = 0x0200_0000;
    /// Address misaligned for the slave.
    pub const ADDRESS: u32 = 0x0300_0000;
    /// Size out of the slave's bounds or misaligned.
    pub const SIZE: u32 = 0x0400_0000;
    /// Interconnect bus timeout.
    pub const BUS_TIMEOUT: u32 = 0x0500_0000;
    /// Malformed or mismatched protocol response.
    pub const PROTOCOL: u32 = 0x0600_0000;
    /// The slave does not support this access.
    pub const UNSUPPORTED: u32 = 0x0700_0000;
    /// Firmware-side AXI timeout.
    pub const AXI_TIMEOUT: u32 = 0x0800_0000;
    /// AXI bus failure; the bus code sits in the low byte.
    pub const AXI_FAIL: u32 = 0x0900_0000;
}

/// Terminal error states of a memory transaction.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// Deadline expired before the slave responded.
    #[error("transaction timed out")]
    Timeout,

    /// Firmware reported an AXI timeout.
    #[error("axi timeout")]
    AxiTimeout,

    /// AXI bus failure with the bus status code.
    #[error("axi failure, bus code {0:#04x}")]
    AxiFail(u8),

    /// Malformed or mismatched protocol response.
    #[error("protocol error")]
    Protocol,

    /// Size out of bounds or not a multiple of the slave minimum.
    #[error("size error")]
    Size,

    /// Address not aligned to the slave minimum.
    #[error("address error")]
    Address,

    /// Interconnect bus timeout.
    #[error("bus timeout")]
    BusTimeout,

    /// Access type not supported by the slave.
    #[error("unsupported access")]
    Unsupported,

    /// Verify readback mismatch.
    #[error("verify error")]
    Verify,
}

impl MemoryError {
    /// Completion code for this error.
    pub fn to_code(self) -> u32 {
        match self {
            Self::Timeout => code::TIMEOUT,
            Self::Verify => code::VERIFY,
            Self::Address => code::ADDRESS,
            Self::Size => code::SIZE,
            Self::BusTimeout => code::BUS_TIMEOUT,
            Self::Protocol => code::PROTOCOL,
            Self::Unsupported => code::UNSUPPORTED,
            Self::AxiTimeout => code::AXI_TIMEOUT,
            Self::AxiFail(bus) => code::AXI_FAIL | u32::from(bus),
        }
    }

    /// Decode a nonzero completion code; unknown codes map to
    /// [`MemoryError::Protocol`].
    pub fn from_code(value: u32) -> Option<Self> {
        match value & 0xFF00_0000 {
            0 if value == 0 => None,
            code::TIMEOUT => Some(Self::Timeout),
            code::VERIFY => Some(Self::Verify),
            code::ADDRESS => Some(Self::Address),
            code::SIZE => Some(Self::Size),
            code::BUS_TIMEOUT => Some(Self::BusTimeout),
            code::UNSUPPORTED => Some(Self::Unsupported),
            code::AXI_TIMEOUT => Some(Self::AxiTimeout),
            code::AXI_FAIL => Some(Self::AxiFail((value & 0xFF) as u8)),
            _ => Some(Self::Protocol),
        }
    }

    /// Turn a completion code into a result.
    pub fn check(value: u32) -> Result<(), MemoryError> {
        match Self::from_code(value) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        let all = [
            MemoryError::Timeout,
            MemoryError::AxiTimeout,
            MemoryError::AxiFail(0x5A),
            MemoryError::Protocol,
            MemoryError::Size,
            MemoryError::Address,
            MemoryError::BusTimeout,
            MemoryError::Unsupported,
            MemoryError::Verify,
        ];
        for err in all {
            assert_eq!(MemoryError::from_code(err.to_code()), Some(err));
        }
    }

    #[test]
    fn zero_code_is_success() {
        assert_eq!(MemoryError::check(0), Ok(()));
        assert_eq!(MemoryError::from_code(0), None);
    }

    #[test]
    fn axi_fail_carries_bus_code() {
        let err = MemoryError::AxiFail(0x03);
        assert_eq!(err.to_code(), 0x0900_0003);
    }
}
