//! Reliable streaming controller.
//!
//! Implements the connection-oriented reliability layer that sits between a
//! lossy datagram transport and the packetizer: SYN parameter negotiation,
//! cumulative acknowledgements over 8-bit sequence numbers, a sliding
//! retransmission window, keep-alive NUL segments and BUSY flow control.
//!
//! The state machine lives in [`engine::Engine`], a synchronous core with
//! no threads or I/O of its own: it consumes parsed segments and timer
//! polls, and yields fully encoded frames to transmit. [`Rssi`] wraps it
//! with the runtime pieces: one timer worker driving the connection, one
//! delivery worker draining the inbound queue, and the lock/condvar pair
//! that blocks application writers while the transmit window is full.
//!
//! Sequence arithmetic is 8-bit and wrapping throughout, matching the wire
//! format; the transmit window is the 256-entry array indexed by sequence
//! number.

pub mod controller;
pub mod engine;

use std::time::Duration;

pub use controller::{ApplicationPort, Rssi, TransportPort};
pub use engine::{ConnState, Engine};

/// Local receive-window size advertised in our SYN.
pub const LOC_MAX_BUFFERS: u8 = 32;

/// Connection retry period while closed, in timeout units.
pub const TRY_PERIOD: u16 = 100;

/// RSSI controller parameters.
///
/// The timeouts are expressed in units of `10^timeout_unit` microseconds
/// and travel in the SYN segment; the peer echoes the set it accepts.
#[derive(Debug, Clone)]
pub struct RssiConfig {
    /// Largest data segment requested from the transport, in bytes.
    pub segment_size: usize,
    /// Local connection id carried in the SYN.
    pub conn_id: u32,
    /// Retransmission timeout, in timeout units.
    pub retran_tout: u16,
    /// Cumulative acknowledge timeout, in timeout units.
    pub cum_ack_tout: u16,
    /// Keep-alive timeout, in timeout units.
    pub null_tout: u16,
    /// Retransmissions allowed before the connection errors.
    pub max_retran: u8,
    /// Acknowledgements allowed to accumulate before one is forced.
    pub max_cum_ack: u8,
    /// Timeout unit exponent.
    pub timeout_unit: u8,
    /// Admission timeout for application frames.
    pub timeout: Duration,
}

impl Default for RssiConfig {
    fn default() -> Self {
        Self {
            segment_size: 1024,
            conn_id: 0x1234_5678,
            retran_tout: 10,
            cum_ack_tout: 5,
            null_tout: 3000,
            max_retran: 15,
            max_cum_ack: 2,
            timeout_unit: 3,
            timeout: Duration::from_secs(1),
        }
    }
}

impl RssiConfig {
    /// One timeout unit as a duration.
    pub fn unit(&self) -> Duration {
        Duration::from_micros(10u64.pow(u32::from(self.timeout_unit)))
    }

    /// Convert a wire timeout value into a duration.
    pub fn to_duration(&self, units: u16) -> Duration {
        self.unit() * u32::from(units)
    }
}
