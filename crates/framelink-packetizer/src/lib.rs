//! Packetizer version 2 protocol engine.
//!
//! Splits outbound application frames into 8-byte-aligned wire segments
//! and reassembles inbound segments back into frames, keeping independent
//! state for each of the 256 destinations multiplexed onto one transport.
//! Every segment carries an 8-byte header and an 8-byte trailer with an
//! optional rolling CRC-32; a CRC, start-of-frame or sequence mismatch
//! drops the segment and resets that destination, counting the drop.
//!
//! Wiring (one controller per physical stream):
//!
//! ```text
//!   app masters --> application(dest) --\
//!                                        +--> tx queue --> transport
//!   app slaves  <-- set_application <----+<-- transport_port() <-- wire
//! ```
//!
//! The transmit queue is a bounded MPSC drained by one worker thread;
//! application admission blocks with a configurable timeout while the
//! queue is busy. Per-destination reassembly is serialized under the
//! transport-side lock; the application side has its own lock so the two
//! directions never contend.

mod controller;

pub use controller::{ApplicationPort, Packetizer, PacketizerConfig, TransportPort};
