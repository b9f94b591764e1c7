//! Test harness for the framelink stack.
//!
//! Deterministic traffic generation plus the fixtures needed to close a
//! stack on itself inside one process:
//!
//! - [`Prbs`]: pseudo-random traffic source and checker with rx/tx
//!   counters, usable as either end of a pipeline.
//! - [`loopback::Pipe`] / [`loopback::LossyPipe`]: in-process wires with
//!   buffer pools, optionally dropping selected frames.
//! - [`loopback::RssiPeer`]: minimal far-end RSSI responder (the role the
//!   firmware plays), enough to handshake, acknowledge and deliver.
//! - [`loopback::RegisterServer`]: firmware-side SRP responder backed by
//!   a byte-addressed memory map.

pub mod loopback;
pub mod prbs;

pub use loopback::{LossyPipe, Pipe, RegisterServer, RssiPeer};
pub use prbs::Prbs;
