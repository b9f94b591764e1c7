//! Memory-transaction fabric.
//!
//! Register access flows as [`Transaction`]s: a [`MemoryMaster`] posts
//! read/write/posted/verify requests to a [`MemorySlave`], which completes
//! each transaction exactly once: with success and guaranteed-valid bytes,
//! or with one of the terminal errors in [`MemoryError`]. Masters enforce
//! per-transaction deadlines; a request that never completes is timed out
//! on the waiting side.
//!
//! Slaves keep weak references to in-flight transactions so a dropped
//! transaction is pruned automatically ([`InflightTable`]). The
//! [`MemoryEmulator`] provides a RAM-backed slave for tests and loopback
//! stacks.

pub mod bits;
pub mod emulate;
mod error;
pub mod master;
pub mod slave;
pub mod transaction;

pub use emulate::MemoryEmulator;
pub use error::{MemoryError, code};
pub use master::MemoryMaster;
pub use slave::{InflightTable, MemorySlave};
pub use transaction::{AccessKind, Transaction};
