//! Frame and buffer model for the framelink data-acquisition fabric.
//!
//! Acquisition data moves through the system as [`Frame`]s: ordered chains of
//! [`Buffer`]s, each a bounded byte region with head/tail reservations so
//! protocol stages can prepend headers and append trailers in place. Buffers
//! are produced by [`Pool`]s (heap backed, or zero-copy DMA backed in the
//! transport layer) and return themselves to their pool on drop.
//!
//! Frames flow between [`Master`]s and [`StreamSlave`]s: a master fans
//! completed frames out to its attached slaves and forwards allocation
//! requests upstream to its primary slave, so payload is written directly
//! into buffers sized by the final transport.
//!
//! Random access over a scattered frame is provided by [`FrameCursor`] /
//! [`FrameCursorMut`], which present the buffer chain as one flat byte space.

pub mod buffer;
pub mod cursor;
mod error;
pub mod frame;
pub mod master;
pub mod pool;
pub mod queue;

pub use buffer::{Buffer, BufferReturn, BufferStorage};
pub use cursor::{FrameCursor, FrameCursorMut};
pub use error::{Result, StreamError};
pub use frame::{Frame, FrameLock, SharedFrame};
pub use master::{Master, StreamSlave};
pub use pool::{HeapPool, Pool};
pub use queue::FrameQueue;
