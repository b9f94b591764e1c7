//! Stream topology: masters fan frames out to slaves.
//!
//! A [`Master`] keeps an ordered list of attached [`StreamSlave`]s.
//! Completed frames flow downstream through [`Master::send_frame`];
//! allocation requests flow upstream through [`Master::req_frame`], which
//! consults the first attached slave only (the "primary pool"), so payload
//! is written straight into buffers sized by the stage that will transmit
//! them.
//!
//! Delivery order: `send_frame` calls on one master are serialized, and a
//! given slave sees frames in that serial order. Slaves are visited in
//! reverse subscription order. Nothing is guaranteed between distinct
//! masters.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, StreamError};
use crate::frame::SharedFrame;

/// Receiving side of a stream edge.
///
/// A slave is a frame sink and, when it fronts a pool, a buffer source.
/// Slaves may themselves own masters, forming pipelines.
pub trait StreamSlave: Send + Sync {
    /// Accept a completed frame from an upstream master.
    ///
    /// May block for back-pressure; implementations bound any wait with
    /// their configured timeout.
    fn accept_frame(&self, frame: SharedFrame);

    /// Satisfy an upstream allocation request.
    ///
    /// The default declines: pure sinks do not supply buffers.
    fn accept_req(&self, size: usize, zero_copy: bool) -> Result<SharedFrame> {
        let _ = (size, zero_copy);
        Err(StreamError::NoPool)
    }
}

/// Sending side of a stream edge.
pub struct Master {
    slaves: Mutex<Vec<Arc<dyn StreamSlave>>>,
    order: Mutex<()>,
}

impl Master {
    /// Create a master with no attached slaves.
    pub fn new() -> Self {
        Self { slaves: Mutex::new(Vec::new()), order: Mutex::new(()) }
    }

    /// Attach a slave to the end of the subscription list.
    pub fn add_slave(&self, slave: Arc<dyn StreamSlave>) {
        self.slaves.lock().push(slave);
    }

    /// Number of attached slaves.
    pub fn slave_count(&self) -> usize {
        self.slaves.lock().len()
    }

    /// Request a frame from the primary pool (the first attached slave).
    pub fn req_frame(&self, size: usize, zero_copy: bool) -> Result<SharedFrame> {
        let primary = self.slaves.lock().first().cloned().ok_or(StreamError::NoSlave)?;
        primary.accept_req(size, zero_copy)
    }

    /// Deliver a frame to every attached slave, reverse subscription order.
    ///
    /// Concurrent senders are serialized so each slave observes one
    /// consistent delivery order per master.
    pub fn send_frame(&self, frame: &SharedFrame) {
        let slaves = self.slaves.lock().clone();
        let _order = self.order.lock();
        for slave in slaves.iter().rev() {
            slave.accept_frame(frame.clone());
        }
    }
}

impl Default for Master {
    fn default() -> Self {
        Self::new()
    }
}
