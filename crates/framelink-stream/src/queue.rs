//! Bounded MPSC frame queue.
//!
//! The hand-off point between a protocol engine and the worker that drains
//! toward a transport. Admission is deadline bounded so application threads
//! never wedge on a stalled transport, and [`FrameQueue::busy`] gives
//! engines a cheap back-pressure predicate.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::error::{Result, StreamError};
use crate::frame::SharedFrame;

/// Bounded multi-producer single-consumer queue of shared frames.
#[derive(Clone)]
pub struct FrameQueue {
    tx: Sender<SharedFrame>,
    rx: Receiver<SharedFrame>,
}

impl FrameQueue {
    /// Create a queue holding at most `depth` frames.
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = bounded(depth);
        Self { tx, rx }
    }

    /// Enqueue a frame, waiting until `deadline` for space.
    pub fn push_back(&self, frame: SharedFrame, deadline: Instant) -> Result<()> {
        let started = Instant::now();
        self.tx.send_deadline(frame, deadline).map_err(|_| StreamError::Timeout {
            elapsed: started.elapsed(),
        })
    }

    /// Enqueue a frame only if space is immediately available.
    pub fn try_push_back(&self, frame: SharedFrame) -> Result<()> {
        self.tx.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) | TrySendError::Disconnected(_) => {
                StreamError::Timeout { elapsed: Duration::ZERO }
            },
        })
    }

    /// Dequeue the next frame, waiting until `deadline`.
    pub fn pop_front(&self, deadline: Instant) -> Option<SharedFrame> {
        self.rx.recv_deadline(deadline).ok()
    }

    /// Dequeue the next frame only if one is immediately available.
    pub fn try_pop_front(&self) -> Option<SharedFrame> {
        self.rx.try_recv().ok()
    }

    /// Back-pressure predicate: true when the queue is at capacity.
    pub fn busy(&self) -> bool {
        self.tx.is_full()
    }

    /// Number of frames currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// True when no frames are queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    fn deadline_in(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn fifo_order() {
        let queue = FrameQueue::new(4);
        for flags in [1u16, 2, 3] {
            let mut frame = Frame::new();
            frame.set_flags(flags);
            queue.push_back(frame.into_shared(), deadline_in(10)).unwrap();
        }

        for expect in [1u16, 2, 3] {
            let frame = queue.pop_front(deadline_in(10)).unwrap();
            assert_eq!(frame.lock().flags(), expect);
        }
    }

    #[test]
    fn admission_times_out_when_full() {
        let queue = FrameQueue::new(1);
        queue.push_back(Frame::new().into_shared(), deadline_in(10)).unwrap();
        assert!(queue.busy());

        let err = queue.push_back(Frame::new().into_shared(), deadline_in(5)).unwrap_err();
        assert!(matches!(err, StreamError::Timeout { .. }));
    }

    #[test]
    fn pop_times_out_when_empty() {
        let queue = FrameQueue::new(1);
        assert!(queue.pop_front(deadline_in(5)).is_none());
    }

    #[test]
    fn space_frees_after_pop() {
        let queue = FrameQueue::new(1);
        queue.push_back(Frame::new().into_shared(), deadline_in(10)).unwrap();
        queue.pop_front(deadline_in(10)).unwrap();
        assert!(!queue.busy());
        queue.try_push_back(Frame::new().into_shared()).unwrap();
    }
}
