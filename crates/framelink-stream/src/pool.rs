//! Buffer pools.
//!
//! A pool produces buffers and is the sink they return to on drop. The
//! heap pool here recycles fixed-size regions through a bounded free list;
//! the zero-copy DMA pool lives in the transport layer and implements the
//! same traits over a device mapping.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::buffer::{Buffer, BufferReturn, BufferStorage};
use crate::error::{Result, StreamError};
use crate::frame::{Frame, SharedFrame};
use crate::master::StreamSlave;

/// Producer of buffers and frames.
pub trait Pool: Send + Sync {
    /// Largest buffer this pool hands out.
    fn buffer_size(&self) -> usize;

    /// Allocate one buffer of at most `size` bytes.
    ///
    /// `zero_copy` is a hint: pools without a hardware mapping ignore it.
    fn alloc_buffer(&self, size: usize, zero_copy: bool) -> Result<Buffer>;

    /// Build a frame whose writable space covers at least `total` bytes,
    /// splitting the request across buffers as needed.
    fn req_frame(&self, total: usize, zero_copy: bool) -> Result<Frame> {
        let mut frame = Frame::new();
        while frame.available() < total {
            let want = (total - frame.available()).min(self.buffer_size());
            frame.append_buffer(self.alloc_buffer(want, zero_copy)?);
        }
        Ok(frame)
    }
}

/// Heap-backed pool recycling fixed-size regions.
///
/// Regions returned by dropped buffers are kept on a free list up to
/// `depth` entries; beyond that they are released to the allocator.
pub struct HeapPool {
    buffer_size: usize,
    depth: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    this: Weak<HeapPool>,
}

impl HeapPool {
    /// Create a pool of `buffer_size`-byte regions keeping at most `depth`
    /// free regions around.
    pub fn new(buffer_size: usize, depth: usize) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            buffer_size,
            depth,
            free: Mutex::new(Vec::new()),
            this: this.clone(),
        })
    }

    /// Number of regions currently on the free list.
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

impl Pool for HeapPool {
    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn alloc_buffer(&self, size: usize, _zero_copy: bool) -> Result<Buffer> {
        if size > self.buffer_size {
            return Err(StreamError::Boundary { requested: size, limit: self.buffer_size });
        }
        let region = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size].into_boxed_slice());
        let source = self.this.upgrade().map(|pool| pool as Arc<dyn BufferReturn>);
        Ok(Buffer::new(BufferStorage::Heap(region), source, 0))
    }
}

impl BufferReturn for HeapPool {
    fn return_buffer(&self, storage: BufferStorage, _meta: u32) {
        if let BufferStorage::Heap(region) = storage {
            let mut free = self.free.lock();
            if free.len() < self.depth {
                free.push(region);
            }
        }
    }
}

/// A heap pool doubles as a stream slave: allocation requests are served
/// from the pool and delivered frames are simply dropped, which recycles
/// their buffers. Useful as the terminal pool of a pipeline and as a null
/// sink in tests.
impl StreamSlave for HeapPool {
    fn accept_frame(&self, _frame: SharedFrame) {}

    fn accept_req(&self, size: usize, zero_copy: bool) -> Result<SharedFrame> {
        Ok(self.req_frame(size, zero_copy)?.into_shared())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_requests_across_buffers() {
        let pool = HeapPool::new(64, 8);
        let frame = pool.req_frame(200, false).unwrap();

        assert!(frame.available() >= 200);
        assert_eq!(frame.buffer_count(), 4);
        assert!(frame.buffers().iter().all(|b| b.raw_size() == 64));
    }

    #[test]
    fn recycles_dropped_regions() {
        let pool = HeapPool::new(32, 4);
        let frame = pool.req_frame(96, false).unwrap();
        assert_eq!(pool.free_count(), 0);

        drop(frame);
        assert_eq!(pool.free_count(), 3);

        // Free list is reused before the allocator is hit.
        let _frame = pool.req_frame(32, false).unwrap();
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn free_list_is_bounded() {
        let pool = HeapPool::new(16, 2);
        let frame = pool.req_frame(80, false).unwrap();
        drop(frame);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn oversize_buffer_request_fails() {
        let pool = HeapPool::new(16, 2);
        assert_eq!(
            pool.alloc_buffer(17, false).unwrap_err(),
            StreamError::Boundary { requested: 17, limit: 16 }
        );
    }
}
