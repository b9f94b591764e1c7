//! Byte buffer with head/tail reservations.
//!
//! A [`Buffer`] owns one contiguous byte region and tracks three values over
//! it: `head_room` (reserved at the front for headers added by later
//! stages), `tail_room` (reserved at the back for trailers), and `payload`
//! (valid bytes in the usable window between the reservations).
//!
//! ```text
//! |<-- head_room -->|<-- payload -->|<- writable ->|<-- tail_room -->|
//! |<----------------------- raw_size ----------------------------->|
//! ```
//!
//! Each buffer carries the handle of the [`Pool`](crate::pool::Pool) that
//! produced it and hands its storage back on drop, so a frame can outlive
//! the stage that allocated it without leaking regions. The `meta` word lets
//! a DMA-backed pool recognize its zero-copy buffers on return.

use std::fmt;
use std::sync::Arc;

use crate::error::{Result, StreamError};

/// Meta bit marking a buffer allocated from a hardware DMA mapping.
pub const META_HARDWARE: u32 = 1 << 31;

/// Meta bit marking a hardware index that was already handed back.
pub const META_RETURNED: u32 = 1 << 30;

/// Mask extracting the hardware index from a meta word.
pub const META_INDEX_MASK: u32 = (1 << 30) - 1;

/// Backing storage of a [`Buffer`].
pub enum BufferStorage {
    /// Heap region owned by the buffer.
    Heap(Box<[u8]>),

    /// Slice into a device mapping.
    ///
    /// The pool that created the buffer keeps the mapping alive for as long
    /// as any of its buffers exist; the `'static` lifetime encodes that
    /// contract, it is not a leak.
    Mapped(&'static mut [u8]),
}

impl BufferStorage {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Heap(region) => region,
            Self::Mapped(region) => region,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Self::Heap(region) => region,
            Self::Mapped(region) => region,
        }
    }
}

/// Sink to which a buffer returns its storage when dropped.
///
/// Implemented by pools. A heap pool pushes the region back on its free
/// list; a DMA pool forwards the hardware index to the driver, setting
/// [`META_RETURNED`] so the index cannot be handed back twice.
pub trait BufferReturn: Send + Sync {
    /// Take back the storage and meta word of a dropped buffer.
    fn return_buffer(&self, storage: BufferStorage, meta: u32);
}

/// A bounded byte region with head/tail reservations and a payload window.
///
/// Exclusively owned by at most one [`Frame`](crate::frame::Frame) at a
/// time. All window arithmetic is bounds checked and fails with
/// [`StreamError::Boundary`] rather than clamping, so protocol stages
/// cannot silently truncate wire data.
pub struct Buffer {
    storage: Option<BufferStorage>,
    source: Option<Arc<dyn BufferReturn>>,
    meta: u32,
    head_room: usize,
    tail_room: usize,
    payload: usize,
}

impl Buffer {
    /// Wrap a storage region produced by `source`.
    pub fn new(storage: BufferStorage, source: Option<Arc<dyn BufferReturn>>, meta: u32) -> Self {
        Self { storage: Some(storage), source, meta, head_room: 0, tail_room: 0, payload: 0 }
    }

    /// Allocate a standalone heap buffer with no owning pool.
    ///
    /// Mostly useful in tests and one-shot paths; production buffers come
    /// from a pool so regions are recycled.
    pub fn heap(size: usize) -> Self {
        Self::new(BufferStorage::Heap(vec![0u8; size].into_boxed_slice()), None, 0)
    }

    fn region(&self) -> &[u8] {
        // INVARIANT: `storage` is only taken in drop.
        match &self.storage {
            Some(storage) => storage.as_slice(),
            None => &[],
        }
    }

    fn region_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Some(storage) => storage.as_mut_slice(),
            None => &mut [],
        }
    }

    /// Total capacity of the underlying region.
    pub fn raw_size(&self) -> usize {
        self.region().len()
    }

    /// Usable window size: raw size minus both reservations.
    pub fn size(&self) -> usize {
        self.raw_size() - self.head_room - self.tail_room
    }

    /// Space still writable after the current payload.
    pub fn available(&self) -> usize {
        self.size() - self.payload
    }

    /// Valid bytes in the usable window.
    pub fn payload(&self) -> usize {
        self.payload
    }

    /// Current head reservation.
    pub fn head_room(&self) -> usize {
        self.head_room
    }

    /// Current tail reservation.
    pub fn tail_room(&self) -> usize {
        self.tail_room
    }

    /// Allocator meta word.
    pub fn meta(&self) -> u32 {
        self.meta
    }

    /// Replace the allocator meta word.
    pub fn set_meta(&mut self, meta: u32) {
        self.meta = meta;
    }

    /// Valid payload bytes.
    pub fn payload_bytes(&self) -> &[u8] {
        let start = self.head_room;
        let end = start + self.payload;
        &self.region()[start..end]
    }

    /// Mutable view of the valid payload bytes.
    pub fn payload_bytes_mut(&mut self) -> &mut [u8] {
        let start = self.head_room;
        let end = start + self.payload;
        &mut self.region_mut()[start..end]
    }

    /// Mutable view of the whole usable window (payload plus writable
    /// space), excluding both reservations.
    pub fn window_mut(&mut self) -> &mut [u8] {
        let start = self.head_room;
        let end = self.raw_size() - self.tail_room;
        &mut self.region_mut()[start..end]
    }

    /// Set the payload byte count.
    pub fn set_payload(&mut self, count: usize) -> Result<()> {
        if count > self.size() {
            return Err(StreamError::Boundary { requested: count, limit: self.size() });
        }
        self.payload = count;
        Ok(())
    }

    /// Grow the payload to at least `count` bytes; never shrinks.
    pub fn min_payload(&mut self, count: usize) -> Result<()> {
        if count > self.payload { self.set_payload(count) } else { Ok(()) }
    }

    /// Adjust the payload byte count by a signed delta.
    pub fn adjust_payload(&mut self, delta: i64) -> Result<()> {
        if delta < 0 {
            let dec = delta.unsigned_abs() as usize;
            if dec > self.payload {
                return Err(StreamError::Boundary { requested: dec, limit: self.payload });
            }
            self.payload -= dec;
            Ok(())
        } else {
            self.set_payload(self.payload + delta as usize)
        }
    }

    /// Mark the whole usable window as payload.
    pub fn set_payload_full(&mut self) {
        self.payload = self.size();
    }

    /// Mark the usable window as empty.
    pub fn set_payload_empty(&mut self) {
        self.payload = 0;
    }

    /// Move the start of the usable window by a signed delta.
    ///
    /// A positive delta consumes bytes from the front of the payload into
    /// the head reservation (stripping a header that has been parsed); on
    /// a buffer with no payload written yet it simply grows the
    /// reservation. A negative delta exposes reserved bytes back into the
    /// payload window (claiming space for a header about to be written).
    /// The end of the payload window does not move.
    pub fn adjust_header(&mut self, delta: i64) -> Result<()> {
        if delta >= 0 {
            let inc = delta as usize;
            if self.payload == 0 {
                let new_head = self.head_room + inc;
                if new_head + self.tail_room > self.raw_size() {
                    return Err(StreamError::Boundary {
                        requested: new_head,
                        limit: self.raw_size() - self.tail_room,
                    });
                }
                self.head_room = new_head;
                return Ok(());
            }
            if inc > self.payload {
                return Err(StreamError::Boundary { requested: inc, limit: self.payload });
            }
            self.head_room += inc;
            self.payload -= inc;
        } else {
            let dec = delta.unsigned_abs() as usize;
            if dec > self.head_room {
                return Err(StreamError::Boundary { requested: dec, limit: self.head_room });
            }
            self.head_room -= dec;
            self.payload += dec;
        }
        Ok(())
    }

    /// Adjust the tail reservation by a signed delta.
    ///
    /// Growing the reservation requires the payload to stay clear of it.
    pub fn adjust_tail(&mut self, delta: i64) -> Result<()> {
        if delta >= 0 {
            let inc = delta as usize;
            let new_tail = self.tail_room + inc;
            if self.head_room + self.payload + new_tail > self.raw_size() {
                return Err(StreamError::Boundary {
                    requested: new_tail,
                    limit: self.raw_size() - self.head_room - self.payload,
                });
            }
            self.tail_room = new_tail;
        } else {
            let dec = delta.unsigned_abs() as usize;
            if dec > self.tail_room {
                return Err(StreamError::Boundary { requested: dec, limit: self.tail_room });
            }
            self.tail_room -= dec;
        }
        Ok(())
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("raw_size", &self.raw_size())
            .field("head_room", &self.head_room)
            .field("tail_room", &self.tail_room)
            .field("payload", &self.payload)
            .field("meta", &format_args!("{:#010x}", self.meta))
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let (Some(storage), Some(source)) = (self.storage.take(), self.source.take()) {
            source.return_buffer(storage, self.meta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_accounting() {
        let mut buf = Buffer::heap(64);
        assert_eq!(buf.raw_size(), 64);
        assert_eq!(buf.size(), 64);

        buf.set_payload(16).unwrap();
        assert_eq!(buf.payload(), 16);
        assert_eq!(buf.available(), 48);

        buf.adjust_tail(8).unwrap();
        assert_eq!(buf.size(), 56);
        assert_eq!(buf.available(), 40);
    }

    #[test]
    fn header_strip_and_expose() {
        let mut buf = Buffer::heap(32);
        buf.set_payload(32).unwrap();
        buf.window_mut().copy_from_slice(&[0xAA; 32]);

        // Strip an 8 byte header.
        buf.adjust_header(8).unwrap();
        assert_eq!(buf.head_room(), 8);
        assert_eq!(buf.payload(), 24);

        // Expose it again for rewrite.
        buf.adjust_header(-8).unwrap();
        assert_eq!(buf.head_room(), 0);
        assert_eq!(buf.payload(), 32);
    }

    #[test]
    fn adjust_header_at_limit() {
        let mut buf = Buffer::heap(16);
        buf.set_payload(8).unwrap();
        buf.adjust_header(8).unwrap();

        // Exposing exactly the reservation is legal, one past is not.
        buf.adjust_header(-8).unwrap();
        assert_eq!(
            buf.adjust_header(-1),
            Err(StreamError::Boundary { requested: 1, limit: 0 })
        );
    }

    #[test]
    fn payload_bounds_checked() {
        let mut buf = Buffer::heap(16);
        buf.adjust_tail(4).unwrap();
        assert_eq!(
            buf.set_payload(13),
            Err(StreamError::Boundary { requested: 13, limit: 12 })
        );
        buf.set_payload(12).unwrap();
        assert_eq!(buf.adjust_payload(-13), Err(StreamError::Boundary { requested: 13, limit: 12 }));
    }

    #[test]
    fn returns_storage_to_source() {
        use std::sync::Mutex;

        struct Recorder(Mutex<Vec<u32>>);
        impl BufferReturn for Recorder {
            fn return_buffer(&self, _storage: BufferStorage, meta: u32) {
                self.0.lock().unwrap().push(meta);
            }
        }

        let rec = Arc::new(Recorder(Mutex::new(Vec::new())));
        let storage = BufferStorage::Heap(vec![0u8; 8].into_boxed_slice());
        let buf = Buffer::new(storage, Some(rec.clone()), META_HARDWARE | 5);
        drop(buf);

        assert_eq!(*rec.0.lock().unwrap(), vec![META_HARDWARE | 5]);
    }
}
