//! Frame: an ordered chain of buffers holding one logical message.
//!
//! A frame flows through the fabric stage by stage; each stage may adjust
//! buffer reservations, append more buffers, or drain the chain into a new
//! frame. Sharing between stages goes through [`SharedFrame`]
//! (`Arc<FrameLock>`): at most one reader and one writer at a time, and any
//! access requires holding the frame's lock.
//!
//! `flags` carries the bus sideband (first-user byte low, last-user byte
//! high), `error` is nonzero when a stage marked the frame bad, and
//! `channel` is stamped by reassembly stages with the packetizer
//! destination the frame arrived on.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::buffer::Buffer;
use crate::cursor::{FrameCursor, FrameCursorMut};
use crate::error::{Result, StreamError};

/// Shared handle to a frame, locked by every accessor.
pub type SharedFrame = Arc<FrameLock>;

/// Mutex wrapper holding a [`Frame`] that is in flight between stages.
#[derive(Debug)]
pub struct FrameLock {
    inner: Mutex<Frame>,
}

impl FrameLock {
    /// Wrap a frame for sharing.
    pub fn new(frame: Frame) -> SharedFrame {
        Arc::new(Self { inner: Mutex::new(frame) })
    }

    /// Lock the frame for access.
    ///
    /// Buffer contents may only be touched while this guard is held.
    pub fn lock(&self) -> MutexGuard<'_, Frame> {
        self.inner.lock()
    }
}

/// Ordered sequence of buffers forming one logical message.
#[derive(Default, Debug)]
pub struct Frame {
    buffers: Vec<Buffer>,
    flags: u16,
    error: u8,
    channel: u8,
}

impl Frame {
    /// Create an empty frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move this frame into a shared, lockable handle.
    pub fn into_shared(self) -> SharedFrame {
        FrameLock::new(self)
    }

    /// Append one buffer to the end of the chain.
    pub fn append_buffer(&mut self, buffer: Buffer) {
        self.buffers.push(buffer);
    }

    /// Move all buffers of `other` onto the end of this frame, leaving
    /// `other` empty.
    pub fn append_frame(&mut self, other: &mut Frame) {
        self.buffers.append(&mut other.buffers);
    }

    /// Drop all buffers, returning them to their pools.
    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    /// True when the frame holds no buffers.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Number of buffers in the chain.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Buffer chain accessor.
    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    /// Mutable access to one buffer of the chain.
    pub fn buffer_mut(&mut self, index: usize) -> Option<&mut Buffer> {
        self.buffers.get_mut(index)
    }

    /// Mutable access to the full chain.
    pub fn buffers_mut(&mut self) -> &mut [Buffer] {
        &mut self.buffers
    }

    /// Take the buffer chain out of the frame, leaving it empty.
    pub fn take_buffers(&mut self) -> Vec<Buffer> {
        std::mem::take(&mut self.buffers)
    }

    /// Sum of buffer payloads.
    pub fn payload(&self) -> usize {
        self.buffers.iter().map(Buffer::payload).sum()
    }

    /// Sum of buffer usable-window sizes.
    pub fn size(&self) -> usize {
        self.buffers.iter().map(Buffer::size).sum()
    }

    /// Space still writable across the chain.
    pub fn available(&self) -> usize {
        self.size() - self.payload()
    }

    /// Distribute a payload count across the chain.
    ///
    /// Buffers up to the fill point are set full, the buffer holding the
    /// fill point gets the remainder, and buffers past it are set empty.
    /// With `shrink` false a request below the current payload is rejected;
    /// pass true to allow truncation.
    pub fn set_payload(&mut self, count: usize, shrink: bool) -> Result<()> {
        if !shrink && count < self.payload() {
            return Err(StreamError::Boundary { requested: count, limit: self.payload() });
        }

        let capacity = self.size();
        if count > capacity {
            return Err(StreamError::Boundary { requested: count, limit: capacity });
        }

        let mut remaining = count;
        for buffer in &mut self.buffers {
            let window = buffer.size();
            if remaining == 0 {
                buffer.set_payload_empty();
            } else if remaining <= window {
                buffer.set_payload(remaining)?;
                remaining = 0;
            } else {
                buffer.set_payload_full();
                remaining -= window;
            }
        }
        Ok(())
    }

    /// Grow the payload to at least `count`; never shrinks.
    pub fn min_payload(&mut self, count: usize) -> Result<()> {
        if count > self.payload() { self.set_payload(count, false) } else { Ok(()) }
    }

    /// Adjust the payload by a signed delta.
    pub fn adjust_payload(&mut self, delta: i64) -> Result<()> {
        let current = self.payload();
        if delta < 0 {
            let dec = delta.unsigned_abs() as usize;
            if dec > current {
                return Err(StreamError::Boundary { requested: dec, limit: current });
            }
            self.set_payload(current - dec, true)
        } else {
            self.set_payload(current + delta as usize, false)
        }
    }

    /// Bus sideband flags: first-user byte low, last-user byte high.
    pub fn flags(&self) -> u16 {
        self.flags
    }

    /// Replace the sideband flags.
    pub fn set_flags(&mut self, flags: u16) {
        self.flags = flags;
    }

    /// First-user sideband byte.
    pub fn first_user(&self) -> u8 {
        (self.flags & 0xFF) as u8
    }

    /// Last-user sideband byte.
    pub fn last_user(&self) -> u8 {
        (self.flags >> 8) as u8
    }

    /// Error state; zero means ok.
    pub fn error(&self) -> u8 {
        self.error
    }

    /// Replace the error state.
    pub fn set_error(&mut self, error: u8) {
        self.error = error;
    }

    /// Channel stamped by reassembly stages.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Replace the channel.
    pub fn set_channel(&mut self, channel: u8) {
        self.channel = channel;
    }

    /// Cursor over the frame's payload bytes, positioned at the start.
    pub fn read_cursor(&self) -> FrameCursor<'_> {
        FrameCursor::new(self)
    }

    /// Mutable cursor over the frame's writable windows, positioned at the
    /// start.
    pub fn write_cursor(&mut self) -> FrameCursorMut<'_> {
        FrameCursorMut::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(sizes: &[usize]) -> Frame {
        let mut frame = Frame::new();
        for &size in sizes {
            frame.append_buffer(Buffer::heap(size));
        }
        frame
    }

    #[test]
    fn payload_is_sum_of_buffers() {
        let mut frame = frame_with(&[16, 16, 32]);
        frame.set_payload(40, false).unwrap();

        assert_eq!(frame.payload(), 40);
        assert_eq!(frame.buffers()[0].payload(), 16);
        assert_eq!(frame.buffers()[1].payload(), 16);
        assert_eq!(frame.buffers()[2].payload(), 8);
        assert!(frame.size() >= frame.payload());
    }

    #[test]
    fn set_payload_full_and_empty() {
        let mut frame = frame_with(&[8, 8]);

        frame.set_payload(16, false).unwrap();
        assert!(frame.buffers().iter().all(|b| b.available() == 0));

        frame.set_payload(0, true).unwrap();
        assert!(frame.buffers().iter().all(|b| b.payload() == 0));
    }

    #[test]
    fn set_payload_rejects_shrink_unless_asked() {
        let mut frame = frame_with(&[32]);
        frame.set_payload(24, false).unwrap();

        assert_eq!(
            frame.set_payload(8, false),
            Err(StreamError::Boundary { requested: 8, limit: 24 })
        );
        frame.set_payload(8, true).unwrap();
        assert_eq!(frame.payload(), 8);
    }

    #[test]
    fn set_payload_rejects_overflow() {
        let mut frame = frame_with(&[8, 8]);
        assert_eq!(
            frame.set_payload(17, false),
            Err(StreamError::Boundary { requested: 17, limit: 16 })
        );
    }

    #[test]
    fn append_frame_drains_donor() {
        let mut left = frame_with(&[8]);
        let mut right = frame_with(&[8, 8]);

        left.append_frame(&mut right);
        assert_eq!(left.buffer_count(), 3);
        assert!(right.is_empty());
    }

    #[test]
    fn sideband_bytes() {
        let mut frame = Frame::new();
        frame.set_flags(0xCDAB);
        assert_eq!(frame.first_user(), 0xAB);
        assert_eq!(frame.last_user(), 0xCD);
    }
}
