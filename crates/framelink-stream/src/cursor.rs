//! Random-access byte cursors over a frame's scattered buffers.
//!
//! Protocol headers and trailers routinely straddle buffer boundaries, so
//! the engines need to address a frame as one flat byte space. A
//! [`FrameCursor`] walks the concatenation of every buffer's payload window;
//! a [`FrameCursorMut`] walks the concatenation of the writable windows
//! (payload capacity after head/tail reservations).
//!
//! Positions are flat byte offsets and are monotonic: for cursors `a <= b`
//! on one frame, `b - a` is the byte distance and `a + (b - a) == b`.
//! Advancing past the end yields the end cursor. Cursors borrow the frame,
//! so any operation that reshuffles the buffer chain invalidates them at
//! compile time.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use crate::error::{Result, StreamError};
use crate::frame::Frame;

/// Read cursor over the payload byte space of a frame.
#[derive(Clone)]
pub struct FrameCursor<'f> {
    frame: &'f Frame,
    total: usize,
    pos: usize,
    buf: usize,
    off: usize,
}

impl<'f> FrameCursor<'f> {
    /// Cursor at the start of the frame's payload.
    pub fn new(frame: &'f Frame) -> Self {
        let total = frame.payload();
        let mut cursor = Self { frame, total, pos: 0, buf: 0, off: 0 };
        cursor.normalize();
        cursor
    }

    /// Skip empty windows so `off` indexes a valid byte whenever the
    /// cursor is not at the end.
    fn normalize(&mut self) {
        while let Some(buffer) = self.frame.buffers().get(self.buf) {
            let window = buffer.payload();
            if self.off < window {
                return;
            }
            self.off -= window;
            self.buf += 1;
        }
    }

    /// Flat byte offset from the start of the payload.
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// Bytes between the cursor and the end of the payload.
    pub fn remaining(&self) -> usize {
        self.total - self.pos
    }

    /// True when the cursor sits at the end of the payload.
    pub fn is_end(&self) -> bool {
        self.pos == self.total
    }

    /// Byte under the cursor.
    pub fn peek(&self) -> Result<u8> {
        if self.is_end() {
            return Err(StreamError::Boundary { requested: self.pos + 1, limit: self.total });
        }
        Ok(self.frame.buffers()[self.buf].payload_bytes()[self.off])
    }

    /// Byte at flat offset `k` past the cursor, without moving it.
    pub fn get(&self, k: usize) -> Result<u8> {
        let mut probe = self.clone();
        probe.advance(k)?;
        probe.peek()
    }

    /// Move the cursor forward by `count` bytes.
    pub fn advance(&mut self, count: usize) -> Result<()> {
        if count > self.remaining() {
            return Err(StreamError::Boundary { requested: count, limit: self.remaining() });
        }
        self.pos += count;
        self.off += count;
        self.normalize();
        Ok(())
    }

    /// Move the cursor backward by `count` bytes.
    pub fn rewind(&mut self, count: usize) -> Result<()> {
        if count > self.pos {
            return Err(StreamError::Boundary { requested: count, limit: self.pos });
        }
        self.seek(self.pos - count)
    }

    /// Place the cursor at an absolute flat offset.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.total {
            return Err(StreamError::Boundary { requested: pos, limit: self.total });
        }
        self.pos = pos;
        self.buf = 0;
        self.off = pos;
        self.normalize();
        Ok(())
    }

    /// Signed byte distance from `other` to this cursor.
    pub fn distance(&self, other: &Self) -> isize {
        self.pos as isize - other.pos as isize
    }

    /// Read one byte and advance.
    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = self.peek()?;
        self.advance(1)?;
        Ok(byte)
    }

    /// Copy bytes out of the frame into `dst` and advance past them.
    pub fn read_exact(&mut self, dst: &mut [u8]) -> Result<()> {
        if dst.len() > self.remaining() {
            return Err(StreamError::Boundary { requested: dst.len(), limit: self.remaining() });
        }
        let mut copied = 0;
        while copied < dst.len() {
            let window = self.frame.buffers()[self.buf].payload_bytes();
            let take = (window.len() - self.off).min(dst.len() - copied);
            dst[copied..copied + take].copy_from_slice(&window[self.off..self.off + take]);
            copied += take;
            self.pos += take;
            self.off += take;
            self.normalize();
        }
        Ok(())
    }

    /// Read a little-endian `u16` and advance.
    pub fn read_u16(&mut self) -> Result<u16> {
        let mut raw = [0u8; 2];
        self.read_exact(&mut raw)?;
        Ok(u16::from_le_bytes(raw))
    }

    /// Read a little-endian `u32` and advance.
    pub fn read_u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.read_exact(&mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Read a little-endian `u64` and advance.
    pub fn read_u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        self.read_exact(&mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }
}

impl Iterator for FrameCursor<'_> {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        self.read_u8().ok()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining(), Some(self.remaining()))
    }
}

impl fmt::Debug for FrameCursor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameCursor")
            .field("pos", &self.pos)
            .field("total", &self.total)
            .finish()
    }
}

impl PartialEq for FrameCursor<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.pos == other.pos
    }
}

impl Eq for FrameCursor<'_> {}

impl PartialOrd for FrameCursor<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrameCursor<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.pos.cmp(&other.pos)
    }
}

/// Advancing past the end stops at the end cursor.
impl Add<usize> for FrameCursor<'_> {
    type Output = Self;

    fn add(mut self, count: usize) -> Self {
        let step = count.min(self.remaining());
        // INVARIANT: step is clamped to the remaining byte count.
        let _ = self.advance(step);
        self
    }
}

impl AddAssign<usize> for FrameCursor<'_> {
    fn add_assign(&mut self, count: usize) {
        let step = count.min(self.remaining());
        let _ = self.advance(step);
    }
}

/// Rewinding past the start stops at the start cursor.
impl Sub<usize> for FrameCursor<'_> {
    type Output = Self;

    fn sub(mut self, count: usize) -> Self {
        let step = count.min(self.pos);
        let _ = self.rewind(step);
        self
    }
}

impl SubAssign<usize> for FrameCursor<'_> {
    fn sub_assign(&mut self, count: usize) {
        let step = count.min(self.pos);
        let _ = self.rewind(step);
    }
}

impl Sub<&FrameCursor<'_>> for &FrameCursor<'_> {
    type Output = isize;

    fn sub(self, other: &FrameCursor<'_>) -> isize {
        self.distance(other)
    }
}

/// Write cursor over the writable windows of a frame.
///
/// Walks payload capacity (window size after head/tail reservations), not
/// just the currently valid payload; callers set the frame payload once
/// writing is complete.
pub struct FrameCursorMut<'f> {
    frame: &'f mut Frame,
    total: usize,
    pos: usize,
    buf: usize,
    off: usize,
}

impl<'f> FrameCursorMut<'f> {
    /// Cursor at the start of the frame's writable space.
    pub fn new(frame: &'f mut Frame) -> Self {
        let total = frame.size();
        let mut cursor = Self { frame, total, pos: 0, buf: 0, off: 0 };
        cursor.normalize();
        cursor
    }

    fn normalize(&mut self) {
        while let Some(buffer) = self.frame.buffers().get(self.buf) {
            let window = buffer.size();
            if self.off < window {
                return;
            }
            self.off -= window;
            self.buf += 1;
        }
    }

    /// Flat byte offset from the start of the writable space.
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// Writable bytes left under the cursor.
    pub fn remaining(&self) -> usize {
        self.total - self.pos
    }

    /// Move forward without writing.
    pub fn skip(&mut self, count: usize) -> Result<()> {
        if count > self.remaining() {
            return Err(StreamError::Boundary { requested: count, limit: self.remaining() });
        }
        self.pos += count;
        self.off += count;
        self.normalize();
        Ok(())
    }

    /// Place the cursor at an absolute flat offset.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.total {
            return Err(StreamError::Boundary { requested: pos, limit: self.total });
        }
        self.pos = pos;
        self.buf = 0;
        self.off = pos;
        self.normalize();
        Ok(())
    }

    /// Copy `src` into the frame and advance past it.
    pub fn write_all(&mut self, src: &[u8]) -> Result<()> {
        if src.len() > self.remaining() {
            return Err(StreamError::Boundary { requested: src.len(), limit: self.remaining() });
        }
        let mut copied = 0;
        while copied < src.len() {
            let off = self.off;
            let Some(buffer) = self.frame.buffer_mut(self.buf) else {
                return Err(StreamError::Boundary { requested: src.len(), limit: copied });
            };
            let window = buffer.window_mut();
            let take = (window.len() - off).min(src.len() - copied);
            window[off..off + take].copy_from_slice(&src[copied..copied + take]);
            copied += take;
            self.pos += take;
            self.off += take;
            self.normalize();
        }
        Ok(())
    }

    /// Write one byte and advance.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_all(&[value])
    }

    /// Write a little-endian `u16` and advance.
    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    /// Write a little-endian `u32` and advance.
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    /// Write a little-endian `u64` and advance.
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_all(&value.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use proptest::prelude::*;

    /// Frame with the given buffer windows, every byte set to its flat
    /// index so positions are observable.
    fn patterned_frame(windows: &[usize]) -> Frame {
        let mut frame = Frame::new();
        let mut value = 0u8;
        for &window in windows {
            let mut buffer = Buffer::heap(window);
            buffer.set_payload_full();
            for byte in buffer.payload_bytes_mut() {
                *byte = value;
                value = value.wrapping_add(1);
            }
            frame.append_buffer(buffer);
        }
        frame
    }

    #[test]
    fn reads_span_buffer_boundaries() {
        let frame = patterned_frame(&[3, 1, 4]);
        let collected: Vec<u8> = frame.read_cursor().collect();
        assert_eq!(collected, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn multibyte_reads_straddle_boundaries() {
        let mut frame = Frame::new();
        for chunk in [&[0x78u8, 0x56][..], &[0x34, 0x12][..]] {
            let mut buffer = Buffer::heap(2);
            buffer.set_payload_full();
            buffer.payload_bytes_mut().copy_from_slice(chunk);
            frame.append_buffer(buffer);
        }

        let mut cursor = frame.read_cursor();
        assert_eq!(cursor.read_u32().unwrap(), 0x1234_5678);
        assert!(cursor.is_end());
    }

    #[test]
    fn end_cursor_is_sticky() {
        let frame = patterned_frame(&[4]);
        let cursor = frame.read_cursor() + 10;
        assert!(cursor.is_end());
        assert_eq!(cursor.offset(), 4);
    }

    #[test]
    fn write_then_read_round_trip() {
        let mut frame = Frame::new();
        frame.append_buffer(Buffer::heap(5));
        frame.append_buffer(Buffer::heap(7));

        let data: Vec<u8> = (0..12).map(|i| i * 3).collect();
        frame.write_cursor().write_all(&data).unwrap();
        frame.set_payload(data.len(), false).unwrap();

        let mut out = vec![0u8; data.len()];
        frame.read_cursor().read_exact(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn read_underflow_is_boundary() {
        let frame = patterned_frame(&[4]);
        let mut out = [0u8; 5];
        assert_eq!(
            frame.read_cursor().read_exact(&mut out),
            Err(StreamError::Boundary { requested: 5, limit: 4 })
        );
    }

    #[test]
    fn writes_respect_reservations() {
        let mut frame = Frame::new();
        let mut buffer = Buffer::heap(16);
        buffer.adjust_tail(4).unwrap();
        frame.append_buffer(buffer);

        let mut cursor = frame.write_cursor();
        assert_eq!(cursor.remaining(), 12);
        assert_eq!(
            cursor.write_all(&[0u8; 13]),
            Err(StreamError::Boundary { requested: 13, limit: 12 })
        );
    }

    proptest! {
        #[test]
        fn cursor_arithmetic_laws(
            windows in prop::collection::vec(0usize..16, 1..6),
            a in 0usize..64,
            b in 0usize..64,
        ) {
            let frame = patterned_frame(&windows);
            let total = frame.payload();

            let mut it1 = frame.read_cursor();
            let mut it2 = frame.read_cursor();
            it1 += a.min(total);
            it2 += b.min(total);
            if it2 < it1 {
                std::mem::swap(&mut it1, &mut it2);
            }

            // Distance and re-addition are exact.
            let gap = &it2 - &it1;
            prop_assert!(gap >= 0);
            let moved = it1.clone() + gap as usize;
            prop_assert_eq!(&moved, &it2);
            prop_assert_eq!(moved.offset(), it2.offset());

            // Relational operators agree with flat offsets.
            prop_assert_eq!(it1 <= it2, it1.offset() <= it2.offset());
        }

        #[test]
        fn bytes_equal_concatenation(windows in prop::collection::vec(0usize..16, 1..6)) {
            let frame = patterned_frame(&windows);

            let concat: Vec<u8> = frame
                .buffers()
                .iter()
                .flat_map(|b| b.payload_bytes().to_vec())
                .collect();
            let walked: Vec<u8> = frame.read_cursor().collect();
            prop_assert_eq!(walked, concat);
        }

        #[test]
        fn write_read_inverse(
            windows in prop::collection::vec(1usize..16, 1..6),
            seed in any::<u8>(),
        ) {
            let mut frame = Frame::new();
            for &window in &windows {
                frame.append_buffer(Buffer::heap(window));
            }
            let total = frame.size();
            let data: Vec<u8> = (0..total).map(|i| seed.wrapping_add(i as u8)).collect();

            frame.write_cursor().write_all(&data).unwrap();
            frame.set_payload(total, false).unwrap();

            let mut out = vec![0u8; total];
            let mut cursor = frame.read_cursor();
            cursor.read_exact(&mut out).unwrap();
            cursor.rewind(total).unwrap();
            prop_assert_eq!(cursor.offset(), 0);
            prop_assert_eq!(out, data);
        }
    }
}
