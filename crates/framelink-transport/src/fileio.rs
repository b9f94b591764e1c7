//! Persisted frame streams.
//!
//! On-disk record format, little endian:
//!
//! ```text
//! +-----------+----------------------------------+----------------+
//! | size: u32 | meta: flags:16 error:8 channel:8 | payload bytes  |
//! +-----------+----------------------------------+----------------+
//! ```
//!
//! `size` counts the meta word plus the payload. With a size limit set,
//! the writer rolls over to `<base>.1`, `<base>.2`, … before a record
//! would cross the limit; the reader follows the same chain.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;

use framelink_stream::{Buffer, Frame, SharedFrame, StreamSlave};

use crate::error::TransportError;

fn chain_path(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

struct WriterInner {
    base: PathBuf,
    file: Option<File>,
    file_index: u32,
    size_limit: u64,
    buffer_size: usize,
    staged: BytesMut,
    current_size: u64,
}

impl WriterInner {
    fn open_next(&mut self) -> Result<(), TransportError> {
        self.flush()?;
        let path = if self.size_limit > 0 {
            self.file_index += 1;
            chain_path(&self.base, self.file_index)
        } else {
            self.base.clone()
        };
        let file =
            OpenOptions::new().create(true).append(true).open(&path).map_err(|source| {
                TransportError::Open { path: path.display().to_string(), source }
            })?;
        tracing::info!(path = %path.display(), "stream file opened");
        self.file = Some(file);
        self.current_size = 0;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        if let Some(file) = &mut self.file {
            if !self.staged.is_empty() {
                file.write_all(&self.staged)?;
                self.staged.clear();
            }
        }
        Ok(())
    }

    fn write_record(&mut self, meta: u32, payload: &[u8]) -> Result<(), TransportError> {
        let record_len = 8 + payload.len() as u64;
        if self.size_limit > 0 && self.current_size + record_len > self.size_limit {
            self.open_next()?;
        }
        if self.file.is_none() {
            return Err(TransportError::Io(std::io::Error::from(
                std::io::ErrorKind::NotConnected,
            )));
        }

        self.staged.put_u32_le(payload.len() as u32 + 4);
        self.staged.put_u32_le(meta);
        self.staged.put_slice(payload);
        self.current_size += record_len;

        if self.staged.len() >= self.buffer_size {
            self.flush()?;
        }
        Ok(())
    }
}

/// Frame sink writing size-prefixed records to disk.
pub struct StreamWriter {
    inner: Mutex<WriterInner>,
    frame_count: AtomicU32,
    byte_count: AtomicU64,
}

impl StreamWriter {
    /// Create a closed writer; call [`StreamWriter::open`].
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(WriterInner {
                base: PathBuf::new(),
                file: None,
                file_index: 0,
                size_limit: 0,
                buffer_size: 0,
                staged: BytesMut::new(),
                current_size: 0,
            }),
            frame_count: AtomicU32::new(0),
            byte_count: AtomicU64::new(0),
        })
    }

    /// Open `base` for writing (or `<base>.1` when a size limit is set).
    pub fn open(&self, base: impl AsRef<Path>) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        inner.base = base.as_ref().to_path_buf();
        inner.file_index = 0;
        inner.open_next()
    }

    /// Close the file, flushing staged records.
    pub fn close(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        inner.flush()?;
        inner.file = None;
        Ok(())
    }

    /// Roll over to a fresh file before any record would push the current
    /// one past `limit` bytes; zero disables rollover.
    pub fn set_max_size(&self, limit: u64) {
        self.inner.lock().size_limit = limit;
    }

    /// Stage up to `size` bytes in memory between syscalls; zero writes
    /// through.
    pub fn set_buffer_size(&self, size: usize) {
        self.inner.lock().buffer_size = size;
    }

    /// Frames written so far.
    pub fn frame_count(&self) -> u32 {
        self.frame_count.load(Ordering::Relaxed)
    }

    /// Payload bytes written so far.
    pub fn byte_count(&self) -> u64 {
        self.byte_count.load(Ordering::Relaxed)
    }
}

impl StreamSlave for StreamWriter {
    fn accept_frame(&self, frame: SharedFrame) {
        let guard = frame.lock();
        let meta = u32::from(guard.flags())
            | (u32::from(guard.error()) << 16)
            | (u32::from(guard.channel()) << 24);
        let payload: Vec<u8> = guard.read_cursor().collect();
        drop(guard);

        let mut inner = self.inner.lock();
        match inner.write_record(meta, &payload) {
            Ok(()) => {
                self.frame_count.fetch_add(1, Ordering::Relaxed);
                self.byte_count.fetch_add(payload.len() as u64, Ordering::Relaxed);
            },
            Err(err) => tracing::warn!(%err, "record not written"),
        }
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(%err, "flush on close failed");
        }
    }
}

/// Replays a written stream back into the fabric.
pub struct StreamReader {
    master: framelink_stream::Master,
}

impl StreamReader {
    /// Create a reader; attach slaves, then call [`StreamReader::replay`].
    pub fn new() -> Arc<Self> {
        Arc::new(Self { master: framelink_stream::Master::new() })
    }

    /// Attach a slave receiving the replayed frames.
    pub fn attach(&self, slave: Arc<dyn StreamSlave>) {
        self.master.add_slave(slave);
    }

    /// Replay `base` (following its rollover chain) and return the number
    /// of frames delivered.
    pub fn replay(&self, base: impl AsRef<Path>) -> Result<u32, TransportError> {
        let base = base.as_ref();
        let mut delivered = 0;

        if base.exists() {
            delivered += self.replay_file(base)?;
        } else {
            let mut index = 1;
            loop {
                let link = chain_path(base, index);
                if !link.exists() {
                    break;
                }
                delivered += self.replay_file(&link)?;
                index += 1;
            }
        }
        Ok(delivered)
    }

    fn replay_file(&self, path: &Path) -> Result<u32, TransportError> {
        let mut file = File::open(path).map_err(|source| TransportError::Open {
            path: path.display().to_string(),
            source,
        })?;

        let mut delivered = 0;
        loop {
            let mut word = [0u8; 4];
            match file.read_exact(&mut word) {
                Ok(()) => {},
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(TransportError::Io(err)),
            }
            let size = u32::from_le_bytes(word) as usize;
            if size < 4 {
                tracing::warn!(path = %path.display(), size, "corrupt record, replay stopped");
                break;
            }

            file.read_exact(&mut word)?;
            let meta = u32::from_le_bytes(word);

            let payload_len = size - 4;
            let mut payload = vec![0u8; payload_len];
            file.read_exact(&mut payload)?;

            let mut frame = Frame::new();
            if payload_len > 0 {
                let mut buffer = Buffer::heap(payload_len);
                buffer.set_payload_full();
                buffer.payload_bytes_mut().copy_from_slice(&payload);
                frame.append_buffer(buffer);
            }
            frame.set_flags((meta & 0xFFFF) as u16);
            frame.set_error(((meta >> 16) & 0xFF) as u8);
            frame.set_channel((meta >> 24) as u8);

            self.master.send_frame(&frame.into_shared());
            delivered += 1;
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct Sink {
        frames: PlMutex<Vec<SharedFrame>>,
    }

    impl StreamSlave for Sink {
        fn accept_frame(&self, frame: SharedFrame) {
            self.frames.lock().push(frame);
        }
    }

    fn sample_frame(channel: u8, fill: u8, len: usize) -> SharedFrame {
        let mut buffer = Buffer::heap(len);
        buffer.set_payload_full();
        buffer.payload_bytes_mut().fill(fill);
        let mut frame = Frame::new();
        frame.append_buffer(buffer);
        frame.set_flags(0x2211);
        frame.set_channel(channel);
        frame.into_shared()
    }

    #[test]
    fn write_then_replay_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.dat");

        let writer = StreamWriter::new();
        writer.open(&path).unwrap();
        for (channel, fill) in [(3u8, 0xAA), (4, 0xBB)] {
            writer.accept_frame(sample_frame(channel, fill, 16));
        }
        writer.close().unwrap();
        assert_eq!(writer.frame_count(), 2);

        let reader = StreamReader::new();
        let sink = Arc::new(Sink::default());
        reader.attach(sink.clone());
        assert_eq!(reader.replay(&path).unwrap(), 2);

        let frames = sink.frames.lock();
        for (frame, (channel, fill)) in frames.iter().zip([(3u8, 0xAAu8), (4, 0xBB)]) {
            let guard = frame.lock();
            assert_eq!(guard.channel(), channel);
            assert_eq!(guard.flags(), 0x2211);
            assert_eq!(guard.payload(), 16);
            assert!(guard.read_cursor().all(|byte| byte == fill));
        }
    }

    #[test]
    fn record_layout_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layout.dat");

        let writer = StreamWriter::new();
        writer.open(&path).unwrap();
        writer.accept_frame(sample_frame(7, 0x5A, 8));
        writer.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 4 + 4 + 8);
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 12);
        let meta = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(meta & 0xFFFF, 0x2211);
        assert_eq!(meta >> 24, 7);
        assert_eq!(&bytes[8..], &[0x5A; 8]);
    }

    #[test]
    fn rollover_chain_is_written_and_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roll.dat");

        let writer = StreamWriter::new();
        writer.set_max_size(56);
        writer.open(&path).unwrap();
        // 24 bytes per record, so two records per file.
        for fill in 0..5u8 {
            writer.accept_frame(sample_frame(0, fill, 16));
        }
        writer.close().unwrap();

        assert!(chain_path(&path, 1).exists());
        assert!(chain_path(&path, 2).exists());
        assert!(chain_path(&path, 3).exists());
        assert!(!chain_path(&path, 4).exists());
        assert!(!path.exists());

        let reader = StreamReader::new();
        let sink = Arc::new(Sink::default());
        reader.attach(sink.clone());
        assert_eq!(reader.replay(&path).unwrap(), 5);

        let frames = sink.frames.lock();
        let fills: Vec<u8> = frames
            .iter()
            .map(|frame| frame.lock().read_cursor().next().unwrap())
            .collect();
        assert_eq!(fills, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn buffered_writes_flush_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffered.dat");

        let writer = StreamWriter::new();
        writer.set_buffer_size(1 << 16);
        writer.open(&path).unwrap();
        writer.accept_frame(sample_frame(0, 1, 32));

        // Still staged in memory.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
        writer.close().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 40);
    }
}
