//! PRBS traffic generator and checker.
//!
//! Frames carry a 4-byte little-endian sequence number followed by 32-bit
//! words from a Fibonacci LFSR (taps 1, 2, 6, 31) seeded with the
//! sequence. The checker regenerates the expected words from the received
//! sequence, so a single instance can validate traffic from any generator
//! without shared state beyond the sequence ordering.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use framelink_stream::{Buffer, Frame, Master, Result, SharedFrame, StreamError, StreamSlave};

/// Advance the LFSR by one step.
fn lfsr_step(value: u32) -> u32 {
    let feedback =
        (value >> 1) ^ (value >> 2) ^ (value >> 6) ^ (value >> 31);
    (value << 1) | (feedback & 1)
}

/// PRBS generator/checker endpoint.
pub struct Prbs {
    tx_seq: Mutex<u32>,
    rx_seq: Mutex<Option<u32>>,
    master: Master,
    tx_count: AtomicU32,
    tx_bytes: AtomicU64,
    rx_count: AtomicU32,
    rx_bytes: AtomicU64,
    rx_errors: AtomicU32,
}

impl Prbs {
    /// Fresh endpoint with sequence zero.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tx_seq: Mutex::new(0),
            rx_seq: Mutex::new(None),
            master: Master::new(),
            tx_count: AtomicU32::new(0),
            tx_bytes: AtomicU64::new(0),
            rx_count: AtomicU32::new(0),
            rx_bytes: AtomicU64::new(0),
            rx_errors: AtomicU32::new(0),
        })
    }

    /// Attach a slave receiving generated frames.
    pub fn attach(&self, slave: Arc<dyn StreamSlave>) {
        self.master.add_slave(slave);
    }

    /// Frames generated.
    pub fn tx_count(&self) -> u32 {
        self.tx_count.load(Ordering::Relaxed)
    }

    /// Payload bytes generated.
    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    /// Frames checked.
    pub fn rx_count(&self) -> u32 {
        self.rx_count.load(Ordering::Relaxed)
    }

    /// Payload bytes checked.
    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    /// Content or ordering failures observed.
    pub fn rx_error_count(&self) -> u32 {
        self.rx_errors.load(Ordering::Relaxed)
    }

    /// Fill `frame` with the next PRBS payload of `size` bytes.
    ///
    /// `size` must be a multiple of 4 and at least 8.
    pub fn fill_frame(&self, frame: &SharedFrame, size: usize) -> Result<()> {
        if size < 8 || size % 4 != 0 {
            return Err(StreamError::Boundary { requested: size, limit: 8 });
        }

        let sequence = {
            let mut tx_seq = self.tx_seq.lock();
            let sequence = *tx_seq;
            *tx_seq = tx_seq.wrapping_add(1);
            sequence
        };

        let mut guard = frame.lock();
        {
            let mut cursor = guard.write_cursor();
            cursor.write_u32(sequence)?;
            let mut word = sequence ^ 0xA5A5_A5A5;
            for _ in 0..(size - 4) / 4 {
                word = lfsr_step(word);
                cursor.write_u32(word)?;
            }
        }
        guard.set_payload(size, false)?;

        self.tx_count.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(size as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Generate a heap-backed PRBS frame of `size` bytes.
    pub fn gen_frame(&self, size: usize) -> Result<SharedFrame> {
        let mut buffer = Buffer::heap(size);
        buffer.set_payload_empty();
        let mut frame = Frame::new();
        frame.append_buffer(buffer);
        let shared = frame.into_shared();
        self.fill_frame(&shared, size)?;
        Ok(shared)
    }

    /// Generate one frame and push it to the attached slaves.
    pub fn send_one(&self, size: usize) -> Result<()> {
        let frame = self.gen_frame(size)?;
        self.master.send_frame(&frame);
        Ok(())
    }

    /// Validate one received frame; used by the `StreamSlave` impl.
    pub fn check_frame(&self, frame: &SharedFrame) {
        let guard = frame.lock();
        let size = guard.payload();
        self.rx_count.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(size as u64, Ordering::Relaxed);

        if guard.error() != 0 || size < 8 || size % 4 != 0 {
            self.rx_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut cursor = guard.read_cursor();
        let Ok(sequence) = cursor.read_u32() else {
            self.rx_errors.fetch_add(1, Ordering::Relaxed);
            return;
        };

        // Sequence must advance by one between frames.
        {
            let mut rx_seq = self.rx_seq.lock();
            if let Some(expect) = *rx_seq {
                if sequence != expect {
                    tracing::warn!(sequence, expect, "prbs sequence skew");
                    self.rx_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
            *rx_seq = Some(sequence.wrapping_add(1));
        }

        let mut word = sequence ^ 0xA5A5_A5A5;
        for _ in 0..(size - 4) / 4 {
            word = lfsr_step(word);
            match cursor.read_u32() {
                Ok(got) if got == word => {},
                _ => {
                    tracing::warn!(sequence, "prbs payload mismatch");
                    self.rx_errors.fetch_add(1, Ordering::Relaxed);
                    return;
                },
            }
        }
    }
}

impl StreamSlave for Prbs {
    fn accept_frame(&self, frame: SharedFrame) {
        self.check_frame(&frame);
    }
}
