//! FPGA DMA character-device shim.
//!
//! Talks the legacy kernel driver interface: the ioctl opcodes and the
//! read/write request structures below are bit-exact and must not change,
//! they are shared with deployed kernel modules. The driver exposes its
//! receive buffers through an `mmap` window; inbound frames arrive as
//! buffer indices and are wrapped into zero-copy [`Buffer`]s whose meta
//! word carries [`META_HARDWARE`] plus the index, so the pool can hand
//! the index back through `RetIndex` exactly once when the frame is
//! dropped.
//!
//! The device surface is the [`DmaDevice`] trait; [`CharDevice`] is the
//! real `open`/`ioctl`/`mmap` implementation and the only unsafe code in
//! the workspace. Tests run against an in-memory mock.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use framelink_stream::buffer::{META_HARDWARE, META_INDEX_MASK, META_RETURNED};
use framelink_stream::{
    Buffer, BufferReturn, BufferStorage, Frame, Master, Result, SharedFrame, StreamError,
    StreamSlave,
};

use crate::error::TransportError;

/// Kernel driver interface version this shim understands.
pub const DMA_VERSION: i32 = 0x06;

/// Destination mask bitmap size in bytes (one bit per destination).
pub const DMA_MASK_SIZE: usize = 512;

/// Driver ioctl opcodes (legacy wire-compatible values).
pub mod opcode {
    /// Number of DMA buffers.
    pub const GET_BUFF_COUNT: u64 = 0x1001;
    /// Size of one DMA buffer.
    pub const GET_BUFF_SIZE: u64 = 0x1002;
    /// Set driver debug level.
    pub const SET_DEBUG: u64 = 0x1003;
    /// Set the 32-bit destination mask.
    pub const SET_MASK: u64 = 0x1004;
    /// Return a buffer index; a 16-bit count rides in the upper half.
    pub const RET_INDEX: u64 = 0x1005;
    /// Fetch the next transmit index.
    pub const GET_INDEX: u64 = 0x1006;
    /// Poll for receive data.
    pub const READ_READY: u64 = 0x1007;
    /// Set the 512-byte destination bitmap.
    pub const SET_MASK_BYTES: u64 = 0x1008;
    /// Query the driver interface version.
    pub const GET_VERSION: u64 = 0x1009;
    /// Write a firmware register.
    pub const WRITE_REGISTER: u64 = 0x100A;
    /// Read a firmware register.
    pub const READ_REGISTER: u64 = 0x100B;
}

/// Driver error bits surfaced on received frames.
pub mod error_bit {
    /// FIFO overflow.
    pub const FIFO: u32 = 0x01;
    /// Length mismatch.
    pub const LEN: u32 = 0x02;
    /// Oversize frame.
    pub const MAX: u32 = 0x04;
    /// Bus fault.
    pub const BUS: u32 = 0x08;
    /// Protocol end-of-frame error.
    pub const EOFE: u32 = 0x10;
}

/// Transmit request handed to the driver's `write`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DmaWriteData {
    /// Source data pointer.
    pub data: u64,
    /// Destination.
    pub dest: u32,
    /// Sideband flags: first-user low byte, last-user next byte.
    pub flags: u32,
    /// Buffer index for zero-copy transmits.
    pub index: u32,
    /// Transfer size in bytes.
    pub size: u32,
    /// Nonzero when the data pointer is 32-bit.
    pub is32: u32,
    /// Structure padding, zero.
    pub pad: u32,
}

/// Receive request handed to the driver's `read`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DmaReadData {
    /// Destination data pointer; zero requests a zero-copy index.
    pub data: u64,
    /// Destination the frame arrived on.
    pub dest: u32,
    /// Sideband flags.
    pub flags: u32,
    /// Buffer index for zero-copy receives.
    pub index: u32,
    /// Driver error bits.
    pub error: u32,
    /// Frame size in bytes.
    pub size: u32,
    /// Nonzero when the data pointer is 32-bit.
    pub is32: u32,
    /// Driver return value.
    pub ret: i32,
}

/// Sideband flag packing used by the stream driver.
pub fn pack_flags(first_user: u8, last_user: u8) -> u32 {
    u32::from(first_user) | (u32::from(last_user) << 8)
}

fn unpack_flags(flags: u32) -> u16 {
    (flags & 0xFFFF) as u16
}

/// Device surface the shim drives.
///
/// Semantic wrappers over the raw opcodes so tests can substitute an
/// in-memory implementation; [`CharDevice`] maps each method onto the
/// real ioctl.
pub trait DmaDevice: Send + Sync {
    /// Driver interface version.
    fn version(&self) -> i32;

    /// Number of mapped receive buffers.
    fn buffer_count(&self) -> i32;

    /// Size of one receive buffer.
    fn buffer_size(&self) -> i32;

    /// Install the destination bitmap.
    fn set_mask_bytes(&self, mask: &[u8; DMA_MASK_SIZE]) -> i32;

    /// Hand one buffer index back to the driver.
    fn ret_index(&self, index: u32) -> i32;

    /// Map the driver's buffers; `None` when the driver has no mapping.
    ///
    /// The slices stay valid for the life of the process; the pool keeps
    /// the device handle alive while any buffer is outstanding.
    fn map_buffers(&self, count: u32, size: u32) -> Option<Vec<&'static mut [u8]>>;

    /// Blocking-with-timeout receive. Fills `request` and returns the
    /// frame size, zero when nothing arrived, negative on error.
    fn read_frame(&self, request: &mut DmaReadData, copy_into: Option<&mut [u8]>) -> i64;

    /// Transmit `data` to `dest` with packed sideband `flags`.
    fn write_frame(&self, data: &[u8], dest: u32, flags: u32) -> i64;
}

/// Real character-device implementation.
// The raw fd and mmap region are driven through libc; this is the one
// module allowed to contain unsafe code in the workspace.
#[allow(unsafe_code)]
pub mod chardev {
    use super::{DMA_MASK_SIZE, DmaDevice, DmaReadData, DmaWriteData, opcode};
    use crate::error::TransportError;
    use std::ffi::CString;
    use std::sync::Arc;

    /// Open DMA character device.
    pub struct CharDevice {
        fd: i32,
    }

    impl CharDevice {
        /// Open the device node read/write.
        pub fn open(path: &str) -> Result<Arc<Self>, TransportError> {
            let cpath = CString::new(path).map_err(|_| TransportError::Open {
                path: path.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
            })?;

            // SAFETY: cpath is a valid NUL-terminated string.
            let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR) };
            if fd < 0 {
                return Err(TransportError::Open {
                    path: path.to_string(),
                    source: std::io::Error::last_os_error(),
                });
            }
            Ok(Arc::new(Self { fd }))
        }

        fn ioctl(&self, cmd: u64, arg: u64) -> i32 {
            // SAFETY: fd is a device fd owned by self; the driver defines
            // the argument as a plain integer or pointer value.
            unsafe { libc::ioctl(self.fd, cmd, arg) }
        }
    }

    impl DmaDevice for CharDevice {
        fn version(&self) -> i32 {
            self.ioctl(opcode::GET_VERSION, 0)
        }

        fn buffer_count(&self) -> i32 {
            self.ioctl(opcode::GET_BUFF_COUNT, 0)
        }

        fn buffer_size(&self) -> i32 {
            self.ioctl(opcode::GET_BUFF_SIZE, 0)
        }

        fn set_mask_bytes(&self, mask: &[u8; DMA_MASK_SIZE]) -> i32 {
            self.ioctl(opcode::SET_MASK_BYTES, mask.as_ptr() as u64)
        }

        fn ret_index(&self, index: u32) -> i32 {
            // One index per call: count of 1 in the upper half.
            self.ioctl(opcode::RET_INDEX | 0x1_0000, u64::from(index))
        }

        fn map_buffers(&self, count: u32, size: u32) -> Option<Vec<&'static mut [u8]>> {
            let total = count as usize * size as usize;
            if total == 0 {
                return None;
            }
            // SAFETY: mapping the driver's buffer window; the region is
            // never unmapped, so handing out 'static slices is sound.
            let base = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    total,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    self.fd,
                    0,
                )
            };
            if base == libc::MAP_FAILED {
                return None;
            }

            let mut slices = Vec::with_capacity(count as usize);
            for idx in 0..count as usize {
                // SAFETY: each slice covers a distinct buffer inside the
                // mapping created above.
                let slice = unsafe {
                    std::slice::from_raw_parts_mut(
                        (base as *mut u8).add(idx * size as usize),
                        size as usize,
                    )
                };
                slices.push(slice);
            }
            Some(slices)
        }

        fn read_frame(&self, request: &mut DmaReadData, copy_into: Option<&mut [u8]>) -> i64 {
            if let Some(scratch) = copy_into {
                request.data = scratch.as_mut_ptr() as u64;
                request.size = scratch.len() as u32;
            } else {
                request.data = 0;
            }
            // SAFETY: request is a properly sized DmaReadData; the driver
            // fills it in place.
            let res = unsafe {
                libc::read(
                    self.fd,
                    std::ptr::from_mut(request).cast(),
                    std::mem::size_of::<DmaReadData>(),
                )
            };
            res as i64
        }

        fn write_frame(&self, data: &[u8], dest: u32, flags: u32) -> i64 {
            let request = DmaWriteData {
                data: data.as_ptr() as u64,
                dest,
                flags,
                index: 0,
                size: data.len() as u32,
                is32: 0,
                pad: 0,
            };
            // SAFETY: request points at live data for the duration of the
            // call; the driver copies synchronously.
            let res = unsafe {
                libc::write(
                    self.fd,
                    std::ptr::from_ref(&request).cast(),
                    std::mem::size_of::<DmaWriteData>(),
                )
            };
            res as i64
        }
    }

    impl Drop for CharDevice {
        fn drop(&mut self) {
            // SAFETY: fd was opened by us and is closed exactly once. The
            // mmap window is intentionally left in place; outstanding
            // zero-copy buffers may still reference it.
            unsafe { libc::close(self.fd) };
        }
    }
}

pub use chardev::CharDevice;

/// Zero-copy pool over the driver's buffer mapping.
struct DmaPool {
    dev: Arc<dyn DmaDevice>,
    slots: Mutex<Vec<Option<&'static mut [u8]>>>,
}

impl DmaPool {
    /// Take the slice for a hardware index out of the table.
    fn take(&self, index: u32) -> Option<&'static mut [u8]> {
        self.slots.lock().get_mut(index as usize).and_then(Option::take)
    }
}

impl BufferReturn for DmaPool {
    fn return_buffer(&self, storage: BufferStorage, meta: u32) {
        if meta & META_HARDWARE == 0 || meta & META_RETURNED != 0 {
            return;
        }
        let BufferStorage::Mapped(slice) = storage else { return };
        let index = meta & META_INDEX_MASK;

        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(index as usize) else { return };
        if slot.is_some() {
            // Already home; forwarding the index again would corrupt the
            // driver's free list.
            tracing::warn!(index, "duplicate hardware buffer return suppressed");
            return;
        }
        *slot = Some(slice);
        drop(slots);
        self.dev.ret_index(index);
    }
}

/// Stream endpoint over one DMA destination.
pub struct DmaStream {
    dev: Arc<dyn DmaDevice>,
    dest: u32,
    pool: Option<Arc<DmaPool>>,
    buffer_size: usize,
    master: Master,
    rx_frames: AtomicU32,
    tx_frames: AtomicU32,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    this: Weak<DmaStream>,
}

impl fmt::Debug for DmaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaStream")
            .field("dest", &self.dest)
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}

impl DmaStream {
    /// Bring up the shim on `dest`: verify the driver version, install
    /// the destination mask and map the zero-copy window if the driver
    /// provides one.
    pub fn new(
        dev: Arc<dyn DmaDevice>,
        dest: u32,
    ) -> std::result::Result<Arc<Self>, TransportError> {
        let version = dev.version();
        if version != DMA_VERSION {
            return Err(TransportError::DriverVersion(version));
        }

        let mut mask = [0u8; DMA_MASK_SIZE];
        mask[dest as usize / 8] |= 1 << (dest % 8);
        if dev.set_mask_bytes(&mask) < 0 {
            return Err(TransportError::Driver { operation: "set destination mask" });
        }

        let count = dev.buffer_count().max(0) as u32;
        let size = dev.buffer_size().max(0) as u32;
        let pool = dev.map_buffers(count, size).map(|slices| {
            Arc::new(DmaPool {
                dev: dev.clone(),
                slots: Mutex::new(slices.into_iter().map(Some).collect()),
            })
        });

        tracing::info!(dest, count, size, zero_copy = pool.is_some(), "dma stream up");
        Ok(Arc::new_cyclic(|this| Self {
            dev,
            dest,
            pool,
            buffer_size: size as usize,
            master: Master::new(),
            rx_frames: AtomicU32::new(0),
            tx_frames: AtomicU32::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            this: this.clone(),
        }))
    }

    /// Attach a slave receiving inbound frames.
    pub fn attach(&self, slave: Arc<dyn StreamSlave>) {
        self.master.add_slave(slave);
    }

    /// Frames received so far.
    pub fn rx_frame_count(&self) -> u32 {
        self.rx_frames.load(Ordering::Relaxed)
    }

    /// Frames transmitted so far.
    pub fn tx_frame_count(&self) -> u32 {
        self.tx_frames.load(Ordering::Relaxed)
    }

    /// Spawn the receive worker.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let this = self.this.clone();
        let shutdown = self.shutdown.clone();
        *worker = Some(thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                let Some(stream) = this.upgrade() else { return };
                if !stream.rx_once() {
                    thread::sleep(Duration::from_micros(100));
                }
            }
        }));
    }

    /// Stop and join the receive worker.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Service one receive; true when a frame was delivered.
    fn rx_once(&self) -> bool {
        let mut request = DmaReadData::default();

        let buffer = if let Some(pool) = &self.pool {
            let res = self.dev.read_frame(&mut request, None);
            if res <= 0 {
                return false;
            }
            let Some(slice) = pool.take(request.index) else {
                tracing::warn!(index = request.index, "driver returned an index we do not hold");
                return false;
            };
            let source: Arc<dyn BufferReturn> = pool.clone();
            let mut buffer = Buffer::new(
                BufferStorage::Mapped(slice),
                Some(source),
                META_HARDWARE | (request.index & META_INDEX_MASK),
            );
            if buffer.set_payload(res as usize).is_err() {
                tracing::warn!(size = res, "oversize dma frame");
                return false;
            }
            buffer
        } else {
            let mut scratch = vec![0u8; self.buffer_size.max(4096)];
            let res = self.dev.read_frame(&mut request, Some(&mut scratch));
            if res <= 0 {
                return false;
            }
            let mut buffer = Buffer::new(
                BufferStorage::Heap(scratch.into_boxed_slice()),
                None,
                0,
            );
            if buffer.set_payload(res as usize).is_err() {
                return false;
            }
            buffer
        };

        let mut frame = Frame::new();
        frame.append_buffer(buffer);
        frame.set_flags(unpack_flags(request.flags));
        if request.error != 0 {
            frame.set_error((request.error & 0xFF) as u8);
            tracing::warn!(error = request.error, "dma frame error bits");
        }

        self.rx_frames.fetch_add(1, Ordering::Relaxed);
        self.master.send_frame(&frame.into_shared());
        true
    }
}

impl StreamSlave for DmaStream {
    fn accept_frame(&self, frame: SharedFrame) {
        let guard = frame.lock();
        let flags = pack_flags(guard.first_user(), guard.last_user());
        for buffer in guard.buffers() {
            let data = buffer.payload_bytes();
            if data.is_empty() {
                continue;
            }
            let res = self.dev.write_frame(data, self.dest, flags);
            if res < 0 {
                tracing::warn!(res, "dma write failed");
                return;
            }
        }
        self.tx_frames.fetch_add(1, Ordering::Relaxed);
    }

    fn accept_req(&self, size: usize, _zero_copy: bool) -> Result<SharedFrame> {
        // Transmit path copies through the driver, so plain heap buffers
        // bounded by the hardware buffer size are fine.
        let cap = if self.buffer_size == 0 { 4096 } else { self.buffer_size };
        let mut frame = Frame::new();
        while frame.available() < size {
            let want = (size - frame.available()).min(cap);
            if want == 0 {
                return Err(StreamError::Allocation { requested: size });
            }
            frame.append_buffer(Buffer::heap(want.max(1)));
        }
        Ok(frame.into_shared())
    }
}

impl Drop for DmaStream {
    fn drop(&mut self) {
        self.stop();
    }
}
