//! Packetizer controller: segmentation, reassembly, transmit drain.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use framelink_proto::packetizer::{
    HEADER_SIZE, MIN_SEGMENT, RollingCrc, SegmentHeader, SegmentTrailer, TRAILER_SIZE,
    last_word_bytes,
};
use framelink_stream::{
    Frame, FrameQueue, Master, Result, SharedFrame, StreamError, StreamSlave,
};

/// Packetizer tuning knobs.
#[derive(Debug, Clone)]
pub struct PacketizerConfig {
    /// Per-segment payload budget requested from the transport pool.
    pub segment_size: usize,
    /// Stamp and verify segment CRCs.
    pub enable_crc: bool,
    /// Transmit queue depth in segments.
    pub queue_depth: usize,
    /// Admission timeout for application frames while the queue is busy.
    pub timeout: Duration,
}

impl Default for PacketizerConfig {
    fn default() -> Self {
        Self {
            segment_size: 1024,
            enable_crc: true,
            queue_depth: 64,
            timeout: Duration::from_secs(1),
        }
    }
}

/// Per-destination reassembly state.
struct RxState {
    frames: Vec<Option<Frame>>,
    counts: Vec<u16>,
    sofs: Vec<bool>,
    crcs: Vec<RollingCrc>,
}

impl RxState {
    fn new() -> Self {
        Self {
            frames: (0..256).map(|_| None).collect(),
            counts: vec![0; 256],
            sofs: vec![true; 256],
            crcs: vec![RollingCrc::new(); 256],
        }
    }

    fn reset(&mut self, dest: u8) {
        let dest = usize::from(dest);
        self.frames[dest] = None;
        self.counts[dest] = 0;
        self.sofs[dest] = true;
        self.crcs[dest].reset();
    }
}

/// Application-side transmit state.
struct TxState {
    index: u8,
    crc: RollingCrc,
}

/// Packetizer v2 controller.
pub struct Packetizer {
    config: PacketizerConfig,
    transport: Master,
    rx: Mutex<RxState>,
    tx: Mutex<TxState>,
    tx_queue: FrameQueue,
    apps: Mutex<Vec<Option<Arc<dyn StreamSlave>>>>,
    drop_count: AtomicU32,
    rx_frames: AtomicU32,
    tx_frames: AtomicU32,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    this: Weak<Packetizer>,
}

impl Packetizer {
    /// Create a controller; attach a transport and call
    /// [`Packetizer::start`] before use.
    pub fn new(config: PacketizerConfig) -> Arc<Self> {
        let queue_depth = config.queue_depth;
        Arc::new_cyclic(|this| Self {
            config,
            transport: Master::new(),
            rx: Mutex::new(RxState::new()),
            tx: Mutex::new(TxState { index: 0, crc: RollingCrc::new() }),
            tx_queue: FrameQueue::new(queue_depth),
            apps: Mutex::new((0..256).map(|_| None).collect()),
            drop_count: AtomicU32::new(0),
            rx_frames: AtomicU32::new(0),
            tx_frames: AtomicU32::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            this: this.clone(),
        })
    }

    /// Attach the transport slave segments are sent to and buffers are
    /// requested from.
    pub fn attach_transport(&self, slave: Arc<dyn StreamSlave>) {
        self.transport.add_slave(slave);
    }

    /// Register the application slave receiving reassembled frames for
    /// `dest`.
    pub fn set_application(&self, dest: u8, slave: Arc<dyn StreamSlave>) {
        self.apps.lock()[usize::from(dest)] = Some(slave);
    }

    /// Application-facing port for frames addressed to `dest`.
    pub fn application(&self, dest: u8) -> Arc<ApplicationPort> {
        Arc::new(ApplicationPort { ctrl: self.this.clone(), dest })
    }

    /// Transport-facing port receiving wire segments.
    pub fn transport_port(&self) -> Arc<TransportPort> {
        Arc::new(TransportPort { ctrl: self.this.clone() })
    }

    /// Segments dropped by the receive path.
    pub fn drop_count(&self) -> u32 {
        self.drop_count.load(Ordering::Relaxed)
    }

    /// Frames fully reassembled and delivered upstream.
    pub fn rx_frame_count(&self) -> u32 {
        self.rx_frames.load(Ordering::Relaxed)
    }

    /// Application frames segmented onto the transmit queue.
    pub fn tx_frame_count(&self) -> u32 {
        self.tx_frames.load(Ordering::Relaxed)
    }

    /// Spawn the transmit drain worker.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let this = self.this.clone();
        let shutdown = self.shutdown.clone();
        *worker = Some(thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                let Some(ctrl) = this.upgrade() else { break };
                let deadline = Instant::now() + Duration::from_millis(100);
                if let Some(frame) = ctrl.tx_queue.pop_front(deadline) {
                    ctrl.transport.send_frame(&frame);
                }
            }
        }));
    }

    /// Stop and join the drain worker.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Handle one wire segment.
    pub fn transport_rx(&self, frame: &SharedFrame) {
        let delivery = {
            let mut guard = frame.lock();
            let mut rx = self.rx.lock();
            match self.reassemble(&mut guard, &mut rx) {
                Ok(delivery) => delivery,
                Err(dest) => {
                    self.drop_count.fetch_add(1, Ordering::Relaxed);
                    if let Some(dest) = dest {
                        rx.reset(dest);
                    }
                    return;
                },
            }
        };

        // Deliver outside both locks so the application side cannot
        // deadlock against the transport side.
        if let Some((dest, done)) = delivery {
            self.rx_frames.fetch_add(1, Ordering::Relaxed);
            let app = self.apps.lock()[usize::from(dest)].clone();
            if let Some(app) = app {
                app.accept_frame(done.into_shared());
            } else {
                tracing::warn!(dest, "reassembled frame with no application attached");
            }
        }
    }

    /// Core of the receive algorithm. `Err(Some(dest))` drops the segment
    /// and resets that destination; `Err(None)` drops it before the
    /// destination is known.
    fn reassemble(
        &self,
        guard: &mut Frame,
        rx: &mut RxState,
    ) -> std::result::Result<Option<(u8, Frame)>, Option<u8>> {
        if guard.is_empty() {
            tracing::warn!("empty segment frame on transport");
            return Err(None);
        }

        let size = guard.buffers()[0].payload();
        if guard.error() != 0 || size < MIN_SEGMENT || size % 8 != 0 {
            tracing::warn!(error = guard.error(), size, "dropping malformed segment");
            return Err(None);
        }

        let (header, trailer) = {
            let data = guard.buffers()[0].payload_bytes();
            let header = SegmentHeader::parse(data).map_err(|err| {
                tracing::warn!(%err, "dropping segment with bad header");
                None::<u8>
            })?;
            let trailer = SegmentTrailer::parse(&data[..size]).map_err(|err| {
                tracing::warn!(%err, dest = header.dest, "dropping segment with bad trailer");
                Some(header.dest)
            })?;
            (header, trailer)
        };
        let dest = header.dest;
        let slot = usize::from(dest);

        let crc_err = if header.crc_enabled {
            let data = guard.buffers()[0].payload_bytes();
            let crc = rx.crcs[slot].compute(&data[..size - 4]);
            crc != trailer.crc
        } else {
            false
        };

        if crc_err || rx.sofs[slot] != header.sof || header.index != rx.counts[slot] {
            tracing::warn!(
                dest,
                crc_err,
                got_sof = header.sof,
                expect_index = rx.counts[slot],
                got_index = header.index,
                "dropping segment, resetting destination"
            );
            return Err(Some(dest));
        }

        // Strip trailer padding, then header and trailer reservations.
        let mut buffers = guard.take_buffers();
        let mut buffer = buffers.remove(0);
        let strip = |buffer: &mut framelink_stream::Buffer| -> Result<()> {
            buffer.adjust_payload(i64::from(trailer.last) - 16)?;
            buffer.adjust_header(HEADER_SIZE as i64)?;
            buffer.adjust_tail(TRAILER_SIZE as i64)?;
            Ok(())
        };
        if let Err(err) = strip(&mut buffer) {
            tracing::warn!(%err, dest, "segment window arithmetic failed");
            return Err(Some(dest));
        }

        if header.sof {
            let mut fresh = Frame::new();
            fresh.set_flags(u16::from(header.first_user));
            fresh.set_channel(dest);
            rx.frames[slot] = Some(fresh);
            rx.sofs[slot] = false;
        }

        let Some(partial) = rx.frames[slot].as_mut() else {
            return Err(Some(dest));
        };
        partial.append_buffer(buffer);

        if trailer.eof {
            let mut done = rx.frames[slot].take().unwrap_or_default();
            done.set_flags(u16::from(header.first_user) | (u16::from(trailer.last_user) << 8));
            rx.reset(dest);
            Ok(Some((dest, done)))
        } else {
            rx.counts[slot] = rx.counts[slot].wrapping_add(1);
            Ok(None)
        }
    }

    /// Segment an application frame addressed to `dest` onto the transmit
    /// queue.
    pub fn application_tx(&self, frame: &SharedFrame, dest: u8) -> Result<()> {
        let mut guard = frame.lock();
        if guard.is_empty() {
            tracing::warn!("empty application frame");
            return Ok(());
        }
        if guard.error() != 0 {
            return Ok(());
        }

        let deadline = Instant::now() + self.config.timeout;
        let first_user = guard.first_user();
        let last_user = guard.last_user();
        let buffers = guard.take_buffers();
        drop(guard);

        let mut tx = self.tx.lock();
        let id = tx.index;
        tx.index = tx.index.wrapping_add(1);
        tx.crc.reset();

        let count = buffers.len();
        for (segment, mut buffer) in buffers.into_iter().enumerate() {
            let payload = buffer.payload();
            let last = last_word_bytes(payload);

            // Pad to the 8-byte boundary, then fold the header and trailer
            // reservations into the payload window.
            buffer.adjust_payload(i64::from(8 - last))?;
            buffer.adjust_header(-(HEADER_SIZE as i64))?;
            buffer.adjust_tail(-(TRAILER_SIZE as i64))?;
            buffer.adjust_payload(TRAILER_SIZE as i64)?;

            let size = buffer.payload();
            let eof = segment + 1 == count;
            {
                let data = buffer.payload_bytes_mut();
                SegmentHeader {
                    first_user,
                    dest,
                    id,
                    index: segment as u16,
                    sof: segment == 0,
                    crc_enabled: self.config.enable_crc,
                }
                .encode(data)
                .map_err(|_| StreamError::Boundary { requested: HEADER_SIZE, limit: data.len() })?;
                SegmentTrailer { last_user, eof, last, crc: 0 }
                    .encode(data)
                    .map_err(|_| StreamError::Boundary { requested: TRAILER_SIZE, limit: data.len() })?;
                if self.config.enable_crc {
                    let crc = tx.crc.compute(&data[..size - 4]);
                    data[size - 4..].copy_from_slice(&crc.to_le_bytes());
                }
            }

            let mut segment_frame = Frame::new();
            segment_frame.append_buffer(buffer);
            self.tx_queue.push_back(segment_frame.into_shared(), deadline)?;
        }

        self.tx_frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Build an application frame backed by transport buffers, each with
    /// segment header and trailer space reserved.
    pub fn req_app_frame(&self, size: usize, zero_copy: bool) -> Result<SharedFrame> {
        let mut out = Frame::new();
        while out.available() < size {
            let chunk = self.transport.req_frame(self.config.segment_size, zero_copy)?;
            let mut guard = chunk.lock();
            let buffers = guard.take_buffers();
            drop(guard);

            for mut buffer in buffers {
                buffer.adjust_header(HEADER_SIZE as i64)?;
                buffer.adjust_tail(TRAILER_SIZE as i64)?;
                let window = buffer.size();
                if window == 0 {
                    return Err(StreamError::Allocation { requested: size });
                }
                // Cap the per-segment payload at the configured budget.
                if window > self.config.segment_size {
                    buffer.adjust_tail((window - self.config.segment_size) as i64)?;
                }
                out.append_buffer(buffer);
                if out.available() >= size {
                    break;
                }
            }
        }
        Ok(out.into_shared())
    }
}

impl Drop for Packetizer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Application-side port: frames accepted here are segmented toward the
/// transport; allocation requests return transport buffers with segment
/// overhead reserved.
pub struct ApplicationPort {
    ctrl: Weak<Packetizer>,
    dest: u8,
}

impl StreamSlave for ApplicationPort {
    fn accept_frame(&self, frame: SharedFrame) {
        if let Some(ctrl) = self.ctrl.upgrade() {
            if let Err(err) = ctrl.application_tx(&frame, self.dest) {
                tracing::warn!(%err, dest = self.dest, "application frame dropped");
            }
        }
    }

    fn accept_req(&self, size: usize, zero_copy: bool) -> Result<SharedFrame> {
        let ctrl = self.ctrl.upgrade().ok_or(StreamError::NoSlave)?;
        ctrl.req_app_frame(size, zero_copy)
    }
}

/// Transport-side port: wire segments are reassembled per destination.
pub struct TransportPort {
    ctrl: Weak<Packetizer>,
}

impl StreamSlave for TransportPort {
    fn accept_frame(&self, frame: SharedFrame) {
        if let Some(ctrl) = self.ctrl.upgrade() {
            ctrl.transport_rx(&frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelink_stream::HeapPool;
    use parking_lot::Mutex as PlMutex;

    /// Slave recording every delivered frame.
    #[derive(Default)]
    struct Sink {
        frames: PlMutex<Vec<SharedFrame>>,
    }

    impl StreamSlave for Sink {
        fn accept_frame(&self, frame: SharedFrame) {
            self.frames.lock().push(frame);
        }
    }

    fn send_app_frame(pack: &Arc<Packetizer>, dest: u8, payload: &[u8], flags: u16) {
        let shared = pack.req_app_frame(payload.len(), false).unwrap();
        {
            let mut guard = shared.lock();
            guard.write_cursor().write_all(payload).unwrap();
            guard.set_payload(payload.len(), false).unwrap();
            guard.set_flags(flags);
        }
        pack.application_tx(&shared, dest).unwrap();
    }

    fn drain_segments(pack: &Arc<Packetizer>) -> Vec<SharedFrame> {
        let mut segments = Vec::new();
        while let Some(segment) = pack.tx_queue.try_pop_front() {
            segments.push(segment);
        }
        segments
    }

    fn pair(segment_size: usize) -> (Arc<Packetizer>, Arc<Packetizer>, Arc<Sink>) {
        let tx = Packetizer::new(PacketizerConfig {
            segment_size,
            ..PacketizerConfig::default()
        });
        tx.attach_transport(HeapPool::new(segment_size + 64, 32));

        let rx = Packetizer::new(PacketizerConfig::default());
        rx.attach_transport(HeapPool::new(segment_size + 64, 32));
        let sink = Arc::new(Sink::default());
        rx.set_application(7, sink.clone());
        (tx, rx, sink)
    }

    #[test]
    fn three_segment_round_trip() {
        // 24 bytes through an 8-byte-per-segment pipe: three segments.
        let (tx, rx, sink) = pair(8);
        let payload: Vec<u8> = (0u8..24).collect();
        send_app_frame(&tx, 7, &payload, 0xCDAB);

        let segments = drain_segments(&tx);
        assert_eq!(segments.len(), 3);
        for segment in &segments {
            rx.transport_rx(segment);
        }

        let frames = sink.frames.lock();
        assert_eq!(frames.len(), 1);
        let done = frames[0].lock();
        assert_eq!(done.payload(), 24);
        assert_eq!(done.channel(), 7);
        assert_eq!(done.first_user(), 0xAB);
        assert_eq!(done.last_user(), 0xCD);
        let bytes: Vec<u8> = done.read_cursor().collect();
        assert_eq!(bytes, payload);
        assert_eq!(rx.drop_count(), 0);
    }

    #[test]
    fn unaligned_payload_is_padded_and_recovered() {
        let (tx, rx, sink) = pair(8);
        let payload: Vec<u8> = (0u8..13).collect();
        send_app_frame(&tx, 7, &payload, 0);

        for segment in drain_segments(&tx) {
            rx.transport_rx(&segment);
        }

        let frames = sink.frames.lock();
        assert_eq!(frames.len(), 1);
        let bytes: Vec<u8> = frames[0].lock().read_cursor().collect();
        assert_eq!(bytes, payload);
    }

    #[test]
    fn mid_frame_loss_resets_destination() {
        let (tx, rx, sink) = pair(8);
        send_app_frame(&tx, 7, &(0u8..24).collect::<Vec<_>>(), 0);

        let segments = drain_segments(&tx);
        assert_eq!(segments.len(), 3);

        // Deliver 0 and 2; the gap must drop segment 2 and reset state.
        rx.transport_rx(&segments[0]);
        rx.transport_rx(&segments[2]);
        assert_eq!(rx.drop_count(), 1);
        assert!(sink.frames.lock().is_empty());

        // A fresh frame reassembles cleanly afterwards.
        send_app_frame(&tx, 7, &(100u8..116).collect::<Vec<_>>(), 0);
        for segment in drain_segments(&tx) {
            rx.transport_rx(&segment);
        }
        assert_eq!(sink.frames.lock().len(), 1);
        assert_eq!(rx.drop_count(), 1);
    }

    #[test]
    fn corrupted_segment_fails_crc() {
        let (tx, rx, sink) = pair(8);
        send_app_frame(&tx, 7, &(0u8..16).collect::<Vec<_>>(), 0);

        let segments = drain_segments(&tx);
        {
            let mut guard = segments[0].lock();
            guard.buffer_mut(0).unwrap().payload_bytes_mut()[10] ^= 0x40;
        }
        for segment in &segments {
            rx.transport_rx(segment);
        }

        assert!(sink.frames.lock().is_empty());
        assert!(rx.drop_count() >= 1);
    }

    #[test]
    fn undersize_and_misaligned_segments_drop() {
        let (_tx, rx, _sink) = pair(8);

        let mut small = Frame::new();
        let mut buffer = framelink_stream::Buffer::heap(16);
        buffer.set_payload_full();
        small.append_buffer(buffer);
        rx.transport_rx(&small.into_shared());
        assert_eq!(rx.drop_count(), 1);

        let mut skew = Frame::new();
        let mut buffer = framelink_stream::Buffer::heap(27);
        buffer.set_payload_full();
        skew.append_buffer(buffer);
        rx.transport_rx(&skew.into_shared());
        assert_eq!(rx.drop_count(), 2);
    }

    #[test]
    fn interleaved_destinations_reassemble_independently() {
        let segment_size = 8;
        let tx_a = Packetizer::new(PacketizerConfig { segment_size, ..Default::default() });
        tx_a.attach_transport(HeapPool::new(64, 32));

        let rx = Packetizer::new(PacketizerConfig::default());
        rx.attach_transport(HeapPool::new(64, 32));
        let sink_a = Arc::new(Sink::default());
        let sink_b = Arc::new(Sink::default());
        rx.set_application(1, sink_a.clone());
        rx.set_application(2, sink_b.clone());

        send_app_frame(&tx_a, 1, &[0x11; 16], 0);
        let first = drain_segments(&tx_a);
        send_app_frame(&tx_a, 2, &[0x22; 16], 0);
        let second = drain_segments(&tx_a);

        // Interleave the two destinations segment by segment.
        for (a, b) in first.iter().zip(second.iter()) {
            rx.transport_rx(a);
            rx.transport_rx(b);
        }

        assert_eq!(rx.drop_count(), 0);
        assert_eq!(sink_a.frames.lock().len(), 1);
        assert_eq!(sink_b.frames.lock().len(), 1);
        assert_eq!(sink_a.frames.lock()[0].lock().channel(), 1);
        assert_eq!(sink_b.frames.lock()[0].lock().channel(), 2);
    }
}
