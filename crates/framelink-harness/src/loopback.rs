//! In-process wires and far-end stand-ins.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use framelink_proto::rssi::{self, Segment, encode_plain, encode_syn, flag};
use framelink_proto::srp::{HEADER_SIZE as SRP_HEADER, SrpHeader, SrpKind};
use framelink_stream::{
    Buffer, Frame, HeapPool, Master, Pool, Result, SharedFrame, StreamSlave,
};

/// Direct in-process wire with its own buffer pool.
///
/// Frames accepted on one side are fanned out to the attached slaves on
/// the other; allocation requests are served locally so either side can
/// act as a transport.
pub struct Pipe {
    pool: Arc<HeapPool>,
    master: Master,
}

impl Pipe {
    /// Wire with `buffer_size`-byte pool buffers.
    pub fn new(buffer_size: usize) -> Arc<Self> {
        Arc::new(Self { pool: HeapPool::new(buffer_size, 64), master: Master::new() })
    }

    /// Attach the receiving side.
    pub fn attach(&self, slave: Arc<dyn StreamSlave>) {
        self.master.add_slave(slave);
    }
}

impl StreamSlave for Pipe {
    fn accept_frame(&self, frame: SharedFrame) {
        self.master.send_frame(&frame);
    }

    fn accept_req(&self, size: usize, zero_copy: bool) -> Result<SharedFrame> {
        Ok(self.pool.req_frame(size, zero_copy)?.into_shared())
    }
}

/// Wire that silently discards selected frames (by arrival index).
pub struct LossyPipe {
    inner: Arc<Pipe>,
    drops: HashSet<usize>,
    seen: AtomicUsize,
}

impl LossyPipe {
    /// Wire dropping the frames whose zero-based arrival index appears in
    /// `drops`.
    pub fn new(buffer_size: usize, drops: &[usize]) -> Arc<Self> {
        Arc::new(Self {
            inner: Pipe::new(buffer_size),
            drops: drops.iter().copied().collect(),
            seen: AtomicUsize::new(0),
        })
    }

    /// Attach the receiving side.
    pub fn attach(&self, slave: Arc<dyn StreamSlave>) {
        self.inner.attach(slave);
    }

    /// Frames observed so far, dropped or not.
    pub fn seen(&self) -> usize {
        self.seen.load(Ordering::Relaxed)
    }
}

impl StreamSlave for LossyPipe {
    fn accept_frame(&self, frame: SharedFrame) {
        let index = self.seen.fetch_add(1, Ordering::Relaxed);
        if self.drops.contains(&index) {
            tracing::debug!(index, "lossy pipe dropped frame");
            return;
        }
        self.inner.accept_frame(frame);
    }

    fn accept_req(&self, size: usize, zero_copy: bool) -> Result<SharedFrame> {
        self.inner.accept_req(size, zero_copy)
    }
}

struct PeerState {
    seq: u8,
    rem_seq: u8,
    open: bool,
}

/// Minimal far-end RSSI responder.
///
/// Plays the firmware's role against the client controller: answers SYN
/// with SYN+ACK, acknowledges every in-sequence segment immediately,
/// delivers payload upstream and can originate its own payload segments.
/// No retransmission of its own; the tests drive loss on the client side.
pub struct RssiPeer {
    state: Mutex<PeerState>,
    wire: Master,
    app: Master,
    pool: Arc<HeapPool>,
}

impl RssiPeer {
    /// Peer with its first sequence number at 200.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PeerState { seq: 200, rem_seq: 0, open: false }),
            wire: Master::new(),
            app: Master::new(),
            pool: HeapPool::new(2048, 64),
        })
    }

    /// Attach the wire back toward the client.
    pub fn attach_wire(&self, slave: Arc<dyn StreamSlave>) {
        self.wire.add_slave(slave);
    }

    /// Attach the payload sink.
    pub fn attach_application(&self, slave: Arc<dyn StreamSlave>) {
        self.app.add_slave(slave);
    }

    /// True once the client's closing ACK has been seen.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Originate one payload segment toward the client.
    pub fn send_payload(&self, payload: &[u8]) {
        let (seq, ack) = {
            let mut state = self.state.lock();
            state.seq = state.seq.wrapping_add(1);
            (state.seq, state.rem_seq)
        };

        let mut bytes = vec![0u8; rssi::HEADER_SIZE + payload.len()];
        if encode_plain(flag::ACK, seq, ack, &mut bytes).is_err() {
            return;
        }
        bytes[rssi::HEADER_SIZE..].copy_from_slice(payload);
        self.wire.send_frame(&wire_frame(&bytes));
    }

    fn ack(&self, seq: u8, ack: u8) {
        let mut bytes = [0u8; rssi::HEADER_SIZE];
        if encode_plain(flag::ACK, seq, ack, &mut bytes).is_ok() {
            self.wire.send_frame(&wire_frame(&bytes));
        }
    }
}

impl StreamSlave for RssiPeer {
    fn accept_frame(&self, frame: SharedFrame) {
        let (segment, payload) = {
            let guard = frame.lock();
            if guard.is_empty() {
                return;
            }
            let Ok(segment) = Segment::parse(guard.buffers()[0].payload_bytes()) else {
                return;
            };
            let mut payload = Vec::new();
            if guard.payload() > segment.header_len() {
                payload = guard.read_cursor().skip(segment.header_len()).collect();
            }
            (segment, payload)
        };

        if let Some(params) = &segment.syn {
            // Client connection request: adopt its sequence, echo the
            // parameters back with our own sequence number.
            let mut state = self.state.lock();
            state.rem_seq = segment.sequence;
            state.open = false;
            let mut bytes = [0u8; rssi::SYN_SIZE];
            if encode_syn(flag::ACK, state.seq, segment.sequence, params, &mut bytes).is_ok() {
                drop(state);
                self.wire.send_frame(&wire_frame(&bytes));
            }
            return;
        }

        if segment.is_rst() {
            self.state.lock().open = false;
            return;
        }

        let (reply, deliver) = {
            let mut state = self.state.lock();
            if segment.is_ack() && segment.acknowledge == state.seq {
                state.open = true;
            }

            if segment.is_nul() || !payload.is_empty() {
                if segment.sequence == state.rem_seq.wrapping_add(1) {
                    state.rem_seq = segment.sequence;
                    (Some((state.seq, state.rem_seq)), !payload.is_empty())
                } else {
                    // Duplicate (a retransmission we already have): re-ack
                    // so the client stops resending.
                    (Some((state.seq, state.rem_seq)), false)
                }
            } else {
                (None, false)
            }
        };

        if let Some((seq, ack)) = reply {
            self.ack(seq, ack);
        }
        if deliver {
            self.app.send_frame(&payload_frame(&payload));
        }
    }

    fn accept_req(&self, size: usize, zero_copy: bool) -> Result<SharedFrame> {
        Ok(self.pool.req_frame(size, zero_copy)?.into_shared())
    }
}

/// Firmware-side SRP v3 responder over a byte-addressed memory map.
pub struct RegisterServer {
    memory: Mutex<HashMap<u64, u8>>,
    out: Master,
    pool: Arc<HeapPool>,
}

impl RegisterServer {
    /// Empty register space.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            memory: Mutex::new(HashMap::new()),
            out: Master::new(),
            pool: HeapPool::new(8192, 16),
        })
    }

    /// Attach the wire responses are sent back on.
    pub fn attach(&self, slave: Arc<dyn StreamSlave>) {
        self.out.add_slave(slave);
    }

    /// Preload memory at `address`.
    pub fn poke(&self, address: u64, bytes: &[u8]) {
        let mut memory = self.memory.lock();
        for (offset, &byte) in bytes.iter().enumerate() {
            memory.insert(address + offset as u64, byte);
        }
    }

    /// Observe memory at `address`.
    pub fn peek(&self, address: u64, len: usize) -> Vec<u8> {
        let memory = self.memory.lock();
        (0..len).map(|offset| *memory.get(&(address + offset as u64)).unwrap_or(&0)).collect()
    }
}

impl StreamSlave for RegisterServer {
    fn accept_frame(&self, frame: SharedFrame) {
        let (header_bytes, request) = {
            let guard = frame.lock();
            let mut header_bytes = [0u8; SRP_HEADER];
            let mut cursor = guard.read_cursor();
            if cursor.read_exact(&mut header_bytes).is_err() {
                return;
            }
            let Ok(request) = SrpHeader::parse(&header_bytes) else { return };

            // Writes carry payload after the header.
            if request.kind.carries_payload() {
                let mut payload = vec![0u8; request.size as usize];
                if cursor.read_exact(&mut payload).is_err() {
                    return;
                }
                self.poke(request.address, &payload);
            }
            (header_bytes, request)
        };

        // Posted writes get no response.
        if request.kind == SrpKind::Post {
            return;
        }

        let mut response = header_bytes.to_vec();
        if !request.kind.carries_payload() {
            response.extend_from_slice(&self.peek(request.address, request.size as usize));
        }
        response.extend_from_slice(&0u32.to_le_bytes());

        // Allocate through the outgoing port when it fronts a pool, so
        // stages below get the header/trailer space they reserved; fall
        // back to a plain heap frame when wired straight to a sink.
        let frame = match self.out.req_frame(response.len(), false) {
            Ok(frame) => {
                let filled = {
                    let mut guard = frame.lock();
                    guard.write_cursor().write_all(&response).is_ok()
                        && guard.set_payload(response.len(), false).is_ok()
                };
                if !filled {
                    return;
                }
                frame
            },
            Err(_) => payload_frame(&response),
        };
        self.out.send_frame(&frame);
    }

    fn accept_req(&self, size: usize, zero_copy: bool) -> Result<SharedFrame> {
        Ok(self.pool.req_frame(size, zero_copy)?.into_shared())
    }
}

fn wire_frame(bytes: &[u8]) -> SharedFrame {
    payload_frame(bytes)
}

fn payload_frame(bytes: &[u8]) -> SharedFrame {
    let mut buffer = Buffer::heap(bytes.len().max(1));
    let mut frame = Frame::new();
    if !bytes.is_empty() {
        buffer.set_payload(bytes.len()).unwrap_or_default();
        buffer.payload_bytes_mut().copy_from_slice(bytes);
    }
    frame.append_buffer(buffer);
    frame.into_shared()
}
