//! SRP v3 bridge.
//!
//! Marshals memory transactions into framed wire requests and decodes the
//! firmware's responses back onto the issuing transactions. The bridge is
//! a memory slave on one side and a stream endpoint on the other: register
//! masters post transactions into [`SrpV3::do_transaction`], request
//! frames flow out through the attached downstream slave (packetizer
//! application port, RSSI port or raw transport), and response frames come
//! back through the bridge's stream-slave side.
//!
//! Every non-posted transaction is tracked by weak reference until its
//! response arrives or its deadline passes; responses for unknown or
//! expired ids are dropped. A response either completes the transaction
//! with success and valid bytes, or with the error mapped from the SRP
//! tail word. Mismatched responses are dropped so the transaction times
//! out rather than completing with garbage.

use std::sync::{Arc, Weak};

use framelink_memory::{AccessKind, InflightTable, MemorySlave, Transaction, code};
use framelink_proto::srp::{
    HEADER_SIZE, RESPONSE_MASK, SrpHeader, SrpKind, TAIL_SIZE, TailStatus, tail_status,
};
use framelink_stream::{Master, Result, SharedFrame, StreamError, StreamSlave};

/// Alignment required of every SRP access, in bytes.
pub const MIN_ACCESS: u32 = 4;

/// Largest SRP transaction, in bytes.
pub const MAX_ACCESS: u32 = 4096;

fn srp_kind(kind: AccessKind) -> SrpKind {
    match kind {
        AccessKind::Read => SrpKind::Read,
        AccessKind::Write => SrpKind::Write,
        AccessKind::Post => SrpKind::Post,
        AccessKind::Verify => SrpKind::Verify,
    }
}

/// SRP v3 protocol bridge.
pub struct SrpV3 {
    inflight: InflightTable,
    downstream: Master,
    this: Weak<SrpV3>,
}

impl SrpV3 {
    /// Create a bridge; attach a downstream slave before issuing.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            inflight: InflightTable::new(),
            downstream: Master::new(),
            this: this.clone(),
        })
    }

    /// Attach the stream slave requests are sent to and buffers are
    /// requested from.
    pub fn attach_downstream(&self, slave: Arc<dyn StreamSlave>) {
        self.downstream.add_slave(slave);
    }

    /// Stream-slave handle for wiring response traffic into the bridge.
    pub fn stream_port(&self) -> Arc<ResponsePort> {
        Arc::new(ResponsePort { bridge: self.this.clone() })
    }

    fn send_request(&self, transaction: &Arc<Transaction>) -> Result<()> {
        let header = SrpHeader {
            kind: srp_kind(transaction.kind()),
            id: transaction.id(),
            address: transaction.address(),
            size: transaction.size(),
        };

        let frame = self.downstream.req_frame(header.request_len(), true)?;
        {
            let mut guard = frame.lock();
            let mut wire = [0u8; HEADER_SIZE];
            header
                .encode(&mut wire)
                .map_err(|_| StreamError::Boundary { requested: HEADER_SIZE, limit: 0 })?;

            let mut cursor = guard.write_cursor();
            cursor.write_all(&wire)?;
            if header.kind.carries_payload() {
                cursor.write_all(&transaction.data())?;
            }
            guard.set_payload(header.request_len(), false)?;
        }

        tracing::debug!(
            id = transaction.id(),
            address = transaction.address(),
            size = transaction.size(),
            kind = ?transaction.kind(),
            "send request"
        );
        self.downstream.send_frame(&frame);
        Ok(())
    }

    /// Decode one response frame.
    fn response_rx(&self, frame: &SharedFrame) {
        let guard = frame.lock();
        let frame_len = guard.payload();
        if frame_len < HEADER_SIZE + TAIL_SIZE {
            tracing::info!(frame_len, "undersize response dropped");
            return;
        }

        let mut words = [0u32; 5];
        let mut cursor = guard.read_cursor();
        for word in &mut words {
            let Ok(value) = cursor.read_u32() else { return };
            *word = value;
        }
        let id = words[1];

        let Some(transaction) = self.inflight.get(id) else {
            tracing::debug!(id, "response for unknown id dropped");
            return;
        };
        if transaction.expired() {
            tracing::debug!(id, "response for expired transaction dropped");
            self.inflight.remove(id);
            return;
        }

        let expected = SrpHeader {
            kind: srp_kind(transaction.kind()),
            id,
            address: transaction.address(),
            size: transaction.size(),
        };

        if frame_len != expected.response_len() || words[4].wrapping_add(1) != transaction.size() {
            tracing::warn!(
                id,
                frame_len,
                expect = expected.response_len(),
                "response size mismatch, dropped"
            );
            self.inflight.remove(id);
            return;
        }

        if (words[0] & RESPONSE_MASK) != expected.word0()
            || words[2] != (expected.address & 0xFFFF_FFFF) as u32
            || words[3] != (expected.address >> 32) as u32
        {
            tracing::warn!(id, "response header mismatch, dropped");
            return;
        }

        let mut tail_cursor = guard.read_cursor();
        if tail_cursor.advance(frame_len - TAIL_SIZE).is_err() {
            return;
        }
        let Ok(tail) = tail_cursor.read_u32() else { return };

        self.inflight.remove(id);
        match tail_status(tail) {
            TailStatus::AxiFail(bus) => {
                tracing::warn!(id, bus, "axi failure");
                transaction.done(code::AXI_FAIL | u32::from(bus));
            },
            TailStatus::AxiTimeout => {
                tracing::warn!(id, "axi timeout");
                transaction.done(code::AXI_TIMEOUT);
            },
            TailStatus::Other(raw) => {
                tracing::warn!(id, raw, "response tail error");
                transaction.done(raw);
            },
            TailStatus::Ok => {
                if !expected.kind.carries_payload() {
                    let mut data_cursor = guard.read_cursor();
                    if data_cursor.advance(HEADER_SIZE).is_err() {
                        return;
                    }
                    if data_cursor.read_exact(&mut transaction.data()).is_err() {
                        transaction.done(code::PROTOCOL);
                        return;
                    }
                }
                transaction.done(code::OK);
            },
        }
    }
}

impl MemorySlave for SrpV3 {
    fn min_access(&self) -> u32 {
        MIN_ACCESS
    }

    fn max_access(&self) -> u32 {
        MAX_ACCESS
    }

    fn do_transaction(&self, transaction: &Arc<Transaction>) {
        if transaction.address() % u64::from(MIN_ACCESS) != 0 {
            transaction.done(code::ADDRESS);
            return;
        }
        let size = transaction.size();
        if size % MIN_ACCESS != 0 || size < MIN_ACCESS || size > MAX_ACCESS {
            transaction.done(code::SIZE);
            return;
        }

        // Posted writes complete as soon as they are on the wire; all
        // others wait for the response.
        if transaction.kind() != AccessKind::Post {
            self.inflight.add(transaction);
        }

        if let Err(err) = self.send_request(transaction) {
            tracing::warn!(id = transaction.id(), %err, "request not sent");
            self.inflight.remove(transaction.id());
            transaction.done(code::PROTOCOL);
            return;
        }

        if transaction.kind() == AccessKind::Post {
            transaction.done(code::OK);
        }
    }
}

/// Stream-slave side of the bridge, receiving response frames.
pub struct ResponsePort {
    bridge: Weak<SrpV3>,
}

impl StreamSlave for ResponsePort {
    fn accept_frame(&self, frame: SharedFrame) {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.response_rx(&frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelink_memory::{MemoryError, MemoryMaster};
    use framelink_stream::{Buffer, Frame, HeapPool, Pool};
    use parking_lot::Mutex as PlMutex;
    use std::time::Duration;

    /// Downstream stub: records requests, serves buffers.
    struct StubDownstream {
        pool: Arc<HeapPool>,
        sent: PlMutex<Vec<SharedFrame>>,
    }

    impl StubDownstream {
        fn new() -> Arc<Self> {
            Arc::new(Self { pool: HeapPool::new(8192, 8), sent: PlMutex::new(Vec::new()) })
        }

        fn last_request_bytes(&self) -> Vec<u8> {
            let sent = self.sent.lock();
            let guard = sent.last().expect("request captured").lock();
            guard.read_cursor().collect()
        }
    }

    impl StreamSlave for StubDownstream {
        fn accept_frame(&self, frame: SharedFrame) {
            self.sent.lock().push(frame);
        }

        fn accept_req(&self, size: usize, zero_copy: bool) -> Result<SharedFrame> {
            Ok(self.pool.req_frame(size, zero_copy)?.into_shared())
        }
    }

    fn bridge() -> (Arc<SrpV3>, Arc<StubDownstream>, MemoryMaster) {
        let srp = SrpV3::new();
        let stub = StubDownstream::new();
        srp.attach_downstream(stub.clone());
        let master = MemoryMaster::new(srp.clone());
        master.set_timeout(Duration::from_millis(200));
        (srp, stub, master)
    }

    fn response_frame(bytes: &[u8]) -> SharedFrame {
        let mut buffer = Buffer::heap(bytes.len());
        buffer.set_payload_full();
        buffer.payload_bytes_mut().copy_from_slice(bytes);
        let mut frame = Frame::new();
        frame.append_buffer(buffer);
        frame.into_shared()
    }

    /// Build a well-formed response for the captured request.
    fn respond(request: &[u8], data: &[u8], tail: u32) -> SharedFrame {
        let mut bytes = request[..HEADER_SIZE].to_vec();
        bytes.extend_from_slice(data);
        bytes.extend_from_slice(&tail.to_le_bytes());
        response_frame(&bytes)
    }

    #[test]
    fn read_request_wire_format_and_completion() {
        let (srp, stub, master) = bridge();

        // Issue without blocking so the response can be injected.
        let id = master.req_transaction(0x0000_1000, vec![0u8; 8], AccessKind::Read);
        let request = stub.last_request_bytes();
        assert_eq!(request.len(), 20);
        assert_eq!(u32::from_le_bytes(request[0..4].try_into().unwrap()), 0x0A00_0003);
        assert_eq!(u32::from_le_bytes(request[4..8].try_into().unwrap()), id);
        assert_eq!(u32::from_le_bytes(request[8..12].try_into().unwrap()), 0x0000_1000);
        assert_eq!(u32::from_le_bytes(request[12..16].try_into().unwrap()), 0);
        assert_eq!(u32::from_le_bytes(request[16..20].try_into().unwrap()), 7);

        let payload = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
        srp.response_rx(&respond(&request, &payload, 0));

        let transaction = master.transaction(id).unwrap();
        assert_eq!(master.wait_transaction(id), 0);
        assert_eq!(&*transaction.data(), &payload);
    }

    #[test]
    fn write_with_axi_failure() {
        let (srp, stub, master) = bridge();

        let id = master.req_transaction(0, vec![0xAB; 4], AccessKind::Write);
        let request = stub.last_request_bytes();
        assert_eq!(request.len(), 24);
        assert_eq!(&request[20..24], &[0xAB; 4]);

        srp.response_rx(&respond(&request, &[], 0x0000_0001));
        assert_eq!(master.wait_transaction(id), code::AXI_FAIL | 1);
    }

    #[test]
    fn post_completes_without_response() {
        let (_srp, stub, master) = bridge();
        master.post(0x100, &[0u8; 4]).unwrap();
        assert_eq!(stub.sent.lock().len(), 1);
    }

    #[test]
    fn alignment_and_size_validation() {
        let (srp, stub, master) = bridge();

        assert_eq!(master.write(0x3, &[0u8; 4]).unwrap_err(), MemoryError::Address);
        assert_eq!(master.write(0, &[0u8; 5]).unwrap_err(), MemoryError::Size);
        assert_eq!(master.write(0, &[0u8; 4096 + 4]).unwrap_err(), MemoryError::Size);

        // Size boundaries: min and max are both legal.
        master.req_transaction(0, vec![0u8; 4], AccessKind::Read);
        master.req_transaction(0, vec![0u8; 4096], AccessKind::Read);
        let requests: Vec<Vec<u8>> = {
            let sent = stub.sent.lock();
            sent.iter().map(|frame| frame.lock().read_cursor().collect()).collect()
        };
        assert_eq!(requests.len(), 2);

        for request in &requests {
            let size = u32::from_le_bytes(request[16..20].try_into().unwrap()) as usize + 1;
            srp.response_rx(&respond(request, &vec![0u8; size], 0));
        }
        assert_eq!(master.wait_transaction(0), 0);
    }

    #[test]
    fn unknown_id_response_is_dropped() {
        let (srp, stub, master) = bridge();

        let id = master.req_transaction(0, vec![0u8; 4], AccessKind::Read);
        let mut request = stub.last_request_bytes();
        // Corrupt the id.
        request[4] ^= 0xFF;
        srp.response_rx(&respond(&request, &[0u8; 4], 0));

        // Original transaction still pending; it times out.
        assert_eq!(master.wait_transaction(id), code::TIMEOUT);
    }

    #[test]
    fn size_mismatch_drops_response() {
        let (srp, stub, master) = bridge();

        let id = master.req_transaction(0, vec![0u8; 8], AccessKind::Read);
        let request = stub.last_request_bytes();

        // Response claims only 4 bytes of data.
        srp.response_rx(&respond(&request, &[0u8; 4], 0));
        assert_eq!(master.wait_transaction(id), code::TIMEOUT);
    }
}
