//! Feed arbitrary segments into a packetizer receiver: the per-destination
//! state machine must drop garbage without panicking and without wedging
//! subsequent reassembly.

#![no_main]

use arbitrary::Arbitrary;
use framelink_packetizer::{Packetizer, PacketizerConfig};
use framelink_stream::{Buffer, Frame};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
struct Input {
    segments: Vec<Vec<u8>>,
}

fuzz_target!(|input: Input| {
    let pack = Packetizer::new(PacketizerConfig::default());

    for bytes in input.segments.iter().take(64) {
        let mut buffer = Buffer::heap(bytes.len().max(1));
        if !bytes.is_empty() {
            let _ = buffer.set_payload(bytes.len());
            buffer.payload_bytes_mut().copy_from_slice(bytes);
        }
        let mut frame = Frame::new();
        frame.append_buffer(buffer);
        pack.transport_rx(&frame.into_shared());
    }
});
