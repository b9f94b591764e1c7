//! Register access end to end: memory master, SRP bridge, packetizer pair,
//! firmware register server.

use std::sync::Arc;
use std::time::Duration;

use framelink_harness::RegisterServer;
use framelink_memory::{MemoryError, MemoryMaster};
use framelink_packetizer::{Packetizer, PacketizerConfig};
use framelink_srp::SrpV3;

/// SRP master wired to a register server through two packetizers.
fn build() -> (Arc<SrpV3>, MemoryMaster, Arc<RegisterServer>, Arc<Packetizer>, Arc<Packetizer>) {
    let near = Packetizer::new(PacketizerConfig {
        segment_size: 256,
        ..PacketizerConfig::default()
    });
    let far = Packetizer::new(PacketizerConfig {
        segment_size: 256,
        ..PacketizerConfig::default()
    });

    let to_far = framelink_harness::Pipe::new(512);
    near.attach_transport(to_far.clone());
    to_far.attach(far.transport_port());

    let to_near = framelink_harness::Pipe::new(512);
    far.attach_transport(to_near.clone());
    to_near.attach(near.transport_port());

    let srp = SrpV3::new();
    srp.attach_downstream(near.application(0));
    near.set_application(0, srp.stream_port());

    let server = RegisterServer::new();
    far.set_application(0, server.clone());
    server.attach(far.application(0));

    near.start();
    far.start();

    let master = MemoryMaster::new(srp.clone());
    master.set_timeout(Duration::from_secs(2));
    (srp, master, server, near, far)
}

#[test]
fn write_then_read_round_trip() {
    let (_srp, master, server, near, far) = build();

    let pattern: Vec<u8> = (0u8..64).collect();
    master.write(0x0000_2000, &pattern).unwrap();
    assert_eq!(server.peek(0x2000, 64), pattern);

    let mut out = vec![0u8; 64];
    master.read(0x0000_2000, &mut out).unwrap();
    assert_eq!(out, pattern);

    assert_eq!(near.drop_count(), 0);
    assert_eq!(far.drop_count(), 0);
    near.stop();
    far.stop();
}

#[test]
fn preloaded_registers_read_back() {
    let (_srp, master, server, near, far) = build();

    server.poke(0x1000, &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);

    let mut out = [0u8; 8];
    master.read(0x1000, &mut out).unwrap();
    assert_eq!(out, [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
    assert_eq!(master.error(), 0);

    near.stop();
    far.stop();
}

#[test]
fn verify_matches_written_data() {
    let (_srp, master, _server, near, far) = build();

    master.write(0x3000, &[0xA5; 16]).unwrap();
    master.verify(0x3000, &[0xA5; 16]).unwrap();
    assert_eq!(master.verify(0x3000, &[0x5A; 16]).unwrap_err(), MemoryError::Verify);

    near.stop();
    far.stop();
}

#[test]
fn posted_writes_land_without_response() {
    let (_srp, master, server, near, far) = build();

    master.post(0x4000, &[0x77; 8]).unwrap();

    // The write travels asynchronously; poll the server's memory.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while server.peek(0x4000, 8) != vec![0x77; 8] && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(server.peek(0x4000, 8), vec![0x77; 8]);

    near.stop();
    far.stop();
}

#[test]
fn large_transactions_span_segments() {
    let (_srp, master, _server, near, far) = build();

    // 4096-byte transfer through 256-byte segments.
    let pattern: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    master.write(0x8000, &pattern).unwrap();

    let mut out = vec![0u8; 4096];
    master.read(0x8000, &mut out).unwrap();
    assert_eq!(out, pattern);
    assert_eq!(near.drop_count(), 0);
    assert_eq!(far.drop_count(), 0);

    near.stop();
    far.stop();
}
