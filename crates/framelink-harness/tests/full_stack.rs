//! The full receive chain in one process: PRBS application traffic through
//! a packetizer, over a reliable RSSI hop, into a peer packetizer and the
//! checker. The same shape as a DAQ stack minus the physical wire.

use std::time::{Duration, Instant};

use framelink_harness::{Prbs, RssiPeer};
use framelink_packetizer::{Packetizer, PacketizerConfig};
use framelink_rssi::{Rssi, RssiConfig};
use framelink_stream::StreamSlave;

fn wait_until(probe: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if probe() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn prbs_over_packetizer_over_rssi() {
    // Near side: packetizer on top of the reliable hop.
    let pack_tx = Packetizer::new(PacketizerConfig {
        segment_size: 192,
        ..PacketizerConfig::default()
    });
    let rssi = Rssi::new(RssiConfig::default());
    pack_tx.attach_transport(rssi.application_port());

    // Far side: the peer stand-in feeds a receiving packetizer.
    let peer = RssiPeer::new();
    rssi.attach_transport(peer.clone());
    peer.attach_wire(rssi.transport_port());

    let pack_rx = Packetizer::new(PacketizerConfig::default());
    peer.attach_application(pack_rx.transport_port());

    let checker = Prbs::new();
    pack_rx.set_application(3, checker.clone());

    rssi.start();
    pack_tx.start();

    assert!(
        wait_until(|| rssi.is_open(), Duration::from_secs(3)),
        "reliable hop did not open"
    );

    let source = Prbs::new();
    let port = pack_tx.application(3);
    let sizes = [16usize, 120, 200, 504, 96, 1000, 8, 344];
    for &size in &sizes {
        let frame = port.accept_req(size, false).unwrap();
        source.fill_frame(&frame, size).unwrap();
        pack_tx.application_tx(&frame, 3).unwrap();
    }

    assert!(
        wait_until(
            || checker.rx_count() as usize == sizes.len(),
            Duration::from_secs(5),
        ),
        "stack delivered {} of {} frames",
        checker.rx_count(),
        sizes.len()
    );

    assert_eq!(checker.rx_error_count(), 0);
    assert_eq!(checker.rx_bytes(), sizes.iter().map(|&s| s as u64).sum::<u64>());
    assert_eq!(pack_rx.drop_count(), 0);
    assert_eq!(rssi.down_count(), 0);
    assert_eq!(rssi.drop_count(), 0);

    pack_tx.stop();
    rssi.stop();
}
