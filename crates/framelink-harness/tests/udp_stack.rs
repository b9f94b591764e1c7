//! RSSI over real UDP sockets on the loopback interface.

use std::sync::Arc;
use std::time::{Duration, Instant};

use framelink_harness::{Prbs, RssiPeer};
use framelink_rssi::{Rssi, RssiConfig};
use framelink_stream::{SharedFrame, StreamSlave};
use framelink_transport::udp::{UdpClient, UdpServer};
use parking_lot::Mutex;

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

#[derive(Default)]
struct Sink {
    frames: Mutex<Vec<SharedFrame>>,
}

impl StreamSlave for Sink {
    fn accept_frame(&self, frame: SharedFrame) {
        self.frames.lock().push(frame);
    }
}

#[test]
fn reliable_hop_over_udp_loopback() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    // Far side: peer stand-in behind a UDP server.
    let server = UdpServer::bind(0, 1500).unwrap();
    let peer = RssiPeer::new();
    let delivered = Arc::new(Sink::default());
    server.attach(peer.clone());
    peer.attach_wire(server.clone());
    peer.attach_application(delivered.clone());
    server.start();
    let port = server.local_port().unwrap();

    // Near side: RSSI client over a UDP client socket.
    let client_udp = UdpClient::connect("127.0.0.1", port, 1500).unwrap();
    let rssi = Rssi::new(RssiConfig::default());
    rssi.attach_transport(client_udp.clone());
    client_udp.attach(rssi.transport_port());
    client_udp.start();
    rssi.start();

    assert!(
        wait_until(|| rssi.is_open() && peer.is_open(), Duration::from_secs(5)),
        "handshake over UDP did not complete"
    );

    let prbs = Prbs::new();
    for _ in 0..12 {
        let frame = rssi.req_app_frame(128, false).unwrap();
        prbs.fill_frame(&frame, 128).unwrap();
        rssi.application_tx(&frame).unwrap();
    }

    assert!(
        wait_until(|| delivered.frames.lock().len() == 12, Duration::from_secs(5)),
        "peer received {} of 12 payloads",
        delivered.frames.lock().len()
    );

    let checker = Prbs::new();
    for frame in delivered.frames.lock().iter() {
        checker.check_frame(frame);
    }
    assert_eq!(checker.rx_error_count(), 0);
    assert_eq!(rssi.down_count(), 0);

    rssi.stop();
    client_udp.stop();
    server.stop();
}
