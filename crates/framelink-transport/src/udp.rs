//! UDP frame transports.
//!
//! One buffer per datagram: outbound frames are sent buffer by buffer,
//! inbound datagrams become single-buffer frames pushed to the attached
//! slaves. Loss and reordering are tolerated here; the RSSI or packetizer
//! layer above supplies reliability. The client connects to a fixed peer;
//! the server binds (port 0 asks the kernel for one) and replies to
//! whichever peer spoke last.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use framelink_stream::{Frame, HeapPool, Master, Pool, Result, SharedFrame, StreamSlave};

use crate::error::TransportError;

/// Default maximum datagram payload in bytes.
pub const DEFAULT_MAX_SIZE: usize = 1500;

const RX_POLL: Duration = Duration::from_millis(10);

fn recv_loop(
    socket: &UdpSocket,
    shutdown: &AtomicBool,
    max_size: usize,
    mut deliver: impl FnMut(&[u8], SocketAddr),
) {
    let mut scratch = vec![0u8; max_size];
    while !shutdown.load(Ordering::Relaxed) {
        match socket.recv_from(&mut scratch) {
            Ok((len, peer)) if len > 0 => deliver(&scratch[..len], peer),
            Ok(_) => {},
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {},
            Err(err) => {
                tracing::warn!(%err, "udp receive failed");
                return;
            },
        }
    }
}

fn frame_from(bytes: &[u8], pool: &HeapPool) -> Result<SharedFrame> {
    let mut buffer = pool.alloc_buffer(bytes.len(), false)?;
    buffer.set_payload(bytes.len())?;
    buffer.payload_bytes_mut().copy_from_slice(bytes);
    let mut frame = Frame::new();
    frame.append_buffer(buffer);
    Ok(frame.into_shared())
}

/// UDP client endpoint.
pub struct UdpClient {
    socket: UdpSocket,
    pool: Arc<HeapPool>,
    master: Master,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    this: Weak<UdpClient>,
}

impl UdpClient {
    /// Connect to `host:port`, limiting datagrams to `max_size` bytes.
    pub fn connect(
        host: &str,
        port: u16,
        max_size: usize,
    ) -> std::result::Result<Arc<Self>, TransportError> {
        let network = |source| TransportError::Network { host: host.to_string(), port, source };

        let socket = UdpSocket::bind(("0.0.0.0", 0)).map_err(network)?;
        socket.connect((host, port)).map_err(network)?;
        socket.set_read_timeout(Some(RX_POLL)).map_err(network)?;

        tracing::info!(host, port, max_size, "udp client connected");
        Ok(Arc::new_cyclic(|this| Self {
            socket,
            pool: HeapPool::new(max_size, 32),
            master: Master::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            rx_bytes: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            this: this.clone(),
        }))
    }

    /// Attach a slave receiving inbound frames.
    pub fn attach(&self, slave: Arc<dyn StreamSlave>) {
        self.master.add_slave(slave);
    }

    /// Local socket address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Bytes received so far.
    pub fn rx_byte_count(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    /// Bytes sent so far.
    pub fn tx_byte_count(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    /// Spawn the receive worker.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let this = self.this.clone();
        let shutdown = self.shutdown.clone();
        let max_size = self.pool.buffer_size();
        *worker = Some(thread::spawn(move || {
            let Some(client) = this.upgrade() else { return };
            let socket = match client.socket.try_clone() {
                Ok(socket) => socket,
                Err(err) => {
                    tracing::warn!(%err, "udp socket clone failed");
                    return;
                },
            };
            drop(client);
            recv_loop(&socket, &shutdown, max_size, |bytes, _peer| {
                let Some(client) = this.upgrade() else { return };
                client.rx_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                match frame_from(bytes, &client.pool) {
                    Ok(frame) => client.master.send_frame(&frame),
                    Err(err) => tracing::warn!(%err, "rx frame allocation failed"),
                }
            });
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
}

impl StreamSlave for UdpClient {
    fn accept_frame(&self, frame: SharedFrame) {
        let guard = frame.lock();
        for buffer in guard.buffers() {
            let datagram = buffer.payload_bytes();
            if datagram.is_empty() {
                continue;
            }
            match self.socket.send(datagram) {
                Ok(sent) => {
                    self.tx_bytes.fetch_add(sent as u64, Ordering::Relaxed);
                },
                Err(err) => tracing::warn!(%err, "udp send failed"),
            }
        }
    }

    fn accept_req(&self, size: usize, zero_copy: bool) -> Result<SharedFrame> {
        Ok(self.pool.req_frame(size, zero_copy)?.into_shared())
    }
}

impl Drop for UdpClient {
    fn drop(&mut self) {
        self.stop();
    }
}

/// UDP server endpoint.
///
/// Learns its peer from the most recent inbound datagram.
pub struct UdpServer {
    socket: UdpSocket,
    pool: Arc<HeapPool>,
    master: Master,
    peer: Mutex<Option<SocketAddr>>,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    this: Weak<UdpServer>,
}

impl UdpServer {
    /// Bind to `port` (0 asks the kernel) with the given datagram limit.
    pub fn bind(port: u16, max_size: usize) -> std::result::Result<Arc<Self>, TransportError> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).map_err(|source| {
            TransportError::Network { host: "0.0.0.0".to_string(), port, source }
        })?;
        socket.set_read_timeout(Some(RX_POLL)).map_err(TransportError::Io)?;

        let bound = socket.local_addr().map_err(TransportError::Io)?;
        tracing::info!(port = bound.port(), max_size, "udp server bound");
        Ok(Arc::new_cyclic(|this| Self {
            socket,
            pool: HeapPool::new(max_size, 32),
            master: Master::new(),
            peer: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            this: this.clone(),
        }))
    }

    /// Port the kernel actually bound.
    pub fn local_port(&self) -> std::io::Result<u16> {
        self.socket.local_addr().map(|addr| addr.port())
    }

    /// Attach a slave receiving inbound frames.
    pub fn attach(&self, slave: Arc<dyn StreamSlave>) {
        self.master.add_slave(slave);
    }

    /// Spawn the receive worker.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let this = self.this.clone();
        let shutdown = self.shutdown.clone();
        let max_size = self.pool.buffer_size();
        *worker = Some(thread::spawn(move || {
            let Some(server) = this.upgrade() else { return };
            let socket = match server.socket.try_clone() {
                Ok(socket) => socket,
                Err(err) => {
                    tracing::warn!(%err, "udp socket clone failed");
                    return;
                },
            };
            drop(server);
            recv_loop(&socket, &shutdown, max_size, |bytes, peer| {
                let Some(server) = this.upgrade() else { return };
                *server.peer.lock() = Some(peer);
                match frame_from(bytes, &server.pool) {
                    Ok(frame) => server.master.send_frame(&frame),
                    Err(err) => tracing::warn!(%err, "rx frame allocation failed"),
                }
            });
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
}

impl StreamSlave for UdpServer {
    fn accept_frame(&self, frame: SharedFrame) {
        let Some(peer) = *self.peer.lock() else {
            tracing::warn!("no peer yet, outbound frame dropped");
            return;
        };
        let guard = frame.lock();
        for buffer in guard.buffers() {
            let datagram = buffer.payload_bytes();
            if datagram.is_empty() {
                continue;
            }
            if let Err(err) = self.socket.send_to(datagram, peer) {
                tracing::warn!(%err, "udp send failed");
            }
        }
    }

    fn accept_req(&self, size: usize, zero_copy: bool) -> Result<SharedFrame> {
        Ok(self.pool.req_frame(size, zero_copy)?.into_shared())
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelink_stream::Buffer;
    use parking_lot::Mutex as PlMutex;
    use std::time::Instant;

    #[derive(Default)]
    struct Sink {
        frames: PlMutex<Vec<SharedFrame>>,
    }

    impl StreamSlave for Sink {
        fn accept_frame(&self, frame: SharedFrame) {
            self.frames.lock().push(frame);
        }
    }

    fn wait_for<T>(mut probe: impl FnMut() -> Option<T>, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(value) = probe() {
                return Some(value);
            }
            thread::sleep(Duration::from_millis(5));
        }
        None
    }

    fn payload_frame(bytes: &[u8]) -> SharedFrame {
        let mut buffer = Buffer::heap(bytes.len());
        buffer.set_payload_full();
        buffer.payload_bytes_mut().copy_from_slice(bytes);
        let mut frame = Frame::new();
        frame.append_buffer(buffer);
        frame.into_shared()
    }

    #[test]
    fn client_to_server_and_back() {
        let server = UdpServer::bind(0, 1500).unwrap();
        let server_sink = Arc::new(Sink::default());
        server.attach(server_sink.clone());
        server.start();
        let port = server.local_port().unwrap();

        let client = UdpClient::connect("127.0.0.1", port, 1500).unwrap();
        let client_sink = Arc::new(Sink::default());
        client.attach(client_sink.clone());
        client.start();

        // Client speaks first so the server learns its peer.
        client.accept_frame(payload_frame(&[1, 2, 3, 4]));
        wait_for(
            || (!server_sink.frames.lock().is_empty()).then_some(()),
            Duration::from_secs(2),
        )
        .expect("server received datagram");

        let received: Vec<u8> =
            server_sink.frames.lock()[0].lock().read_cursor().collect();
        assert_eq!(received, vec![1, 2, 3, 4]);

        // Server replies to the learned peer.
        server.accept_frame(payload_frame(&[9, 8, 7]));
        wait_for(
            || (!client_sink.frames.lock().is_empty()).then_some(()),
            Duration::from_secs(2),
        )
        .expect("client received reply");

        let reply: Vec<u8> = client_sink.frames.lock()[0].lock().read_cursor().collect();
        assert_eq!(reply, vec![9, 8, 7]);

        client.stop();
        server.stop();
    }

    #[test]
    fn server_reports_kernel_assigned_port() {
        let server = UdpServer::bind(0, 1500).unwrap();
        assert_ne!(server.local_port().unwrap(), 0);
    }

    #[test]
    fn multi_buffer_frames_become_multiple_datagrams() {
        let server = UdpServer::bind(0, 1500).unwrap();
        let sink = Arc::new(Sink::default());
        server.attach(sink.clone());
        server.start();
        let port = server.local_port().unwrap();

        let client = UdpClient::connect("127.0.0.1", port, 1500).unwrap();
        let frame = {
            let mut frame = Frame::new();
            for fill in [0x11u8, 0x22] {
                let mut buffer = Buffer::heap(8);
                buffer.set_payload_full();
                buffer.payload_bytes_mut().fill(fill);
                frame.append_buffer(buffer);
            }
            frame.into_shared()
        };
        client.accept_frame(frame);

        wait_for(
            || (sink.frames.lock().len() >= 2).then_some(()),
            Duration::from_secs(2),
        )
        .expect("two datagrams received");
        server.stop();
    }
}
