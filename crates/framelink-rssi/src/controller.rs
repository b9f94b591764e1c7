//! Threaded RSSI controller wrapping the state-machine engine.
//!
//! Thread inventory: one timer worker running the connection state machine
//! (SYN retry, retransmission scan, keep-alive, cumulative acks) and one
//! delivery worker draining the inbound queue toward the application
//! master. Application writers block on the engine's condvar while the
//! transmit window is full; the transport receive path never blocks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use framelink_proto::rssi::{HEADER_SIZE, Segment};
use framelink_stream::{
    FrameQueue, Master, Result, SharedFrame, StreamError, StreamSlave,
};

use crate::engine::{Admit, ConnState, Engine, RxOutcome};
use crate::{LOC_MAX_BUFFERS, RssiConfig};

/// Reliable-transport controller for one connection.
pub struct Rssi {
    config: RssiConfig,
    engine: Mutex<Engine>,
    timer_cv: Condvar,
    app_cv: Condvar,
    transport: Master,
    app: Master,
    inbound: FrameQueue,
    shutdown: Arc<AtomicBool>,
    timer: Mutex<Option<JoinHandle<()>>>,
    deliver: Mutex<Option<JoinHandle<()>>>,
    this: Weak<Rssi>,
}

impl Rssi {
    /// Create a controller; attach both sides and call [`Rssi::start`].
    pub fn new(config: RssiConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            engine: Mutex::new(Engine::new(config.clone(), Instant::now())),
            config,
            timer_cv: Condvar::new(),
            app_cv: Condvar::new(),
            transport: Master::new(),
            app: Master::new(),
            inbound: FrameQueue::new(usize::from(LOC_MAX_BUFFERS) * 2),
            shutdown: Arc::new(AtomicBool::new(false)),
            timer: Mutex::new(None),
            deliver: Mutex::new(None),
            this: this.clone(),
        })
    }

    /// Attach the transport slave segments are sent to and buffers are
    /// requested from.
    pub fn attach_transport(&self, slave: Arc<dyn StreamSlave>) {
        self.transport.add_slave(slave);
    }

    /// Attach the application slave receiving in-sequence payload.
    pub fn attach_application(&self, slave: Arc<dyn StreamSlave>) {
        self.app.add_slave(slave);
    }

    /// Transport-facing port receiving wire segments.
    pub fn transport_port(&self) -> Arc<TransportPort> {
        Arc::new(TransportPort { ctrl: self.this.clone() })
    }

    /// Application-facing port for outbound payload.
    pub fn application_port(&self) -> Arc<ApplicationPort> {
        Arc::new(ApplicationPort { ctrl: self.this.clone() })
    }

    /// Current connection state.
    pub fn state(&self) -> ConnState {
        self.engine.lock().state()
    }

    /// True once the three-way handshake has completed.
    pub fn is_open(&self) -> bool {
        self.engine.lock().is_open()
    }

    /// Times the connection dropped.
    pub fn down_count(&self) -> u32 {
        self.engine.lock().down_count()
    }

    /// Out-of-order, duplicate or overflowed segments discarded.
    pub fn drop_count(&self) -> u32 {
        self.engine.lock().drop_count()
    }

    /// Segments retransmitted.
    pub fn retran_count(&self) -> u32 {
        self.engine.lock().retran_count()
    }

    /// Spawn the timer and delivery workers.
    pub fn start(&self) {
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return;
        }

        let this = self.this.clone();
        let shutdown = self.shutdown.clone();
        *timer = Some(thread::spawn(move || run_timer(&this, &shutdown)));

        let this = self.this.clone();
        let shutdown = self.shutdown.clone();
        *self.deliver.lock() = Some(thread::spawn(move || run_delivery(&this, &shutdown)));
    }

    /// Stop and join both workers, emitting a final RST.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.timer_cv.notify_all();
        self.app_cv.notify_all();
        for slot in [&self.timer, &self.deliver] {
            let handle = slot.lock().take();
            if let Some(handle) = handle {
                if handle.thread().id() != thread::current().id() {
                    let _ = handle.join();
                }
            }
        }
    }

    /// Handle one segment arriving from the transport.
    pub fn transport_rx(&self, frame: &SharedFrame) {
        let parsed = {
            let guard = frame.lock();
            if guard.is_empty() {
                tracing::warn!("empty frame on transport");
                return;
            }
            match Segment::parse(guard.buffers()[0].payload_bytes()) {
                Ok(segment) => {
                    let has_payload = guard.payload() > segment.header_len();
                    Some((segment, has_payload))
                },
                Err(err) => {
                    tracing::debug!(%err, "ignoring invalid segment");
                    None
                },
            }
        };
        let Some((segment, has_payload)) = parsed else { return };

        let outcome = {
            let mut engine = self.engine.lock();
            engine
                .set_inbound_busy(self.inbound.len() >= usize::from(LOC_MAX_BUFFERS));
            engine.on_segment(&segment, has_payload, Instant::now())
        };

        if outcome == (RxOutcome::Accepted { deliver: true }) {
            {
                let mut guard = frame.lock();
                if let Some(first) = guard.buffer_mut(0) {
                    let _ = first.adjust_header(HEADER_SIZE as i64);
                }
            }
            if self.inbound.try_push_back(frame.clone()).is_err() {
                tracing::warn!("inbound queue full, payload dropped");
                self.engine.lock().count_drop();
            }
        }

        self.timer_cv.notify_one();
        self.app_cv.notify_all();
    }

    /// Send an application frame over the connection.
    ///
    /// Blocks while the transmit window is full or the connection is not
    /// open, up to the configured admission timeout. The frame's first
    /// buffer must carry the header reservation made by
    /// [`Rssi::req_app_frame`].
    pub fn application_tx(&self, frame: &SharedFrame) -> Result<()> {
        let deadline = Instant::now() + self.config.timeout;
        {
            let mut engine = self.engine.lock();
            loop {
                match engine.admit() {
                    Admit::Ready => break,
                    Admit::Busy | Admit::NotOpen => {
                        if Instant::now() >= deadline {
                            return Err(StreamError::Timeout { elapsed: self.config.timeout });
                        }
                        let _ = self.app_cv.wait_until(&mut engine, deadline);
                    },
                }
            }
            engine.register_data(frame, Instant::now())?;
        }

        self.transport.send_frame(frame);
        self.timer_cv.notify_one();
        Ok(())
    }

    /// Allocate an application frame from the transport pool with header
    /// space reserved and buffer windows capped at the negotiated segment
    /// size.
    pub fn req_app_frame(&self, size: usize, zero_copy: bool) -> Result<SharedFrame> {
        let segment_cap = {
            let engine = self.engine.lock();
            let remote = usize::from(engine.rem_max_segment());
            if remote == 0 { self.config.segment_size } else { self.config.segment_size.min(remote) }
        };

        let shared = self.transport.req_frame(size + HEADER_SIZE, zero_copy)?;
        {
            let mut guard = shared.lock();
            if guard.is_empty() {
                return Err(StreamError::Allocation { requested: size });
            }
            for (index, buffer) in guard.buffers_mut().iter_mut().enumerate() {
                let mut cap = segment_cap;
                if index == 0 {
                    buffer.adjust_header(HEADER_SIZE as i64)?;
                    cap = cap.saturating_sub(HEADER_SIZE);
                }
                let window = buffer.size();
                if window > cap {
                    buffer.adjust_tail((window - cap) as i64)?;
                }
            }
        }
        Ok(shared)
    }
}

impl Drop for Rssi {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_timer(this: &Weak<Rssi>, shutdown: &AtomicBool) {
    let mut wait = Duration::from_millis(1);
    while !shutdown.load(Ordering::Relaxed) {
        let Some(ctrl) = this.upgrade() else { return };

        let outcome = {
            let mut engine = ctrl.engine.lock();
            if !wait.is_zero() {
                let _ = ctrl.timer_cv.wait_for(&mut engine, wait);
            }
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            engine.set_inbound_busy(ctrl.inbound.len() >= usize::from(LOC_MAX_BUFFERS));
            engine.poll(Instant::now())
        };

        if outcome.window_freed {
            ctrl.app_cv.notify_all();
        }
        if outcome.reset_inbound {
            while ctrl.inbound.try_pop_front().is_some() {}
        }
        for frame in &outcome.frames {
            ctrl.transport.send_frame(frame);
        }
        wait = outcome.wait;
    }

    // Tell the peer we are going away.
    if let Some(ctrl) = this.upgrade() {
        let now = Instant::now();
        let frames = {
            let mut engine = ctrl.engine.lock();
            engine.force_error(now);
            if engine.state() == ConnState::Error { engine.poll(now).frames } else { Vec::new() }
        };
        for frame in &frames {
            ctrl.transport.send_frame(frame);
        }
    }
}

fn run_delivery(this: &Weak<Rssi>, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Relaxed) {
        let Some(ctrl) = this.upgrade() else { return };
        let deadline = Instant::now() + Duration::from_millis(100);
        if let Some(frame) = ctrl.inbound.pop_front(deadline) {
            ctrl.app.send_frame(&frame);
            // Draining may have cleared our BUSY condition.
            ctrl.timer_cv.notify_one();
        }
    }
}

/// Transport-facing port.
pub struct TransportPort {
    ctrl: Weak<Rssi>,
}

impl StreamSlave for TransportPort {
    fn accept_frame(&self, frame: SharedFrame) {
        if let Some(ctrl) = self.ctrl.upgrade() {
            ctrl.transport_rx(&frame);
        }
    }
}

/// Application-facing port.
pub struct ApplicationPort {
    ctrl: Weak<Rssi>,
}

impl StreamSlave for ApplicationPort {
    fn accept_frame(&self, frame: SharedFrame) {
        if let Some(ctrl) = self.ctrl.upgrade() {
            if let Err(err) = ctrl.application_tx(&frame) {
                tracing::warn!(%err, "application frame not admitted");
            }
        }
    }

    fn accept_req(&self, size: usize, zero_copy: bool) -> Result<SharedFrame> {
        let ctrl = self.ctrl.upgrade().ok_or(StreamError::NoSlave)?;
        ctrl.req_app_frame(size, zero_copy)
    }
}
