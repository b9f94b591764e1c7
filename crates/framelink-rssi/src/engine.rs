//! Connection state machine.
//!
//! Synchronous core of the controller: no threads, no sockets. The timer
//! worker calls [`Engine::poll`] with the current instant and transmits
//! whatever frames come back; the transport receive path feeds parsed
//! segments into [`Engine::on_segment`]; the application path gates on
//! [`Engine::admit`] and stamps outbound frames through
//! [`Engine::register_data`]. Keeping the core synchronous makes every
//! state transition testable with nothing but crafted segments and
//! fabricated instants.
//!
//! ```text
//!           TryPeriod        SYN+ACK(ack==loc_seq)
//! Closed ------------> WaitSyn ----------> SendSeqAck --> Open
//!    ^                                                     |
//!    |        RST / stray SYN / retransmission exhausted   |
//!    +----------------------- Error <----------------------+
//! ```

use std::time::{Duration, Instant};

use framelink_proto::rssi::{
    HEADER_SIZE, SYN_SIZE, Segment, SynParams, VERSION, encode_plain, encode_syn, flag,
};
use framelink_stream::{Buffer, Frame, Result, SharedFrame, StreamError};

use crate::{LOC_MAX_BUFFERS, RssiConfig, TRY_PERIOD};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No connection; SYNs are emitted every try period.
    Closed,
    /// SYN sent, waiting for the peer's SYN+ACK.
    WaitSyn,
    /// Handshake acknowledged; our final ACK is due.
    SendSeqAck,
    /// Connection established.
    Open,
    /// Fault observed; a RST is due, then back to Closed.
    Error,
}

/// One unacknowledged outbound segment.
struct TxEntry {
    frame: SharedFrame,
    nul: bool,
    sent_at: Instant,
    resend_count: u8,
}

/// Frames and scheduling produced by one timer poll.
pub struct PollOutcome {
    /// Frames to hand to the transport, in order.
    pub frames: Vec<SharedFrame>,
    /// How long the timer may sleep before the next poll.
    pub wait: Duration,
    /// Transmit window slots were freed; wake blocked writers.
    pub window_freed: bool,
    /// Connection reset; the inbound queue must be drained.
    pub reset_inbound: bool,
}

/// Disposition of one received segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxOutcome {
    /// Not meaningful in the current state.
    Ignored,
    /// Out-of-order or duplicate; counted and discarded.
    Dropped,
    /// Sequence advanced. `deliver` is set for payload segments that
    /// belong on the application queue.
    Accepted {
        /// Push the segment's payload to the application.
        deliver: bool,
    },
    /// Handshake progressed; poke the timer.
    Handshake,
    /// The connection moved to [`ConnState::Error`]; poke the timer.
    Errored,
}

/// Admission verdict for an application frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admit {
    /// Window space available.
    Ready,
    /// Transmit window full or the peer signalled BUSY.
    Busy,
    /// Connection is not open.
    NotOpen,
}

/// RSSI connection state machine.
pub struct Engine {
    config: RssiConfig,
    state: ConnState,

    loc_sequence: u8,
    rem_sequence: u8,
    last_ack_rx: u8,
    prev_ack_rx: u8,
    ack_tx_pend: u32,
    tran_busy: bool,
    inbound_busy: bool,

    rem_max_buffers: u8,
    rem_max_segment: u16,
    retran_tout: u16,
    cum_ack_tout: u16,
    null_tout: u16,
    max_retran: u8,
    max_cum_ack: u8,

    tx_list: Vec<Option<TxEntry>>,
    tx_list_count: usize,
    st_time: Instant,

    down_count: u32,
    drop_count: u32,
    retran_count: u32,
}

impl Engine {
    /// Fresh engine in [`ConnState::Closed`].
    pub fn new(config: RssiConfig, now: Instant) -> Self {
        let retran_tout = config.retran_tout;
        let cum_ack_tout = config.cum_ack_tout;
        let null_tout = config.null_tout;
        let max_retran = config.max_retran;
        let max_cum_ack = config.max_cum_ack;
        Self {
            config,
            state: ConnState::Closed,
            loc_sequence: 100,
            rem_sequence: 0,
            last_ack_rx: 0,
            prev_ack_rx: 0,
            ack_tx_pend: 0,
            tran_busy: false,
            inbound_busy: false,
            rem_max_buffers: 0,
            rem_max_segment: 0,
            retran_tout,
            cum_ack_tout,
            null_tout,
            max_retran,
            max_cum_ack,
            tx_list: (0..256).map(|_| None).collect(),
            tx_list_count: 0,
            st_time: now,
            down_count: 0,
            drop_count: 0,
            retran_count: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// True in [`ConnState::Open`].
    pub fn is_open(&self) -> bool {
        self.state == ConnState::Open
    }

    /// Times the connection dropped back to Closed.
    pub fn down_count(&self) -> u32 {
        self.down_count
    }

    /// Out-of-order or duplicate segments discarded.
    pub fn drop_count(&self) -> u32 {
        self.drop_count
    }

    /// Segments retransmitted.
    pub fn retran_count(&self) -> u32 {
        self.retran_count
    }

    /// Count a drop detected outside the state machine (inbound queue
    /// overflow).
    pub fn count_drop(&mut self) {
        self.drop_count += 1;
    }

    /// Unacknowledged outbound segments.
    pub fn tx_list_count(&self) -> usize {
        self.tx_list_count
    }

    /// Local and remote sequence numbers, for observation.
    pub fn sequences(&self) -> (u8, u8) {
        (self.loc_sequence, self.rem_sequence)
    }

    /// Peer flow-control state from the last BUSY flag seen.
    pub fn tran_busy(&self) -> bool {
        self.tran_busy
    }

    /// Largest data segment the peer accepts; zero before negotiation.
    pub fn rem_max_segment(&self) -> u16 {
        self.rem_max_segment
    }

    /// Mirror of the inbound queue's back-pressure, stamped into the BUSY
    /// bit of outbound headers.
    pub fn set_inbound_busy(&mut self, busy: bool) {
        self.inbound_busy = busy;
    }

    /// Window accounting invariant: unacked entries equal the sequence
    /// span between the last slide point and the newest segment.
    pub fn window_invariant(&self) -> bool {
        self.tx_list_count == usize::from(self.loc_sequence.wrapping_sub(self.prev_ack_rx))
    }

    /// Force the error path; used at shutdown so the peer sees a RST.
    pub fn force_error(&mut self, now: Instant) {
        if self.state != ConnState::Closed {
            self.state = ConnState::Error;
            self.st_time = now;
        }
    }

    fn dur(&self, units: u16) -> Duration {
        self.config.to_duration(units)
    }

    /// Run the state machine once.
    pub fn poll(&mut self, now: Instant) -> PollOutcome {
        match self.state {
            ConnState::Closed | ConnState::WaitSyn => self.poll_closed(now),
            ConnState::SendSeqAck => self.poll_send_seq_ack(now),
            ConnState::Open => self.poll_open(now),
            ConnState::Error => self.poll_error(now),
        }
    }

    fn poll_closed(&mut self, now: Instant) -> PollOutcome {
        let mut frames = Vec::new();
        if now.duration_since(self.st_time) >= self.dur(TRY_PERIOD) {
            let params = SynParams {
                version: VERSION,
                chk: true,
                max_outstanding: LOC_MAX_BUFFERS,
                max_segment: self.config.segment_size as u16,
                retran_tout: self.config.retran_tout,
                cum_ack_tout: self.config.cum_ack_tout,
                null_tout: self.config.null_tout,
                max_retran: self.config.max_retran,
                max_cum_ack: self.config.max_cum_ack,
                timeout_unit: self.config.timeout_unit,
                conn_id: self.config.conn_id,
            };
            let mut wire = [0u8; SYN_SIZE];
            if encode_syn(0, self.loc_sequence, 0, &params, &mut wire).is_ok() {
                tracing::debug!(seq = self.loc_sequence, "emit SYN");
                frames.push(control_frame(&wire));
                self.state = ConnState::WaitSyn;
                self.st_time = now;
            }
        }
        PollOutcome {
            frames,
            wait: self.dur(TRY_PERIOD) / 4,
            window_freed: false,
            reset_inbound: false,
        }
    }

    fn poll_send_seq_ack(&mut self, now: Instant) -> PollOutcome {
        let mut wire = [0u8; HEADER_SIZE];
        let mut frames = Vec::new();
        if encode_plain(flag::ACK, self.loc_sequence, self.rem_sequence, &mut wire).is_ok() {
            frames.push(control_frame(&wire));
        }
        tracing::info!(loc = self.loc_sequence, rem = self.rem_sequence, "connection open");
        self.state = ConnState::Open;
        self.st_time = now;
        PollOutcome {
            frames,
            wait: self.dur(self.null_tout / 10),
            window_freed: false,
            reset_inbound: false,
        }
    }

    fn poll_open(&mut self, now: Instant) -> PollOutcome {
        let mut frames = Vec::new();
        let mut wait = self.dur(self.cum_ack_tout) / 4;
        let mut window_freed = false;

        // Slide the window over everything the peer has acknowledged.
        while self.last_ack_rx != self.prev_ack_rx {
            self.prev_ack_rx = self.prev_ack_rx.wrapping_add(1);
            if self.tx_list[usize::from(self.prev_ack_rx)].take().is_some() {
                self.tx_list_count -= 1;
            }
            window_freed = true;
        }

        // Retransmit the first expired unacked segment.
        if self.last_ack_rx != self.loc_sequence {
            let mut idx = self.last_ack_rx.wrapping_add(1);
            loop {
                let retran_due = self.dur(self.retran_tout);
                if let Some(entry) = self.tx_list[usize::from(idx)].as_mut() {
                    if now.duration_since(entry.sent_at) >= retran_due {
                        if entry.resend_count >= self.max_retran {
                            tracing::warn!(seq = idx, "retransmission budget exhausted");
                            self.state = ConnState::Error;
                            self.st_time = now;
                            return PollOutcome {
                                frames,
                                wait: Duration::ZERO,
                                window_freed,
                                reset_inbound: false,
                            };
                        }
                        entry.resend_count += 1;
                        entry.sent_at = now;
                        let flags = flag::ACK
                            | if entry.nul { flag::NUL } else { 0 }
                            | if self.inbound_busy { flag::BUSY } else { 0 };
                        restamp(&entry.frame, flags, idx, self.rem_sequence);
                        tracing::debug!(seq = idx, count = entry.resend_count, "retransmit");
                        frames.push(entry.frame.clone());
                        self.retran_count += 1;
                        self.ack_tx_pend = 0;
                        self.st_time = now;
                        wait = Duration::ZERO;
                        break;
                    }
                }
                if idx == self.loc_sequence {
                    break;
                }
                idx = idx.wrapping_add(1);
            }
        }

        // Keep-alive NUL well inside the peer's null timeout.
        let do_null = now.duration_since(self.st_time) >= self.dur(self.null_tout / 3);

        // Standalone ACK when acks accumulate or a NUL is due.
        if frames.is_empty()
            && (do_null
                || self.ack_tx_pend >= u32::from(self.max_cum_ack)
                || (self.ack_tx_pend > 0
                    && now.duration_since(self.st_time) >= self.dur(self.cum_ack_tout)))
        {
            let mut flags = flag::ACK;
            if do_null {
                flags |= flag::NUL;
                self.loc_sequence = self.loc_sequence.wrapping_add(1);
            }
            if self.inbound_busy {
                flags |= flag::BUSY;
            }

            let mut wire = [0u8; HEADER_SIZE];
            if encode_plain(flags, self.loc_sequence, self.rem_sequence, &mut wire).is_ok() {
                let frame = control_frame(&wire);
                if do_null {
                    self.tx_list[usize::from(self.loc_sequence)] = Some(TxEntry {
                        frame: frame.clone(),
                        nul: true,
                        sent_at: now,
                        resend_count: 0,
                    });
                    self.tx_list_count += 1;
                }
                frames.push(frame);
                self.ack_tx_pend = 0;
                self.st_time = now;
            }
        }

        PollOutcome { frames, wait, window_freed, reset_inbound: false }
    }

    fn poll_error(&mut self, now: Instant) -> PollOutcome {
        self.loc_sequence = self.loc_sequence.wrapping_add(1);
        let mut frames = Vec::new();
        let mut wire = [0u8; HEADER_SIZE];
        if encode_plain(flag::RST, self.loc_sequence, 0, &mut wire).is_ok() {
            frames.push(control_frame(&wire));
        }
        tracing::warn!(down_count = self.down_count + 1, "connection reset, closing");

        for entry in &mut self.tx_list {
            *entry = None;
        }
        self.tx_list_count = 0;
        self.tran_busy = false;
        self.ack_tx_pend = 0;
        self.down_count += 1;
        self.state = ConnState::Closed;
        self.st_time = now;

        PollOutcome {
            frames,
            wait: self.dur(TRY_PERIOD) / 4,
            window_freed: true,
            reset_inbound: true,
        }
    }

    /// Feed one received, checksum-valid segment.
    ///
    /// `has_payload` is true when the carrying frame holds bytes beyond
    /// the header.
    pub fn on_segment(&mut self, seg: &Segment, has_payload: bool, now: Instant) -> RxOutcome {
        if let Some(params) = &seg.syn {
            return match self.state {
                ConnState::WaitSyn
                    if seg.is_ack() && seg.acknowledge == self.loc_sequence =>
                {
                    tracing::info!(
                        rem_seq = seg.sequence,
                        max_outstanding = params.max_outstanding,
                        max_segment = params.max_segment,
                        "SYN+ACK accepted"
                    );
                    self.rem_sequence = seg.sequence;
                    self.rem_max_buffers = params.max_outstanding;
                    self.rem_max_segment = params.max_segment;
                    self.retran_tout = params.retran_tout;
                    self.cum_ack_tout = params.cum_ack_tout;
                    self.null_tout = params.null_tout;
                    self.max_retran = params.max_retran;
                    self.max_cum_ack = params.max_cum_ack;
                    self.last_ack_rx = seg.acknowledge;
                    self.prev_ack_rx = seg.acknowledge;
                    self.state = ConnState::SendSeqAck;
                    self.st_time = now;
                    RxOutcome::Handshake
                },
                ConnState::Open => {
                    self.state = ConnState::Error;
                    self.st_time = now;
                    RxOutcome::Errored
                },
                _ => RxOutcome::Ignored,
            };
        }

        if self.state != ConnState::Open {
            return RxOutcome::Ignored;
        }

        if seg.is_rst() {
            tracing::warn!("RST from peer");
            self.state = ConnState::Error;
            self.st_time = now;
            return RxOutcome::Errored;
        }

        if seg.is_ack() {
            self.last_ack_rx = seg.acknowledge;
        }
        self.tran_busy = seg.is_busy();

        if seg.is_nul() || has_payload {
            if seg.sequence == self.rem_sequence.wrapping_add(1) {
                self.rem_sequence = seg.sequence;
                self.ack_tx_pend += 1;
                RxOutcome::Accepted { deliver: has_payload && !seg.is_nul() }
            } else {
                tracing::warn!(
                    got = seg.sequence,
                    expect = self.rem_sequence.wrapping_add(1),
                    "out-of-order segment dropped"
                );
                self.drop_count += 1;
                RxOutcome::Dropped
            }
        } else {
            RxOutcome::Ignored
        }
    }

    /// Flow-control verdict for the application path.
    pub fn admit(&self) -> Admit {
        if self.state != ConnState::Open {
            Admit::NotOpen
        } else if self.tx_list_count >= usize::from(self.rem_max_buffers) || self.tran_busy {
            Admit::Busy
        } else {
            Admit::Ready
        }
    }

    /// Stamp and register an admitted application frame.
    ///
    /// The frame's first buffer must hold [`HEADER_SIZE`] bytes of head
    /// room; the header is written there and the frame is tracked in the
    /// transmit window until acknowledged.
    pub fn register_data(&mut self, frame: &SharedFrame, now: Instant) -> Result<()> {
        let mut guard = frame.lock();
        let Some(first) = guard.buffer_mut(0) else {
            return Err(StreamError::Boundary { requested: HEADER_SIZE, limit: 0 });
        };
        if first.head_room() < HEADER_SIZE {
            return Err(StreamError::Boundary { requested: HEADER_SIZE, limit: first.head_room() });
        }
        first.adjust_header(-(HEADER_SIZE as i64))?;

        self.loc_sequence = self.loc_sequence.wrapping_add(1);
        let flags = flag::ACK | if self.inbound_busy { flag::BUSY } else { 0 };
        encode_plain(flags, self.loc_sequence, self.rem_sequence, first.payload_bytes_mut())
            .map_err(|_| StreamError::Boundary { requested: HEADER_SIZE, limit: 0 })?;
        drop(guard);

        self.tx_list[usize::from(self.loc_sequence)] = Some(TxEntry {
            frame: frame.clone(),
            nul: false,
            sent_at: now,
            resend_count: 0,
        });
        self.tx_list_count += 1;
        self.ack_tx_pend = 0;
        self.st_time = now;
        Ok(())
    }
}

/// Heap-allocated control segment (SYN, ACK, NUL, RST).
fn control_frame(wire: &[u8]) -> SharedFrame {
    let mut buffer = Buffer::heap(wire.len());
    buffer.set_payload_full();
    buffer.payload_bytes_mut().copy_from_slice(wire);
    let mut frame = Frame::new();
    frame.append_buffer(buffer);
    frame.into_shared()
}

/// Rewrite the header of a tracked frame in place (retransmissions carry
/// the current acknowledge and busy state).
fn restamp(frame: &SharedFrame, flags: u8, sequence: u8, acknowledge: u8) {
    let mut guard = frame.lock();
    if let Some(first) = guard.buffer_mut(0) {
        let _ = encode_plain(flags, sequence, acknowledge, first.payload_bytes_mut());
    }
}
