//! A single register-access request and its completion state.
//!
//! Transactions are shared (`Arc`) between the issuing master, the owning
//! slave's in-flight table and the protocol bridge servicing them. The
//! data window is owned by the transaction itself: write payload is copied
//! in at creation, read responses are copied in by the completing slave,
//! and the caller copies results out only after observing a successful
//! completion. That keeps partial responses invisible.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::code;

/// Process-wide transaction id counter; ids are never zero.
static NEXT_ID: AtomicU32 = AtomicU32::new(1);

fn next_id() -> u32 {
    loop {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

/// Access type of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// Register read.
    Read,
    /// Register write.
    Write,
    /// Posted write: completes as soon as it is on the wire.
    Post,
    /// Verify readback.
    Verify,
}

struct State {
    completion: Option<u32>,
    deadline: Instant,
}

/// One register-access request.
pub struct Transaction {
    id: u32,
    address: u64,
    kind: AccessKind,
    data: Mutex<Vec<u8>>,
    state: Mutex<State>,
    completed: Condvar,
}

impl Transaction {
    /// Create a transaction over `data` (request payload for writes, a
    /// zero-filled response window for reads) expiring at `deadline`.
    pub fn new(address: u64, kind: AccessKind, data: Vec<u8>, deadline: Instant) -> Arc<Self> {
        Arc::new(Self {
            id: next_id(),
            address,
            kind,
            data: Mutex::new(data),
            state: Mutex::new(State { completion: None, deadline }),
            completed: Condvar::new(),
        })
    }

    /// Process-unique id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Target address.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Access type.
    pub fn kind(&self) -> AccessKind {
        self.kind
    }

    /// Transfer size in bytes.
    pub fn size(&self) -> u32 {
        self.data.lock().len() as u32
    }

    /// Lock the data window.
    ///
    /// Slaves write response bytes here before completing; callers read
    /// results here after a successful wait.
    pub fn data(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock()
    }

    /// Complete the transaction.
    ///
    /// Only the first completion takes effect; later calls are ignored, so
    /// a slave racing the timeout path cannot flip an already-delivered
    /// result.
    pub fn done(&self, completion_code: u32) {
        let mut state = self.state.lock();
        if state.completion.is_none() {
            state.completion = Some(completion_code);
            self.completed.notify_all();
        }
    }

    /// Completion code, if terminal.
    pub fn completion(&self) -> Option<u32> {
        self.state.lock().completion
    }

    /// True once the transaction is terminal or past its deadline.
    ///
    /// Slaves drop responses for expired transactions.
    pub fn expired(&self) -> bool {
        let state = self.state.lock();
        state.completion.is_some() || Instant::now() > state.deadline
    }

    /// Push the deadline out to `now + timeout`.
    pub fn refresh_deadline(&self, timeout: Duration) {
        self.state.lock().deadline = Instant::now() + timeout;
    }

    /// Block until the transaction is terminal, timing it out at the
    /// deadline. Returns the completion code.
    pub fn wait(&self) -> u32 {
        let mut state = self.state.lock();
        loop {
            if let Some(completion_code) = state.completion {
                return completion_code;
            }
            let deadline = state.deadline;
            if Instant::now() >= deadline {
                state.completion = Some(code::TIMEOUT);
                self.completed.notify_all();
                return code::TIMEOUT;
            }
            let _ = self.completed.wait_until(&mut state, deadline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn deadline_in(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn ids_are_unique_and_nonzero() {
        let a = Transaction::new(0, AccessKind::Read, vec![0; 4], deadline_in(10));
        let b = Transaction::new(0, AccessKind::Read, vec![0; 4], deadline_in(10));
        assert_ne!(a.id(), 0);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn completes_exactly_once() {
        let tran = Transaction::new(0, AccessKind::Write, vec![1, 2, 3, 4], deadline_in(100));
        tran.done(code::SIZE);
        tran.done(code::ADDRESS);
        assert_eq!(tran.wait(), code::SIZE);
        assert_eq!(tran.completion(), Some(code::SIZE));
    }

    #[test]
    fn times_out_to_timeout_code() {
        let tran = Transaction::new(0, AccessKind::Read, vec![0; 4], deadline_in(5));
        assert_eq!(tran.wait(), code::TIMEOUT);
        assert!(tran.expired());

        // A late response does not overwrite the timeout.
        tran.done(code::OK);
        assert_eq!(tran.completion(), Some(code::TIMEOUT));
    }

    #[test]
    fn wakes_a_blocked_waiter() {
        let tran = Transaction::new(0, AccessKind::Read, vec![0; 8], deadline_in(5000));
        let waiter = {
            let tran = tran.clone();
            thread::spawn(move || tran.wait())
        };

        tran.data().copy_from_slice(&[7u8; 8]);
        tran.done(code::OK);
        assert_eq!(waiter.join().unwrap(), code::OK);
        assert_eq!(&*tran.data(), &[7u8; 8]);
    }
}
