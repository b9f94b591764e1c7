//! Memory master: issues transactions and waits on their completions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::MemoryError;
use crate::slave::MemorySlave;
use crate::transaction::{AccessKind, Transaction};

/// Default per-transaction timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Issuing side of the memory fabric.
///
/// `req_transaction` never blocks: it registers the transaction, hands it
/// to the slave and returns its id. Blocking happens in
/// [`MemoryMaster::wait_transaction`], bounded by the per-master timeout
/// stamped on each transaction's deadline.
pub struct MemoryMaster {
    slave: Arc<dyn MemorySlave>,
    pending: Mutex<HashMap<u32, Arc<Transaction>>>,
    timeout: Mutex<Duration>,
    error: Mutex<u32>,
}

impl MemoryMaster {
    /// Create a master issuing to `slave`.
    pub fn new(slave: Arc<dyn MemorySlave>) -> Self {
        Self {
            slave,
            pending: Mutex::new(HashMap::new()),
            timeout: Mutex::new(DEFAULT_TIMEOUT),
            error: Mutex::new(0),
        }
    }

    /// Slave alignment requirement passthrough.
    pub fn min_access(&self) -> u32 {
        self.slave.min_access()
    }

    /// Slave size bound passthrough.
    pub fn max_access(&self) -> u32 {
        self.slave.max_access()
    }

    /// Slave base address passthrough.
    pub fn address_offset(&self) -> u64 {
        self.slave.address_offset()
    }

    /// Replace the per-transaction timeout.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = timeout;
    }

    /// Sticky aggregate error; first nonzero completion observed.
    pub fn error(&self) -> u32 {
        *self.error.lock()
    }

    /// Clear or force the aggregate error.
    pub fn set_error(&self, value: u32) {
        *self.error.lock() = value;
    }

    /// Issue a transaction over `data` (write payload, or a response
    /// window for reads) and return its id. Does not block.
    pub fn req_transaction(&self, address: u64, data: Vec<u8>, kind: AccessKind) -> u32 {
        let timeout = *self.timeout.lock();
        let transaction = Transaction::new(address, kind, data, Instant::now() + timeout);
        let id = transaction.id();

        self.pending.lock().insert(id, transaction.clone());

        tracing::debug!(id, address, kind = ?kind, size = transaction.size(), "request transaction");
        self.slave.do_transaction(&transaction);
        transaction.refresh_deadline(timeout);
        id
    }

    /// Wait for one transaction (or all in flight when `id` is zero).
    ///
    /// Returns the completion code of the requested transaction, or the
    /// first nonzero code among the waited set. Codes also latch into the
    /// master's sticky [`MemoryMaster::error`].
    pub fn wait_transaction(&self, id: u32) -> u32 {
        let mut first_error = 0;
        loop {
            let transaction = {
                let mut pending = self.pending.lock();
                let key = if id != 0 {
                    id
                } else {
                    match pending.keys().next() {
                        Some(&key) => key,
                        None => break,
                    }
                };
                match pending.remove(&key) {
                    Some(transaction) => transaction,
                    None => break,
                }
            };

            let completion_code = transaction.wait();
            if completion_code != 0 {
                let mut error = self.error.lock();
                if *error == 0 {
                    *error = completion_code;
                }
                if first_error == 0 {
                    first_error = completion_code;
                }
            }
            if id != 0 {
                return completion_code;
            }
        }
        first_error
    }

    /// Take a still-pending transaction handle by id.
    pub fn transaction(&self, id: u32) -> Option<Arc<Transaction>> {
        self.pending.lock().get(&id).cloned()
    }

    /// Blocking read into `dst`.
    pub fn read(&self, address: u64, dst: &mut [u8]) -> Result<(), MemoryError> {
        let id = self.req_transaction(address, vec![0u8; dst.len()], AccessKind::Read);
        let transaction = self.transaction(id);
        let completion_code = self.wait_transaction(id);
        MemoryError::check(completion_code)?;
        if let Some(transaction) = transaction {
            dst.copy_from_slice(&transaction.data());
        }
        Ok(())
    }

    /// Blocking write of `src`.
    pub fn write(&self, address: u64, src: &[u8]) -> Result<(), MemoryError> {
        let id = self.req_transaction(address, src.to_vec(), AccessKind::Write);
        MemoryError::check(self.wait_transaction(id))
    }

    /// Posted write of `src`; completes as soon as it is on the wire.
    pub fn post(&self, address: u64, src: &[u8]) -> Result<(), MemoryError> {
        let id = self.req_transaction(address, src.to_vec(), AccessKind::Post);
        MemoryError::check(self.wait_transaction(id))
    }

    /// Verify readback against `expect`.
    pub fn verify(&self, address: u64, expect: &[u8]) -> Result<(), MemoryError> {
        let id = self.req_transaction(address, vec![0u8; expect.len()], AccessKind::Verify);
        let transaction = self.transaction(id);
        MemoryError::check(self.wait_transaction(id))?;
        match transaction {
            Some(transaction) if *transaction.data() == expect => Ok(()),
            _ => Err(MemoryError::Verify),
        }
    }
}
