//! Memory slave contract and the in-flight transaction table.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::code;
use crate::transaction::Transaction;

/// Endpoint servicing memory transactions.
///
/// `min_access` is the required alignment of both address and size;
/// `max_access` bounds a single transaction. The default `do_transaction`
/// declines every access.
pub trait MemorySlave: Send + Sync {
    /// Required alignment of address and size, in bytes.
    fn min_access(&self) -> u32;

    /// Largest transaction accepted, in bytes.
    fn max_access(&self) -> u32;

    /// Base address this slave responds at.
    fn address_offset(&self) -> u64 {
        0
    }

    /// Service one transaction.
    ///
    /// Must eventually complete the transaction exactly once; the default
    /// completes immediately with `Unsupported`.
    fn do_transaction(&self, transaction: &Arc<Transaction>) {
        transaction.done(code::UNSUPPORTED);
    }
}

/// Weak-reference map from transaction id to in-flight transaction.
///
/// Responses arriving off the wire are routed by id; entries whose
/// transaction was dropped upgrade to nothing and are pruned lazily.
#[derive(Default)]
pub struct InflightTable {
    entries: Mutex<HashMap<u32, Weak<Transaction>>>,
}

impl InflightTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transaction under its id.
    pub fn add(&self, transaction: &Arc<Transaction>) {
        self.entries.lock().insert(transaction.id(), Arc::downgrade(transaction));
    }

    /// Look up a live transaction, pruning the entry if it is gone.
    pub fn get(&self, id: u32) -> Option<Arc<Transaction>> {
        let mut entries = self.entries.lock();
        match entries.get(&id).and_then(Weak::upgrade) {
            Some(transaction) => Some(transaction),
            None => {
                entries.remove(&id);
                None
            },
        }
    }

    /// Remove one entry and sweep any dead neighbours.
    pub fn remove(&self, id: u32) {
        let mut entries = self.entries.lock();
        entries.remove(&id);
        entries.retain(|_, weak| weak.strong_count() > 0);
    }

    /// Entries currently registered, dead or alive.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::AccessKind;
    use std::time::{Duration, Instant};

    struct DefaultSlave;
    impl MemorySlave for DefaultSlave {
        fn min_access(&self) -> u32 {
            4
        }
        fn max_access(&self) -> u32 {
            4096
        }
    }

    fn tran() -> Arc<Transaction> {
        Transaction::new(0, AccessKind::Read, vec![0; 4], Instant::now() + Duration::from_secs(1))
    }

    #[test]
    fn default_slave_declines() {
        let transaction = tran();
        DefaultSlave.do_transaction(&transaction);
        assert_eq!(transaction.completion(), Some(code::UNSUPPORTED));
    }

    #[test]
    fn lookup_routes_by_id() {
        let table = InflightTable::new();
        let transaction = tran();
        table.add(&transaction);

        let found = table.get(transaction.id()).unwrap();
        assert_eq!(found.id(), transaction.id());
        assert!(table.get(transaction.id() + 1).is_none());
    }

    #[test]
    fn dropped_transactions_are_pruned() {
        let table = InflightTable::new();
        let transaction = tran();
        let id = transaction.id();
        table.add(&transaction);
        drop(transaction);

        assert!(table.get(id).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn remove_sweeps_dead_entries() {
        let table = InflightTable::new();
        let keep = tran();
        let dead = tran();
        let dead_id = dead.id();
        table.add(&keep);
        table.add(&dead);
        drop(dead);

        table.remove(dead_id);
        assert_eq!(table.len(), 1);
        assert!(table.get(keep.id()).is_some());
    }
}
