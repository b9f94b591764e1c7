//! RAM-backed memory slave.
//!
//! Services every access type against lazily allocated 4 KiB pages.
//! Stands in for firmware registers in tests and loopback stacks, and
//! doubles as the far end of an SRP bridge pair.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::code;
use crate::slave::MemorySlave;
use crate::transaction::{AccessKind, Transaction};

const PAGE_SIZE: u64 = 0x1000;

/// Emulated memory space.
pub struct MemoryEmulator {
    min_access: u32,
    max_access: u32,
    pages: Mutex<HashMap<u64, Box<[u8]>>>,
}

impl MemoryEmulator {
    /// Create an emulator publishing the given access bounds.
    pub fn new(min_access: u32, max_access: u32) -> Arc<Self> {
        Arc::new(Self { min_access, max_access, pages: Mutex::new(HashMap::new()) })
    }

    /// Pages allocated so far.
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }
}

impl MemorySlave for MemoryEmulator {
    fn min_access(&self) -> u32 {
        self.min_access
    }

    fn max_access(&self) -> u32 {
        self.max_access
    }

    fn do_transaction(&self, transaction: &Arc<Transaction>) {
        let mut address = transaction.address();
        let mut data = transaction.data();
        let total = data.len();
        let mut offset = 0;

        let mut pages = self.pages.lock();
        while offset < total {
            let page_base = (address / PAGE_SIZE) * PAGE_SIZE;
            let page_off = (address % PAGE_SIZE) as usize;
            let chunk = (PAGE_SIZE as usize - page_off).min(total - offset);

            let page = pages
                .entry(page_base)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());

            match transaction.kind() {
                AccessKind::Write | AccessKind::Post => {
                    page[page_off..page_off + chunk]
                        .copy_from_slice(&data[offset..offset + chunk]);
                },
                AccessKind::Read | AccessKind::Verify => {
                    data[offset..offset + chunk]
                        .copy_from_slice(&page[page_off..page_off + chunk]);
                },
            }

            address += chunk as u64;
            offset += chunk;
        }
        drop(pages);
        drop(data);

        transaction.done(code::OK);
    }
}
