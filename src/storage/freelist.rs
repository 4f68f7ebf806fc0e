//! # Freelist Management
//!
//! This module tracks the page ids a committed tree no longer references
//! so the writer can recycle them instead of growing the file. Two pools
//! exist:
//!
//! - `ids`: pages free for immediate reuse, kept sorted ascending
//! - `pending[txid]`: pages freed by the commit with that txid, not yet
//!   reusable because a reader begun before that commit may still walk
//!   the tree that references them
//!
//! A pending list graduates into `ids` once every live reader with an
//! older snapshot has finished; the writer performs that release when it
//! begins.
//!
//! ## Persisted Form
//!
//! The freelist serializes as a Freelist page: the element count in the
//! page header, then the sorted union of both pools as packed u64 page
//! ids. Pending pages are included because a crash makes every reader
//! disappear, at which point they are simply free.
//!
//! ## Allocation
//!
//! `allocate(n)` scans `ids` for the first run of `n` strictly
//! consecutive pages, removes the run, and returns its starting id. Only
//! `ids` is eligible; pending pages are quarantined until released.

use hashbrown::HashMap;
use log::trace;

use super::{PageHeader, Pgid, Txid, PAGE_HEADER_SIZE, RESERVED_PAGE_COUNT};

#[derive(Debug, Default)]
pub struct Freelist {
    ids: Vec<Pgid>,
    pending: HashMap<Txid, Vec<Pgid>>,
}

impl Freelist {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sorted union of the free pool and every pending list.
    pub fn all(&self) -> Vec<Pgid> {
        let mut ids = self.ids.clone();
        for list in self.pending.values() {
            ids.extend_from_slice(list);
        }
        ids.sort_unstable();
        ids
    }

    pub fn free_count(&self) -> usize {
        self.ids.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Removes and returns the start of the first run of `count`
    /// consecutive free page ids, or `None` when no such run exists.
    pub fn allocate(&mut self, count: usize) -> Option<Pgid> {
        if count == 0 {
            return None;
        }

        let mut run = 0usize;
        let mut prev: Pgid = 0;
        for i in 0..self.ids.len() {
            let id = self.ids[i];
            if run == 0 || id != prev + 1 {
                run = 1;
            } else {
                run += 1;
            }
            if run == count {
                let start_index = i + 1 - count;
                let start = self.ids[start_index];
                debug_assert!(start >= RESERVED_PAGE_COUNT);
                self.ids.drain(start_index..=i);
                trace!("freelist allocated run of {} starting at {}", count, start);
                return Some(start);
            }
            prev = id;
        }
        None
    }

    /// Queues a page (and its overflow run) as freed by transaction
    /// `txid`. The pages stay unusable until [`Freelist::release`].
    pub fn free(&mut self, txid: Txid, pgid: Pgid, overflow: u64) {
        assert!(
            pgid >= RESERVED_PAGE_COUNT,
            "page {} is reserved and cannot be freed",
            pgid
        );
        let list = self.pending.entry(txid).or_default();
        for id in pgid..=pgid + overflow {
            list.push(id);
        }
        trace!(
            "freed pages {}..={} under txid {}",
            pgid,
            pgid + overflow,
            txid
        );
    }

    /// Merges the pending list of `txid` into the free pool.
    pub fn release(&mut self, txid: Txid) {
        if let Some(list) = self.pending.remove(&txid) {
            trace!("released {} pending pages of txid {}", list.len(), txid);
            self.ids.extend(list);
            self.ids.sort_unstable();
        }
    }

    /// Drops the pending list of `txid` without merging it. A failed
    /// commit calls this so its quarantined pages do not linger.
    pub fn discard(&mut self, txid: Txid) {
        self.pending.remove(&txid);
    }

    /// Puts a run back into the free pool. Rollback hands back runs the
    /// transaction had drawn but never committed.
    pub fn reinsert(&mut self, pgid: Pgid, count: u64) {
        for id in pgid..pgid + count {
            self.ids.push(id);
        }
        self.ids.sort_unstable();
    }

    /// Releases every pending list whose txid is strictly below `txid`.
    /// Called by the writer at begin with the minimum live reader txid.
    pub fn release_before(&mut self, txid: Txid) {
        let ready: Vec<Txid> = self
            .pending
            .keys()
            .copied()
            .filter(|t| *t < txid)
            .collect();
        for t in ready {
            self.release(t);
        }
    }

    /// Rebuilds the free pool from a Freelist page. Pending lists start
    /// empty: whoever freed those pages is gone after a reopen.
    pub fn read(page: &[u8]) -> Self {
        let header = PageHeader::from_bytes(page);
        assert!(
            header.is_freelist(),
            "page {} is not a freelist page",
            header.id()
        );

        let count = header.count() as usize;
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let start = PAGE_HEADER_SIZE + i * 8;
            let bytes: [u8; 8] = page[start..start + 8]
                .try_into()
                .expect("slice has exactly 8 bytes");
            ids.push(u64::from_le_bytes(bytes));
        }

        Self {
            ids,
            pending: HashMap::new(),
        }
    }

    /// Serializes the full pool (free plus pending) into a page buffer
    /// whose header id and overflow were already set by the allocator.
    pub fn write_into(&self, page: &mut [u8]) {
        let ids = self.all();

        let header = PageHeader::from_bytes_mut(page);
        header.set_flags(super::PageFlag::Freelist);
        header.set_count(ids.len() as u64);

        for (i, id) in ids.iter().enumerate() {
            let start = PAGE_HEADER_SIZE + i * 8;
            page[start..start + 8].copy_from_slice(&id.to_le_bytes());
        }
    }

    /// Number of pages the serialized form needs.
    pub fn pages_needed(&self, page_size: u64) -> u64 {
        let bytes = (PAGE_HEADER_SIZE + self.all().len() * 8) as u64;
        bytes / page_size + 1
    }
}
