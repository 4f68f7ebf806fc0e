//! # Buckets
//!
//! A bucket is a named B+tree. This module has two halves:
//!
//! - [`BucketIndex`]: the in-memory mirror of the bucket-index page, a
//!   flat mapping from bucket name to the root page id of its tree. It is
//!   rewritten in full to a freshly allocated page by any commit that
//!   changed it.
//! - [`Bucket`] / [`BucketMut`]: the per-transaction surfaces that
//!   resolve a name to its root once and then serve `get`, `put`,
//!   `delete`, and cursor creation against that root.
//!
//! ## Bucket-Index Page Layout
//!
//! ```text
//! Header (count = number of buckets), then per bucket:
//!   name_len: u64 | name bytes | auto_id: u64 (always 0) | root: u64
//! ```
//!
//! Entries are written in ascending name order so the page bytes are
//! deterministic. The `auto_id` word is reserved for a future sequence
//! counter and is ignored on read.

use hashbrown::HashMap;
use log::warn;

use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::storage::{PageFlag, PageHeader, Pgid, PAGE_HEADER_SIZE};
use crate::tx::Tx;

/// In-memory mapping from bucket name to B+tree root page id.
#[derive(Debug, Default)]
pub(crate) struct BucketIndex {
    buckets: HashMap<String, Pgid>,
    dirty: bool,
}

impl BucketIndex {
    pub fn read(page: &[u8]) -> Self {
        let header = PageHeader::from_bytes(page);
        assert!(
            header.is_bucket_index(),
            "page {} is not a bucket-index page",
            header.id()
        );

        let mut buckets = HashMap::new();
        let mut offset = PAGE_HEADER_SIZE;
        for _ in 0..header.count() {
            let name_len = read_u64(page, offset) as usize;
            offset += 8;
            let name = String::from_utf8_lossy(&page[offset..offset + name_len]).into_owned();
            offset += name_len;
            let _auto_id = read_u64(page, offset);
            offset += 8;
            let root = read_u64(page, offset);
            offset += 8;

            let previous = buckets.insert(name, root);
            assert!(previous.is_none(), "duplicate bucket name in index page");
        }

        Self {
            buckets,
            dirty: false,
        }
    }

    /// Serializes into a page buffer whose header id and overflow were
    /// already set by the allocator.
    pub fn write_into(&self, page: &mut [u8]) {
        let header = PageHeader::from_bytes_mut(page);
        header.set_flags(PageFlag::BucketIndex);
        header.set_count(self.buckets.len() as u64);

        let mut names: Vec<&String> = self.buckets.keys().collect();
        names.sort_unstable();

        let mut offset = PAGE_HEADER_SIZE;
        for name in names {
            let root = self.buckets[name];
            write_u64(page, offset, name.len() as u64);
            offset += 8;
            page[offset..offset + name.len()].copy_from_slice(name.as_bytes());
            offset += name.len();
            write_u64(page, offset, 0); // auto_id, reserved
            offset += 8;
            write_u64(page, offset, root);
            offset += 8;
        }
    }

    pub fn serialized_size(&self) -> usize {
        PAGE_HEADER_SIZE
            + self
                .buckets
                .keys()
                .map(|name| 8 + name.len() + 8 + 8)
                .sum::<usize>()
    }

    pub fn pages_needed(&self, page_size: u64) -> u64 {
        self.serialized_size() as u64 / page_size + 1
    }

    pub fn get(&self, name: &str) -> Option<Pgid> {
        self.buckets.get(name).copied()
    }

    pub fn add(&mut self, name: &str, root: Pgid) -> Result<()> {
        if self.buckets.contains_key(name) {
            return Err(Error::BucketExists(name.to_string()));
        }
        self.buckets.insert(name.to_string(), root);
        self.dirty = true;
        Ok(())
    }

    /// Repoints the entry whose root is `old_root` at `new_root`. The
    /// spill pass calls this for every bucket whose tree moved.
    pub fn update_root(&mut self, old_root: Pgid, new_root: Pgid) {
        for root in self.buckets.values_mut() {
            if *root == old_root {
                *root = new_root;
                self.dirty = true;
                return;
            }
        }
        warn!("no bucket references root {}", old_root);
        debug_assert!(false, "no bucket references root {}", old_root);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

fn read_u64(page: &[u8], offset: usize) -> u64 {
    let bytes: [u8; 8] = page[offset..offset + 8]
        .try_into()
        .expect("slice has exactly 8 bytes");
    u64::from_le_bytes(bytes)
}

fn write_u64(page: &mut [u8], offset: usize, value: u64) {
    page[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Read surface of a bucket inside a transaction.
pub struct Bucket<'a, 'db> {
    tx: &'a Tx<'db>,
    root: Pgid,
}

impl<'a, 'db> Bucket<'a, 'db> {
    pub(crate) fn new(tx: &'a Tx<'db>, root: Pgid) -> Self {
        Self { tx, root }
    }

    pub(crate) fn root(&self) -> Pgid {
        self.root
    }

    /// Returns the value stored under `key`, or `None`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        get_impl(self.tx, self.root, key)
    }

    pub fn cursor(&self) -> Cursor<'a, 'db> {
        Cursor::new(self.tx, self.root)
    }
}

/// Write surface of a bucket inside a writable transaction.
pub struct BucketMut<'a, 'db> {
    tx: &'a mut Tx<'db>,
    root: Pgid,
}

impl<'a, 'db> BucketMut<'a, 'db> {
    pub(crate) fn new(tx: &'a mut Tx<'db>, root: Pgid) -> Self {
        Self { tx, root }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        get_impl(&*self.tx, self.root, key)
    }

    pub fn cursor(&self) -> Cursor<'_, 'db> {
        Cursor::new(&*self.tx, self.root)
    }

    /// Inserts or overwrites a key/value pair. The key must be non-empty
    /// and the value no larger than a quarter page.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::KeyEmpty);
        }
        let max = (self.tx.page_size() / 4) as usize;
        if value.len() > max {
            return Err(Error::ValueTooLarge {
                size: value.len(),
                max,
            });
        }

        let stack = {
            let mut cursor = Cursor::new(self.tx, self.root);
            cursor.seek(key)?;
            cursor.into_stack()
        };
        let leaf = self.tx.materialize_path(&stack);
        self.tx.cache_mut().node_mut(leaf).put(key, value.to_vec());
        Ok(())
    }

    /// Removes an exactly-matching key. Returns whether it was present.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        if key.is_empty() {
            return Err(Error::KeyEmpty);
        }

        let (stack, found) = {
            let mut cursor = Cursor::new(self.tx, self.root);
            let hit = cursor.seek(key)?;
            let found = matches!(hit, Some((ref k, _)) if k.as_slice() == key);
            (cursor.into_stack(), found)
        };
        if !found {
            return Ok(false);
        }

        let leaf = self.tx.materialize_path(&stack);
        Ok(self.tx.cache_mut().node_mut(leaf).del(key))
    }
}

fn get_impl(tx: &Tx<'_>, root: Pgid, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut cursor = Cursor::new(tx, root);
    Ok(cursor
        .seek(key)?
        .and_then(|(k, v)| (k == key).then_some(v)))
}
