//! # Transactions
//!
//! A [`Tx`] is a consistent view of the database taken at begin. It owns
//! a *copy* of the authoritative meta page, the bucket index decoded
//! from that meta, and (for writers) the transaction cache that stages
//! every mutation. Read-only transactions are registered with the
//! database so the freelist knows which old pages are still reachable;
//! writable transactions hold the writer lock for their whole lifetime.
//!
//! ## Commit Protocol
//!
//! ```text
//! 1. Spill dirty nodes: split oversized ones, write each resulting
//!    node to a freshly allocated shadow page, rewrite parents, and
//!    quarantine every superseded page under this txid.
//! 2. If the bucket index changed, write it to a fresh page and point
//!    the tx meta at it (the old index page joins the quarantine).
//! 3. Write the freelist (free + pending) to a fresh page; point the
//!    tx meta at it; quarantine the previous freelist page.
//! 4. Flush all shadow pages in ascending page order; fsync.
//! 5. Write the meta to page `txid & 1` with a fresh checksum; fsync.
//! ```
//!
//! Step 5 is the atomic commit point. Everything before it only touches
//! page ids the previous committed tree does not reference, so a crash
//! anywhere in 1-4 leaves the old tree fully intact behind the old
//! meta. A failed commit discards the cache, returns any freelist runs
//! it drew, and drops its quarantine list: indistinguishable from a
//! rollback to every reader.
//!
//! ## Lifecycle
//!
//! `commit` and `rollback` consume the transaction. Dropping an
//! unfinished transaction rolls it back, mirroring the guard pattern
//! used elsewhere in this codebase for transactional state.

use log::{debug, trace};
use parking_lot::MutexGuard;

use crate::bucket::{Bucket, BucketIndex, BucketMut};
use crate::cursor::Frame;
use crate::db::DbInner;
use crate::error::{Error, Result};
use crate::node::{Node, NodeId};
use crate::storage::{Meta, PageHeader, Pgid, Txid, RESERVED_PAGE_COUNT};
use crate::txcache::{AllocContext, TxCache};

pub struct Tx<'db> {
    db: &'db DbInner,
    writable: bool,
    open: bool,
    meta: Meta,
    cache: TxCache,
    buckets: BucketIndex,
    /// Keeps the single-writer lock for the lifetime of a writable tx.
    _writer_guard: Option<MutexGuard<'db, ()>>,
}

impl<'db> Tx<'db> {
    pub(crate) fn new(
        db: &'db DbInner,
        writable: bool,
        meta: Meta,
        buckets: BucketIndex,
        writer_guard: Option<MutexGuard<'db, ()>>,
    ) -> Self {
        Self {
            db,
            writable,
            open: true,
            cache: TxCache::new(db.page_size),
            meta,
            buckets,
            _writer_guard: writer_guard,
        }
    }

    /// The transaction id: the snapshot's for readers, the snapshot's
    /// plus one for writers.
    pub fn id(&self) -> Txid {
        self.meta.txid()
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn db(&self) -> &'db DbInner {
        self.db
    }

    pub(crate) fn cache(&self) -> &TxCache {
        &self.cache
    }

    pub(crate) fn cache_mut(&mut self) -> &mut TxCache {
        &mut self.cache
    }

    pub(crate) fn page_size(&self) -> u64 {
        self.db.page_size
    }

    /// Read surface of a named bucket.
    pub fn bucket(&self, name: &str) -> Result<Bucket<'_, 'db>> {
        if !self.open {
            return Err(Error::TxClosed);
        }
        let root = self
            .buckets
            .get(name)
            .ok_or_else(|| Error::BucketNotFound(name.to_string()))?;
        Ok(Bucket::new(self, root))
    }

    /// Write surface of a named bucket.
    pub fn bucket_mut(&mut self, name: &str) -> Result<BucketMut<'_, 'db>> {
        if !self.open {
            return Err(Error::TxClosed);
        }
        if !self.writable {
            return Err(Error::NotWritable);
        }
        let root = self
            .buckets
            .get(name)
            .ok_or_else(|| Error::BucketNotFound(name.to_string()))?;
        Ok(BucketMut::new(self, root))
    }

    /// Creates an empty bucket. Its root starts as a fresh leaf staged in
    /// the transaction cache; commit rewrites it copy-on-write like any
    /// other dirty node.
    pub fn create_bucket(&mut self, name: &str) -> Result<()> {
        if !self.open {
            return Err(Error::TxClosed);
        }
        if !self.writable {
            return Err(Error::NotWritable);
        }
        if name.is_empty() {
            return Err(Error::BucketNameEmpty);
        }
        if self.buckets.get(name).is_some() {
            return Err(Error::BucketExists(name.to_string()));
        }

        let pgid = {
            let mut freelist = self.db.freelist.lock();
            let mut ctx = AllocContext {
                txid: self.meta.txid(),
                file: &self.db.file,
                mmap: &self.db.mmap,
                freelist: &mut freelist,
                meta: &mut self.meta,
            };
            self.cache.allocate(&mut ctx, 1)?
        };

        let mut root = Node::new_leaf();
        root.pgid = Some(pgid);
        root.write(self.cache.shadow_mut(pgid));
        self.cache.register(pgid, root);

        self.buckets.add(name, pgid)?;
        debug!("created bucket '{}' with root page {}", name, pgid);
        Ok(())
    }

    /// Materializes every level of a seek path into mutable nodes and
    /// returns the leaf, linking each node under its parent together
    /// with the key the parent uses for it.
    pub(crate) fn materialize_path(&mut self, stack: &[Frame]) -> NodeId {
        let mmap = self.db.mmap.read();
        let mut parent: Option<NodeId> = None;
        let mut parent_key: Option<Vec<u8>> = None;
        let mut leaf = None;

        for frame in stack {
            let nid = self.cache.node(&mmap, frame.pgid, parent, parent_key.take());
            let node = self.cache.node_ref(nid);
            if !node.is_leaf && frame.index < node.elements.len() {
                parent_key = Some(node.elements[frame.index].key.clone());
            }
            parent = Some(nid);
            leaf = Some(nid);
        }

        leaf.expect("a seek path always has at least the root frame")
    }

    /// Runs the commit protocol. Consumes the transaction; on failure the
    /// effect is a rollback and the on-disk state is the previous tree.
    pub fn commit(mut self) -> Result<()> {
        if !self.open {
            return Err(Error::TxClosed);
        }
        if !self.writable {
            return Err(Error::NotWritable);
        }
        self.open = false;

        let result = self.commit_inner();
        if result.is_err() {
            let mut freelist = self.db.freelist.lock();
            freelist.discard(self.meta.txid());
            self.cache.return_allocations(&mut freelist);
        }
        self.finish();
        result
    }

    fn commit_inner(&mut self) -> Result<()> {
        let txid = self.meta.txid();
        let page_size = self.db.page_size;
        debug!("committing tx {}", txid);

        {
            let mut freelist = self.db.freelist.lock();
            let mut ctx = AllocContext {
                txid,
                file: &self.db.file,
                mmap: &self.db.mmap,
                freelist: &mut freelist,
                meta: &mut self.meta,
            };

            self.cache.spill(&mut ctx, &mut self.buckets)?;

            if self.buckets.is_dirty() {
                let old = ctx.meta.buckets();
                if old >= RESERVED_PAGE_COUNT {
                    let overflow = {
                        let mmap = ctx.mmap.read();
                        PageHeader::from_bytes(mmap.page(old)).overflow()
                    };
                    ctx.freelist.free(txid, old, overflow);
                }
                let pages = self.buckets.pages_needed(page_size);
                let pgid = self.cache.allocate(&mut ctx, pages)?;
                self.buckets.write_into(self.cache.shadow_mut(pgid));
                ctx.meta.set_buckets(pgid);
                trace!("bucket index rewritten to page {}", pgid);
            }

            let old_freelist = ctx.meta.freelist();
            if old_freelist >= RESERVED_PAGE_COUNT {
                let overflow = {
                    let mmap = ctx.mmap.read();
                    PageHeader::from_bytes(mmap.page(old_freelist)).overflow()
                };
                ctx.freelist.free(txid, old_freelist, overflow);
            }
            let pages = ctx.freelist.pages_needed(page_size);
            let pgid = self.cache.allocate(&mut ctx, pages)?;
            ctx.freelist.write_into(self.cache.shadow_mut(pgid));
            ctx.meta.set_freelist(pgid);
            trace!("freelist rewritten to page {}", pgid);
        }

        self.cache.flush(&self.db.file)?;

        // The atomic commit point: the alternate meta page now points at
        // the new tree; a crash before this fsync keeps the old one.
        let meta_pgid: Pgid = txid & 1;
        let mut page = vec![0u8; page_size as usize];
        self.meta.write_to_page(&mut page, meta_pgid);
        self.db.file.write_page(meta_pgid, &page)?;
        self.db.file.sync()?;
        debug!("tx {} committed via meta page {}", txid, meta_pgid);

        Ok(())
    }

    /// Discards the transaction cache and all staged nodes. Releases no
    /// pages: nothing was freed and nothing committed.
    pub fn rollback(mut self) -> Result<()> {
        if !self.open {
            return Err(Error::TxClosed);
        }
        self.rollback_inner();
        Ok(())
    }

    fn rollback_inner(&mut self) {
        debug!("rolling back tx {}", self.meta.txid());
        self.open = false;
        if self.writable {
            let mut freelist = self.db.freelist.lock();
            self.cache.return_allocations(&mut freelist);
        }
        self.finish();
    }

    /// Deregisters the transaction from the database. Idempotence is
    /// guaranteed by the `open` flag in the callers.
    fn finish(&mut self) {
        if !self.writable {
            let mut state = self.db.state.lock();
            if let Some(pos) = state.readers.iter().position(|t| *t == self.meta.txid()) {
                state.readers.swap_remove(pos);
            }
            let mut stats = self.db.stats.lock();
            stats.open_tx_count = state.readers.len() as u64;
        }
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if self.open {
            self.rollback_inner();
        }
    }
}
