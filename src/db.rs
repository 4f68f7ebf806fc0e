//! # Database Handle
//!
//! This module provides the process-level handle: it owns the file
//! descriptor and its exclusive lock, the read-only map, the freelist,
//! and the registry of live transactions. The handle orchestrates; the
//! interesting machinery lives in the transaction and storage layers.
//!
//! ## Open Sequence
//!
//! ```text
//! 1. Open + exclusively lock the file (fails if another process holds it).
//! 2. Empty file: lay down pages 0..4 (two metas, freelist, bucket index)
//!    and fsync. Existing file: bootstrap the page size out of meta 0.
//! 3. Map the file read-only, MADV_RANDOM.
//! 4. Pick the authoritative meta: the one with the larger txid whose
//!    checksum validates; fall back to the other; fail Validation when
//!    neither holds. A torn final commit thus falls back to the last
//!    complete one.
//! 5. Load the freelist from the page the meta names.
//! ```
//!
//! ## Locks
//!
//! Acquired in this order, never inverted:
//!
//! | lock    | protects                                   |
//! |---------|--------------------------------------------|
//! | writer  | single-writer exclusion, begin to tx end   |
//! | state   | meta snapshot, tx registry, open flag      |
//! | mmap    | window replacement during grow             |
//! | stats   | counters                                   |
//!
//! ## Reader Registry and Page Reuse
//!
//! Read transactions record their snapshot txid in the registry. When a
//! writer begins, every freelist pending list older than the oldest
//! live reader is released for reuse; a page freed by commit T is
//! therefore never handed out while a reader that began before T is
//! still walking the old tree.

use std::path::Path;

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::bucket::BucketIndex;
use crate::error::{Error, Result};
use crate::storage::{
    os_page_size, BranchPage, DbFile, Freelist, LeafPage, Meta, MmapRegion, PageFlag, PageHeader,
    Pgid, Txid, EVEN_META_PAGE_ID, INIT_BUCKET_PAGE_ID, INIT_FREELIST_PAGE_ID, META_SIZE,
    ODD_META_PAGE_ID, PAGE_HEADER_SIZE,
};
use crate::tx::Tx;

/// Counters kept under the stats lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Total read transactions begun over the handle's lifetime.
    pub tx_count: u64,
    /// Read transactions currently open.
    pub open_tx_count: u64,
}

pub(crate) struct DbState {
    pub opened: bool,
    /// Snapshot txids of live read transactions.
    pub readers: Vec<Txid>,
}

pub(crate) struct DbInner {
    pub file: DbFile,
    pub page_size: u64,
    pub mmap: RwLock<MmapRegion>,
    pub freelist: Mutex<Freelist>,
    pub state: Mutex<DbState>,
    pub writer: Mutex<()>,
    pub stats: Mutex<Stats>,
}

pub struct Db {
    inner: DbInner,
}

impl Db {
    /// Opens the database at `path`, creating and initializing the file
    /// when it does not exist or is empty.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = DbFile::open(path)?;
        let size = file.size()?;

        let page_size = if size == 0 {
            os_page_size()
        } else {
            bootstrap_page_size(&file)?
        };
        file.set_page_size(page_size);

        if size == 0 {
            init_file(&file, page_size)?;
        }

        let mmap = MmapRegion::map(file.file(), page_size, 0)?;
        let meta = current_meta(&mmap)?;
        debug!("opened with {}", meta);
        if meta.page_size() != page_size {
            return Err(Error::Validation);
        }

        let freelist = Freelist::read(mmap.page_with_overflow(meta.freelist()));

        Ok(Self {
            inner: DbInner {
                file,
                page_size,
                mmap: RwLock::new(mmap),
                freelist: Mutex::new(freelist),
                state: Mutex::new(DbState {
                    opened: true,
                    readers: Vec::new(),
                }),
                writer: Mutex::new(()),
                stats: Mutex::new(Stats::default()),
            },
        })
    }

    pub fn path(&self) -> &Path {
        self.inner.file.path()
    }

    pub fn page_size(&self) -> u64 {
        self.inner.page_size
    }

    pub fn stats(&self) -> Stats {
        *self.inner.stats.lock()
    }

    /// Marks the handle closed. Subsequent `begin` calls fail `NotOpen`;
    /// the file lock is released when the handle drops.
    pub fn close(&self) {
        debug!("closing database");
        self.inner.state.lock().opened = false;
    }

    /// Begins a transaction. A writable transaction holds the writer
    /// lock until commit or rollback; read-only transactions are
    /// registered so the freelist can quarantine pages they may still
    /// reach.
    pub fn begin(&self, writable: bool) -> Result<Tx<'_>> {
        let writer_guard = if writable {
            Some(self.inner.writer.lock())
        } else {
            None
        };

        let mut state = self.inner.state.lock();
        if !state.opened {
            return Err(Error::NotOpen);
        }

        let mut meta = current_meta(&self.inner.mmap.read())?;

        if writable {
            meta.increment_txid();
            // Quarantined pages from commits no live reader predates are
            // fair game again.
            let min_reader = state.readers.iter().copied().min().unwrap_or(meta.txid());
            self.inner.freelist.lock().release_before(min_reader);
            debug!("begin rw tx {}", meta.txid());
        } else {
            state.readers.push(meta.txid());
            let mut stats = self.inner.stats.lock();
            stats.tx_count += 1;
            stats.open_tx_count = state.readers.len() as u64;
            debug!("begin read tx {}", meta.txid());
        }
        drop(state);

        let buckets = {
            let mmap = self.inner.mmap.read();
            BucketIndex::read(mmap.page_with_overflow(meta.buckets()))
        };

        Ok(Tx::new(&self.inner, writable, meta, buckets, writer_guard))
    }

    /// Runs `f` inside a writable transaction, committing on success and
    /// rolling back on error.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Tx<'_>) -> Result<()>,
    {
        let mut tx = self.begin(true)?;
        match f(&mut tx) {
            Ok(()) => tx.commit(),
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }

    /// Runs `f` inside a read-only transaction.
    pub fn view<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Tx<'_>) -> Result<()>,
    {
        let tx = self.begin(false)?;
        let result = f(&tx);
        tx.rollback()?;
        result
    }

    /// Renders every page of a bucket's tree by recursive page-id
    /// traversal. Debug aid behind the shell's `scan` command.
    pub fn debug_bucket_pages(&self, name: &str) -> Result<String> {
        let tx = self.begin(false)?;
        let root = tx.bucket(name)?.root();

        let mut out = String::new();
        {
            let mmap = self.inner.mmap.read();
            render_page(&mmap, root, 0, &mut out);
        }
        tx.rollback()?;
        Ok(out)
    }
}

fn render_page(mmap: &MmapRegion, pgid: Pgid, depth: usize, out: &mut String) {
    use std::fmt::Write as _;

    let page = mmap.page_with_overflow(pgid);
    let header = PageHeader::from_bytes(page);
    let indent = "  ".repeat(depth);

    if header.is_leaf() {
        let _ = writeln!(out, "{}LeafPage {}: {}", indent, pgid, LeafPage::from_page(page));
    } else if header.is_branch() {
        let branch = BranchPage::from_page(page);
        let _ = writeln!(out, "{}BranchPage {}: {}", indent, pgid, branch);
        for i in 0..branch.count() {
            render_page(mmap, branch.child(i), depth + 1, out);
        }
    } else {
        let _ = writeln!(out, "{}Unknown page type for pgid {}", indent, pgid);
    }
}

/// Reads the page size out of meta 0 before any page arithmetic is
/// possible. Falls back to the OS page size when meta 0 is torn; meta
/// selection decides trustworthiness afterwards.
fn bootstrap_page_size(file: &DbFile) -> Result<u64> {
    let mut buf = vec![0u8; PAGE_HEADER_SIZE + META_SIZE];
    file.read_at(0, &mut buf)?;
    let meta = Meta::read_from_page(&buf);
    if meta.validate() {
        Ok(meta.page_size())
    } else {
        warn!("meta 0 failed validation during bootstrap, assuming OS page size");
        Ok(os_page_size())
    }
}

/// Lays down the four reserved pages of a fresh database file.
fn init_file(file: &DbFile, page_size: u64) -> Result<()> {
    debug!("initializing new database file, page size {}", page_size);

    let mut page = vec![0u8; page_size as usize];
    Meta::new(page_size, 0).write_to_page(&mut page, EVEN_META_PAGE_ID);
    file.write_page(EVEN_META_PAGE_ID, &page)?;

    let mut page = vec![0u8; page_size as usize];
    Meta::new(page_size, 1).write_to_page(&mut page, ODD_META_PAGE_ID);
    file.write_page(ODD_META_PAGE_ID, &page)?;

    let mut page = vec![0u8; page_size as usize];
    PageHeader::new(INIT_FREELIST_PAGE_ID, PageFlag::Freelist).write_to(&mut page);
    file.write_page(INIT_FREELIST_PAGE_ID, &page)?;

    let mut page = vec![0u8; page_size as usize];
    PageHeader::new(INIT_BUCKET_PAGE_ID, PageFlag::BucketIndex).write_to(&mut page);
    file.write_page(INIT_BUCKET_PAGE_ID, &page)?;

    file.sync()
}

/// Picks the authoritative meta: larger txid first, falling back to the
/// other copy, erroring when neither validates.
fn current_meta(mmap: &MmapRegion) -> Result<Meta> {
    let even = Meta::read_from_page(mmap.page(EVEN_META_PAGE_ID));
    let odd = Meta::read_from_page(mmap.page(ODD_META_PAGE_ID));

    let (lower, higher) = if odd.txid() < even.txid() {
        (odd, even)
    } else {
        (even, odd)
    };

    if higher.validate() {
        Ok(higher)
    } else if lower.validate() {
        warn!(
            "meta with txid {} failed validation, falling back to txid {}",
            higher.txid(),
            lower.txid()
        );
        Ok(lower)
    } else {
        Err(Error::Validation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RESERVED_PAGE_COUNT;

    fn open_temp() -> (tempfile::TempDir, Db) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn fresh_file_has_four_reserved_pages() {
        let (_dir, db) = open_temp();
        let page_size = db.page_size();

        assert_eq!(db.inner.file.size().unwrap(), RESERVED_PAGE_COUNT * page_size);

        let mmap = db.inner.mmap.read();
        let meta0 = Meta::read_from_page(mmap.page(0));
        let meta1 = Meta::read_from_page(mmap.page(1));
        assert!(meta0.validate());
        assert!(meta1.validate());
        assert_eq!(meta0.txid(), 0);
        assert_eq!(meta1.txid(), 1);
        assert_eq!(meta0.watermark(), RESERVED_PAGE_COUNT);

        let freelist_header = PageHeader::from_bytes(mmap.page(2));
        assert!(freelist_header.is_freelist());
        assert_eq!(freelist_header.count(), 0);

        let bucket_header = PageHeader::from_bytes(mmap.page(3));
        assert!(bucket_header.is_bucket_index());
        assert_eq!(bucket_header.count(), 0);
    }

    #[test]
    fn current_meta_picks_larger_valid_txid() {
        let (_dir, db) = open_temp();

        let meta = current_meta(&db.inner.mmap.read()).unwrap();

        assert_eq!(meta.txid(), 1);
    }

    #[test]
    fn current_meta_falls_back_when_higher_is_torn() {
        let (_dir, db) = open_temp();
        let page_size = db.inner.page_size;

        // Corrupt the odd (higher-txid) meta on disk.
        let mut page = vec![0u8; page_size as usize];
        db.inner.file.read_at(page_size, &mut page).unwrap();
        page[PAGE_HEADER_SIZE + 20] ^= 0xFF;
        db.inner.file.write_page(1, &page).unwrap();
        db.inner.file.sync().unwrap();

        let mmap = MmapRegion::map(db.inner.file.file(), page_size, 0).unwrap();
        let meta = current_meta(&mmap).unwrap();

        assert_eq!(meta.txid(), 0);
    }

    #[test]
    fn current_meta_errors_when_both_are_torn() {
        let (_dir, db) = open_temp();
        let page_size = db.inner.page_size;

        for pgid in [0u64, 1] {
            let mut page = vec![0u8; page_size as usize];
            db.inner
                .file
                .read_at(pgid * page_size, &mut page)
                .unwrap();
            page[PAGE_HEADER_SIZE + 20] ^= 0xFF;
            db.inner.file.write_page(pgid, &page).unwrap();
        }
        db.inner.file.sync().unwrap();

        let mmap = MmapRegion::map(db.inner.file.file(), page_size, 0).unwrap();
        let result = current_meta(&mmap);

        assert!(matches!(result, Err(Error::Validation)));
    }

    #[test]
    fn begin_after_close_fails_not_open() {
        let (_dir, db) = open_temp();

        db.close();

        assert!(matches!(db.begin(false), Err(Error::NotOpen)));
        assert!(matches!(db.begin(true), Err(Error::NotOpen)));
    }

    #[test]
    fn read_transactions_are_counted() {
        let (_dir, db) = open_temp();

        {
            let tx1 = db.begin(false).unwrap();
            let tx2 = db.begin(false).unwrap();
            assert_eq!(db.stats().open_tx_count, 2);
            tx1.rollback().unwrap();
            tx2.rollback().unwrap();
        }

        let stats = db.stats();
        assert_eq!(stats.tx_count, 2);
        assert_eq!(stats.open_tx_count, 0);
    }

    #[test]
    fn dropping_a_read_tx_deregisters_it() {
        let (_dir, db) = open_temp();

        {
            let _tx = db.begin(false).unwrap();
            assert_eq!(db.stats().open_tx_count, 1);
        }

        assert_eq!(db.stats().open_tx_count, 0);
    }

    #[test]
    fn writable_tx_increments_snapshot_txid() {
        let (_dir, db) = open_temp();

        let tx = db.begin(true).unwrap();

        assert_eq!(tx.id(), 2);
        tx.rollback().unwrap();
    }

    #[test]
    fn update_rolls_back_on_closure_error() {
        let (_dir, db) = open_temp();

        let result = db.update(|tx| {
            tx.create_bucket("doomed")?;
            Err(Error::KeyEmpty)
        });

        assert!(matches!(result, Err(Error::KeyEmpty)));
        let tx = db.begin(false).unwrap();
        assert!(matches!(
            tx.bucket("doomed"),
            Err(Error::BucketNotFound(_))
        ));
    }
}
