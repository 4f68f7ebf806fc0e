//! # Database File I/O
//!
//! This module owns the writer side of the storage layer: the file
//! descriptor, the exclusive advisory lock, positioned page writes, and
//! fsync. Reads never come through here in steady state; they go through
//! the read-only map in [`super::MmapRegion`]. Keeping the two paths
//! separate is what makes committed pages immutable on disk: the writer
//! only ever appends or overwrites pages it freshly allocated, then
//! swings the meta page.
//!
//! ## Locking
//!
//! Opening acquires an exclusive advisory whole-file lock. A second
//! process opening the same database fails immediately rather than
//! corrupting it; the kernel drops the lock when the process dies, so a
//! crashed owner never wedges the file.
//!
//! ## Durability
//!
//! `sync()` maps to `fsync(2)`. The commit protocol calls it twice: once
//! after the data pages, once after the meta page. The second call is the
//! atomic commit point.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt as _;
use std::path::{Path, PathBuf};

use fs2::FileExt as _;
use log::debug;

use super::{Pgid, DEFAULT_PAGE_SIZE};
use crate::error::{Error, Result};

/// Queries the OS page size, falling back to 4096 when unavailable.
pub fn os_page_size() -> u64 {
    // SAFETY: sysconf has no preconditions; it returns -1 on failure.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
    if sz <= 0 {
        DEFAULT_PAGE_SIZE
    } else {
        sz as u64
    }
}

/// The database file: descriptor, path, and the page size used for
/// positioned writes.
#[derive(Debug)]
pub struct DbFile {
    file: File,
    path: PathBuf,
    page_size: u64,
}

impl DbFile {
    /// Opens (creating if absent) and exclusively locks the database file.
    ///
    /// The page size starts at the platform default; on an existing file
    /// the opener bootstraps the real one out of meta 0 and fixes it up
    /// with [`DbFile::set_page_size`] before any page-addressed I/O.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("opening database file {}", path.display());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| Error::io("open", e))?;

        file.try_lock_exclusive().map_err(|e| Error::io("flock", e))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn set_page_size(&mut self, page_size: u64) {
        self.page_size = page_size;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn size(&self) -> Result<u64> {
        let meta = self.file.metadata().map_err(|e| Error::io("stat", e))?;
        Ok(meta.len())
    }

    /// Writes a page-aligned buffer (one page plus any overflow) at the
    /// position of `pgid`. The file grows as needed.
    pub fn write_page(&self, pgid: Pgid, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len() as u64 % self.page_size, 0);
        self.file
            .write_all_at(data, pgid * self.page_size)
            .map_err(|e| Error::io("write", e))
    }

    /// Reads raw bytes at an absolute offset. Used once at open to
    /// bootstrap the page size out of meta 0 before the map exists.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| Error::io("read", e))
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().map_err(|e| Error::io("fsync", e))
    }
}
