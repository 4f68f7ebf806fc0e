//! # Memory-Mapped Read View
//!
//! This module implements `MmapRegion`, the read-only mapped view of all
//! committed pages. Every reader resolves page addresses through it; the
//! writer bypasses it entirely and writes through the file descriptor, so
//! the map never observes a half-written tree: by the time a meta page
//! referencing new pages is readable, those pages are already durable.
//!
//! ## Growth Policy
//!
//! The mapped window usually exceeds the file. It grows in powers of two
//! from 32KB up to 1GiB, then in whole-GiB increments, always rounded up
//! to a page-size multiple. Mapping past EOF is fine on every platform we
//! target: only committed pages, which are inside the file, are ever
//! dereferenced.
//!
//! Remapping replaces the window wholesale, which invalidates every
//! outstanding pointer into the old one. The database serializes remaps
//! behind its mmap lock, and readers hold page slices only for the span of
//! a single descent, never across a suspension point.
//!
//! ## Access Pattern
//!
//! B+tree descents touch pages scattered across the file, so the region
//! advises `MADV_RANDOM` to keep the kernel from read-ahead thrashing.

use std::fs::File;

use log::debug;
use memmap2::{Advice, Mmap, MmapOptions};

use super::{PageHeader, Pgid};
use crate::error::{Error, Result};

/// Hard ceiling on the mapped window. Growing past this fails allocation
/// rather than the map call.
pub const MAX_MMAP_SIZE: u64 = 1 << 48;

const GIB: u64 = 1 << 30;

#[derive(Debug)]
pub struct MmapRegion {
    map: Mmap,
    size: u64,
    page_size: u64,
}

impl MmapRegion {
    /// Maps the file with a window of at least `min_size` bytes (and at
    /// least the current file size), rounded up by the growth policy.
    pub fn map(file: &File, page_size: u64, min_size: u64) -> Result<Self> {
        let file_size = file
            .metadata()
            .map_err(|e| Error::io("stat", e))?
            .len();
        let size = mmap_size(min_size.max(file_size), page_size)?;
        debug!("mapping {} bytes (file is {} bytes)", size, file_size);

        // SAFETY: mapping a file is unsafe because external modification of
        // the underlying file would be undefined behavior. This is safe
        // because:
        // 1. The file is held under an exclusive advisory lock for the
        //    lifetime of the handle, so no other process writes it.
        // 2. The single in-process writer only writes page ids outside the
        //    committed tree; readers only dereference committed pages.
        // 3. The map is replaced, never resized in place, and the database
        //    serializes replacement behind its mmap lock.
        let map = unsafe {
            MmapOptions::new()
                .len(size as usize)
                .map(file)
                .map_err(|e| Error::io("mmap", e))?
        };

        map.advise(Advice::Random)
            .map_err(|e| Error::io("madvise", e))?;

        Ok(Self {
            map,
            size,
            page_size,
        })
    }

    /// Replaces the window with one covering at least `min_size` bytes.
    /// Invalidates every slice handed out by the previous window.
    pub fn remap(&mut self, file: &File, min_size: u64) -> Result<()> {
        debug!("remapping to cover at least {} bytes", min_size);
        *self = Self::map(file, self.page_size, min_size)?;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Borrows a single page. Panics when the page lies outside the mapped
    /// window; allocation keeps the window ahead of the watermark.
    pub fn page(&self, pgid: Pgid) -> &[u8] {
        let start = pgid * self.page_size;
        assert!(
            start + self.page_size <= self.size,
            "page {} outside mapped window of {} bytes",
            pgid,
            self.size
        );
        &self.map[start as usize..(start + self.page_size) as usize]
    }

    /// Borrows a page together with its overflow run, as recorded in the
    /// page header.
    pub fn page_with_overflow(&self, pgid: Pgid) -> &[u8] {
        let overflow = PageHeader::from_bytes(self.page(pgid)).overflow();
        let start = pgid * self.page_size;
        let len = (1 + overflow) * self.page_size;
        assert!(
            start + len <= self.size,
            "page {} overflow run of {} pages outside mapped window",
            pgid,
            1 + overflow
        );
        &self.map[start as usize..(start + len) as usize]
    }
}

/// Rounds a requested size up per the growth policy: powers of two below
/// 1GiB, whole GiB steps above, always a multiple of the page size.
fn mmap_size(request: u64, page_size: u64) -> Result<u64> {
    if request <= GIB {
        for shift in 15..=30 {
            if request <= 1 << shift {
                return Ok(1 << shift);
            }
        }
    }

    if request > MAX_MMAP_SIZE {
        return Err(Error::AllocFailed { max: MAX_MMAP_SIZE });
    }

    let mut size = request;
    let remainder = request % GIB;
    if remainder > 0 {
        size += GIB - remainder;
    }
    if size % page_size != 0 {
        size = (size / page_size + 1) * page_size;
    }
    if size > MAX_MMAP_SIZE {
        return Err(Error::AllocFailed { max: MAX_MMAP_SIZE });
    }
    Ok(size)
}
