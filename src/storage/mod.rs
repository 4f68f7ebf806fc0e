//! # Storage Module
//!
//! This module provides the foundational storage layer for CairnDB: the
//! on-disk page format, the memory-mapped read view, direct file I/O for
//! the writer, and the freelist that recycles pages.
//!
//! ## Single-File Layout
//!
//! A database is one file of fixed-size pages. The page size is the OS
//! page size at creation time and is recorded in the meta pages; it never
//! changes afterwards.
//!
//! ```text
//! Page 0   Meta (even)     ─┐ double-buffered roots of trust;
//! Page 1   Meta (odd)      ─┘ commits alternate between them
//! Page 2   Freelist        initial, superseded by the first commit
//! Page 3   Bucket index    initial, superseded by the first commit
//! Page 4+  Branch / leaf / freelist / bucket-index / overflow pages
//! ```
//!
//! ## Read Path vs Write Path
//!
//! Readers go through [`MmapRegion`], a read-only map of the whole file.
//! The writer never mutates the map: it writes freshly allocated pages
//! through the file descriptor ([`DbFile`]) and fsyncs, so a committed
//! page is immutable for its entire on-disk lifetime (copy-on-write).
//!
//! ## Module Organization
//!
//! - `page`: page header, flags, element layouts, meta page, checksums
//! - `mmap`: read-only mapped view with power-of-two growth
//! - `file`: open/lock/write/fsync through the file descriptor
//! - `freelist`: reusable page ids with per-transaction pending lists

mod file;
mod freelist;
mod mmap;
mod page;

pub use file::{os_page_size, DbFile};
pub use freelist::Freelist;
pub use mmap::{MmapRegion, MAX_MMAP_SIZE};
pub use page::{
    fnv1a_64, BranchElement, BranchPage, LeafElement, LeafPage, Meta, PageFlag, PageHeader,
    ELEMENT_SIZE, MAGIC, META_SIZE, PAGE_HEADER_SIZE, VERSION,
};

/// 64-bit page identifier.
pub type Pgid = u64;

/// 64-bit transaction identifier.
pub type Txid = u64;

/// Fallback page size when the OS page size cannot be queried.
pub const DEFAULT_PAGE_SIZE: u64 = 4096;

/// A non-root branch or leaf never holds fewer elements than this.
pub const MIN_KEYS_PER_PAGE: usize = 2;

pub const EVEN_META_PAGE_ID: Pgid = 0;
pub const ODD_META_PAGE_ID: Pgid = 1;
pub const INIT_FREELIST_PAGE_ID: Pgid = 2;
pub const INIT_BUCKET_PAGE_ID: Pgid = 3;

/// Pages 0..4 are laid down at file creation and never enter the freelist.
pub const RESERVED_PAGE_COUNT: u64 = 4;
