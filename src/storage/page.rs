//! # Page Types and On-Disk Layout
//!
//! This module defines the page structure for CairnDB's storage layer. Every
//! page begins with a 40-byte header followed by a type-specific body. All
//! multi-byte fields are little-endian.
//!
//! ## Page Header Layout (40 bytes)
//!
//! ```text
//! Offset  Size  Field      Description
//! ------  ----  ---------  ----------------------------------------
//! 0       8     id         Page id (position = id * page_size)
//! 8       8     flags      Bit mask of PageFlag
//! 16      8     overflow   Extra pages owned by this allocation
//! 24      8     count      Element count
//! 32      8     reserved   Always written 0
//! ```
//!
//! The reserved word is where the in-memory sanity sentinel of older
//! formats lived; it is persisted as zero for portability. Typed page
//! views over bounds-checked slices make a runtime canary unnecessary.
//!
//! ## Page Types
//!
//! - **Meta** (0x04): root of trust; two copies at pages 0 and 1
//! - **Freelist** (0x10): sorted array of reusable page ids
//! - **BucketIndex** (0x08): bucket name to root page id mapping
//! - **Branch** (0x01): B+tree interior node
//! - **Leaf** (0x02): B+tree leaf node with key/value pairs
//!
//! ## Element Layout
//!
//! Branch and leaf pages store a fixed-size element array directly after
//! the header, followed by the packed variable-length key (and value)
//! bytes. Element offsets are absolute from the page start so in-memory
//! buffers and mmap'd pages decode identically.
//!
//! ```text
//! Leaf element (24B):    { offset: u64, ksize: u64, vsize: u64 }
//! Branch element (24B):  { offset: u64, ksize: u64, pgid:  u64 }
//! ```
//!
//! Elements are sorted ascending by byte-lexicographic key order. A branch
//! element at index `i` covers every key `>= key[i]` and `< key[i+1]`; the
//! leftmost child additionally covers keys below `key[0]`.
//!
//! ## Meta Page
//!
//! The meta body follows the header and is integrity-checked with an
//! FNV-1a 64 checksum over everything before the checksum field. Commits
//! alternate between the meta at page 0 (even txid) and page 1 (odd txid);
//! on open, the meta with the larger txid whose checksum validates wins.
//!
//! ## Zero-Copy Access
//!
//! All on-disk structs use `zerocopy` for safe transmutation from raw
//! bytes, so headers and elements are read directly from mmap'd pages
//! without copying. Every struct is `Unaligned`: mmap offsets carry no
//! alignment guarantees worth relying on.

use std::fmt;

use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{Pgid, Txid, INIT_BUCKET_PAGE_ID, INIT_FREELIST_PAGE_ID, RESERVED_PAGE_COUNT};

pub const MAGIC: u64 = 0xED0C_DAED;
pub const VERSION: u64 = 1;

pub const PAGE_HEADER_SIZE: usize = 40;
pub const META_SIZE: usize = 64;
pub const ELEMENT_SIZE: usize = 24;

const META_CHECKSUM_OFFSET: usize = 56;

#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFlag {
    Branch = 0x01,
    Leaf = 0x02,
    Meta = 0x04,
    BucketIndex = 0x08,
    Freelist = 0x10,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    id: U64,
    flags: U64,
    overflow: U64,
    count: U64,
    reserved: U64,
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    pub fn new(id: Pgid, flag: PageFlag) -> Self {
        Self {
            id: U64::new(id),
            flags: U64::new(flag as u64),
            overflow: U64::new(0),
            count: U64::new(0),
            reserved: U64::new(0),
        }
    }

    /// Borrows the header at the start of a page.
    ///
    /// Panics when the buffer is shorter than a header; callers always hand
    /// in whole pages.
    pub fn from_bytes(data: &[u8]) -> &Self {
        assert!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );
        Self::ref_from_bytes(&data[..PAGE_HEADER_SIZE])
            .expect("PageHeader is unaligned and the slice has its exact size")
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> &mut Self {
        assert!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );
        Self::mut_from_bytes(&mut data[..PAGE_HEADER_SIZE])
            .expect("PageHeader is unaligned and the slice has its exact size")
    }

    pub fn write_to(&self, data: &mut [u8]) {
        data[..PAGE_HEADER_SIZE].copy_from_slice(self.as_bytes());
    }

    pub fn id(&self) -> Pgid {
        self.id.get()
    }

    pub fn set_id(&mut self, id: Pgid) {
        self.id = U64::new(id);
    }

    pub fn flags(&self) -> u64 {
        self.flags.get()
    }

    pub fn set_flags(&mut self, flag: PageFlag) {
        self.flags = U64::new(flag as u64);
    }

    pub fn overflow(&self) -> u64 {
        self.overflow.get()
    }

    pub fn set_overflow(&mut self, overflow: u64) {
        self.overflow = U64::new(overflow);
    }

    pub fn count(&self) -> u64 {
        self.count.get()
    }

    pub fn set_count(&mut self, count: u64) {
        self.count = U64::new(count);
    }

    pub fn has_flag(&self, flag: PageFlag) -> bool {
        self.flags.get() & flag as u64 != 0
    }

    pub fn is_leaf(&self) -> bool {
        self.has_flag(PageFlag::Leaf)
    }

    pub fn is_branch(&self) -> bool {
        self.has_flag(PageFlag::Branch)
    }

    pub fn is_meta(&self) -> bool {
        self.has_flag(PageFlag::Meta)
    }

    pub fn is_freelist(&self) -> bool {
        self.has_flag(PageFlag::Freelist)
    }

    pub fn is_bucket_index(&self) -> bool {
        self.has_flag(PageFlag::BucketIndex)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct LeafElement {
    offset: U64,
    ksize: U64,
    vsize: U64,
}

const _: () = assert!(std::mem::size_of::<LeafElement>() == ELEMENT_SIZE);

impl LeafElement {
    pub fn new(offset: u64, ksize: u64, vsize: u64) -> Self {
        Self {
            offset: U64::new(offset),
            ksize: U64::new(ksize),
            vsize: U64::new(vsize),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset.get()
    }

    pub fn ksize(&self) -> u64 {
        self.ksize.get()
    }

    pub fn vsize(&self) -> u64 {
        self.vsize.get()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BranchElement {
    offset: U64,
    ksize: U64,
    pgid: U64,
}

const _: () = assert!(std::mem::size_of::<BranchElement>() == ELEMENT_SIZE);

impl BranchElement {
    pub fn new(offset: u64, ksize: u64, pgid: Pgid) -> Self {
        Self {
            offset: U64::new(offset),
            ksize: U64::new(ksize),
            pgid: U64::new(pgid),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset.get()
    }

    pub fn ksize(&self) -> u64 {
        self.ksize.get()
    }

    pub fn pgid(&self) -> Pgid {
        self.pgid.get()
    }
}

/// Read-only view of a leaf page.
#[derive(Debug, Clone, Copy)]
pub struct LeafPage<'a> {
    data: &'a [u8],
}

impl<'a> LeafPage<'a> {
    /// Panics when the page is not flagged as a leaf; the caller dispatched
    /// on the header already.
    pub fn from_page(data: &'a [u8]) -> Self {
        assert!(
            PageHeader::from_bytes(data).is_leaf(),
            "page {} is not a leaf",
            PageHeader::from_bytes(data).id()
        );
        Self { data }
    }

    pub fn count(&self) -> usize {
        PageHeader::from_bytes(self.data).count() as usize
    }

    fn element(&self, index: usize) -> &'a LeafElement {
        assert!(index < self.count(), "leaf element {} out of bounds", index);
        let start = PAGE_HEADER_SIZE + index * ELEMENT_SIZE;
        LeafElement::ref_from_bytes(&self.data[start..start + ELEMENT_SIZE])
            .expect("LeafElement is unaligned and the slice has its exact size")
    }

    pub fn key(&self, index: usize) -> &'a [u8] {
        let e = self.element(index);
        let start = e.offset() as usize;
        &self.data[start..start + e.ksize() as usize]
    }

    pub fn value(&self, index: usize) -> &'a [u8] {
        let e = self.element(index);
        let start = e.offset() as usize + e.ksize() as usize;
        &self.data[start..start + e.vsize() as usize]
    }

    /// Returns `(index, exact)` of the first element whose key is `>= key`.
    /// `index == count()` when every key is smaller.
    pub fn find_first_ge(&self, key: &[u8]) -> (usize, bool) {
        for i in 0..self.count() {
            let cur = self.key(i);
            if cur >= key {
                return (i, cur == key);
            }
        }
        (self.count(), false)
    }
}

impl fmt::Display for LeafPage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LeafPage[")?;
        for i in 0..self.count() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(
                f,
                "{{key: '{}', val: '{}'}}",
                String::from_utf8_lossy(self.key(i)),
                String::from_utf8_lossy(self.value(i))
            )?;
        }
        write!(f, "]")
    }
}

/// Read-only view of a branch page.
#[derive(Debug, Clone, Copy)]
pub struct BranchPage<'a> {
    data: &'a [u8],
}

impl<'a> BranchPage<'a> {
    pub fn from_page(data: &'a [u8]) -> Self {
        assert!(
            PageHeader::from_bytes(data).is_branch(),
            "page {} is not a branch",
            PageHeader::from_bytes(data).id()
        );
        Self { data }
    }

    pub fn count(&self) -> usize {
        PageHeader::from_bytes(self.data).count() as usize
    }

    fn element(&self, index: usize) -> &'a BranchElement {
        assert!(
            index < self.count(),
            "branch element {} out of bounds",
            index
        );
        let start = PAGE_HEADER_SIZE + index * ELEMENT_SIZE;
        BranchElement::ref_from_bytes(&self.data[start..start + ELEMENT_SIZE])
            .expect("BranchElement is unaligned and the slice has its exact size")
    }

    pub fn key(&self, index: usize) -> &'a [u8] {
        let e = self.element(index);
        let start = e.offset() as usize;
        &self.data[start..start + e.ksize() as usize]
    }

    pub fn child(&self, index: usize) -> Pgid {
        self.element(index).pgid()
    }

    /// Returns `(index, exact)` of the first element whose key is `>= key`.
    pub fn find_first_ge(&self, key: &[u8]) -> (usize, bool) {
        for i in 0..self.count() {
            let cur = self.key(i);
            if cur >= key {
                return (i, cur == key);
            }
        }
        (self.count(), false)
    }
}

impl fmt::Display for BranchPage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BranchPage[")?;
        for i in 0..self.count() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(
                f,
                "{{key: '{}', pgid: {}}}",
                String::from_utf8_lossy(self.key(i)),
                self.child(i)
            )?;
        }
        write!(f, "]")
    }
}

/// Meta page body. Two copies live at pages 0 and 1; a commit with txid T
/// rewrites the copy at page `T & 1`.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Meta {
    magic: U64,
    version: U64,
    page_size: U64,
    freelist: U64,
    buckets: U64,
    watermark: U64,
    txid: U64,
    checksum: U64,
}

const _: () = assert!(std::mem::size_of::<Meta>() == META_SIZE);

impl Meta {
    pub fn new(page_size: u64, txid: Txid) -> Self {
        Self {
            magic: U64::new(MAGIC),
            version: U64::new(VERSION),
            page_size: U64::new(page_size),
            freelist: U64::new(INIT_FREELIST_PAGE_ID),
            buckets: U64::new(INIT_BUCKET_PAGE_ID),
            watermark: U64::new(RESERVED_PAGE_COUNT),
            txid: U64::new(txid),
            checksum: U64::new(0),
        }
    }

    /// Copies the meta body out of a page buffer. No validation happens
    /// here; callers decide which copy to trust via [`Meta::validate`].
    pub fn read_from_page(page: &[u8]) -> Self {
        Self::read_from_bytes(&page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + META_SIZE])
            .expect("Meta is unaligned and the slice has its exact size")
    }

    /// Writes the page header and the checksummed meta body into `page`.
    pub fn write_to_page(&mut self, page: &mut [u8], pgid: Pgid) {
        let header = PageHeader::new(pgid, PageFlag::Meta);
        header.write_to(page);

        self.checksum = U64::new(self.sum64());
        page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + META_SIZE].copy_from_slice(self.as_bytes());
    }

    /// FNV-1a 64 over every field preceding the checksum.
    pub fn sum64(&self) -> u64 {
        fnv1a_64(&self.as_bytes()[..META_CHECKSUM_OFFSET])
    }

    pub fn validate(&self) -> bool {
        self.magic.get() == MAGIC
            && self.version.get() == VERSION
            && self.checksum.get() == self.sum64()
    }

    pub fn page_size(&self) -> u64 {
        self.page_size.get()
    }

    pub fn freelist(&self) -> Pgid {
        self.freelist.get()
    }

    pub fn set_freelist(&mut self, pgid: Pgid) {
        self.freelist = U64::new(pgid);
    }

    pub fn buckets(&self) -> Pgid {
        self.buckets.get()
    }

    pub fn set_buckets(&mut self, pgid: Pgid) {
        self.buckets = U64::new(pgid);
    }

    pub fn watermark(&self) -> Pgid {
        self.watermark.get()
    }

    pub fn set_watermark(&mut self, pgid: Pgid) {
        self.watermark = U64::new(pgid);
    }

    pub fn txid(&self) -> Txid {
        self.txid.get()
    }

    pub fn increment_txid(&mut self) {
        self.txid = U64::new(self.txid.get() + 1);
    }

    pub fn checksum(&self) -> u64 {
        self.checksum.get()
    }
}

impl fmt::Display for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Meta(magic: {:#x}, version: {}, page_size: {}, freelist: {}, buckets: {}, \
             watermark: {}, txid: {}, checksum: {:#x})",
            self.magic.get(),
            self.version.get(),
            self.page_size.get(),
            self.freelist.get(),
            self.buckets.get(),
            self.watermark.get(),
            self.txid.get(),
            self.checksum.get()
        )
    }
}

/// FNV-1a 64-bit fold, the meta checksum of the file format.
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x100_0000_01b3;

    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_SIZE: usize = 4096;

    #[test]
    fn page_header_size_is_40_bytes() {
        assert_eq!(std::mem::size_of::<PageHeader>(), PAGE_HEADER_SIZE);
    }

    #[test]
    fn element_sizes_are_24_bytes() {
        assert_eq!(std::mem::size_of::<LeafElement>(), ELEMENT_SIZE);
        assert_eq!(std::mem::size_of::<BranchElement>(), ELEMENT_SIZE);
    }

    #[test]
    fn meta_size_is_64_bytes() {
        assert_eq!(std::mem::size_of::<Meta>(), META_SIZE);
    }

    #[test]
    fn page_header_round_trips_through_bytes() {
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        let mut header = PageHeader::new(42, PageFlag::Leaf);
        header.set_count(7);
        header.set_overflow(2);
        header.write_to(&mut buf);

        let read = PageHeader::from_bytes(&buf);

        assert_eq!(read.id(), 42);
        assert_eq!(read.count(), 7);
        assert_eq!(read.overflow(), 2);
        assert!(read.is_leaf());
        assert!(!read.is_branch());
    }

    #[test]
    fn page_header_reserved_word_persists_as_zero() {
        let mut buf = [0xFFu8; PAGE_HEADER_SIZE];
        PageHeader::new(1, PageFlag::Branch).write_to(&mut buf);

        assert_eq!(&buf[32..40], &[0u8; 8]);
    }

    #[test]
    fn fnv1a_64_known_vectors() {
        assert_eq!(fnv1a_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a_64(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn meta_validates_after_checksum() {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut meta = Meta::new(PAGE_SIZE as u64, 3);
        meta.write_to_page(&mut page, 1);

        let read = Meta::read_from_page(&page);

        assert!(read.validate());
        assert_eq!(read.txid(), 3);
        assert_eq!(read.page_size(), PAGE_SIZE as u64);
        assert_eq!(read.watermark(), RESERVED_PAGE_COUNT);
    }

    #[test]
    fn meta_with_flipped_byte_fails_validation() {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut meta = Meta::new(PAGE_SIZE as u64, 5);
        meta.write_to_page(&mut page, 1);

        page[PAGE_HEADER_SIZE + 24] ^= 0x01;
        let read = Meta::read_from_page(&page);

        assert!(!read.validate());
    }

    #[test]
    fn meta_with_wrong_magic_fails_validation() {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut meta = Meta::new(PAGE_SIZE as u64, 5);
        meta.write_to_page(&mut page, 0);

        page[PAGE_HEADER_SIZE] ^= 0xFF;
        let read = Meta::read_from_page(&page);

        assert!(!read.validate());
    }

    fn build_leaf(entries: &[(&[u8], &[u8])]) -> Vec<u8> {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut header = PageHeader::new(9, PageFlag::Leaf);
        header.set_count(entries.len() as u64);
        header.write_to(&mut page);

        let mut offset = PAGE_HEADER_SIZE + entries.len() * ELEMENT_SIZE;
        for (i, (k, v)) in entries.iter().enumerate() {
            let e = LeafElement::new(offset as u64, k.len() as u64, v.len() as u64);
            let slot = PAGE_HEADER_SIZE + i * ELEMENT_SIZE;
            page[slot..slot + ELEMENT_SIZE].copy_from_slice(e.as_bytes());
            page[offset..offset + k.len()].copy_from_slice(k);
            offset += k.len();
            page[offset..offset + v.len()].copy_from_slice(v);
            offset += v.len();
        }
        page
    }

    #[test]
    fn leaf_page_reads_keys_and_values() {
        let page = build_leaf(&[(b"apple", b"1"), (b"banana", b"22"), (b"cherry", b"333")]);

        let leaf = LeafPage::from_page(&page);

        assert_eq!(leaf.count(), 3);
        assert_eq!(leaf.key(0), b"apple");
        assert_eq!(leaf.value(0), b"1");
        assert_eq!(leaf.key(2), b"cherry");
        assert_eq!(leaf.value(2), b"333");
    }

    #[test]
    fn leaf_find_first_ge_exact_and_between() {
        let page = build_leaf(&[(b"b", b"1"), (b"d", b"2"), (b"f", b"3")]);
        let leaf = LeafPage::from_page(&page);

        assert_eq!(leaf.find_first_ge(b"a"), (0, false));
        assert_eq!(leaf.find_first_ge(b"b"), (0, true));
        assert_eq!(leaf.find_first_ge(b"c"), (1, false));
        assert_eq!(leaf.find_first_ge(b"f"), (2, true));
        assert_eq!(leaf.find_first_ge(b"g"), (3, false));
    }

    #[test]
    fn shorter_key_sorts_before_its_extension() {
        let page = build_leaf(&[(b"ab", b"1"), (b"abc", b"2")]);
        let leaf = LeafPage::from_page(&page);

        assert_eq!(leaf.find_first_ge(b"ab"), (0, true));
        assert_eq!(leaf.find_first_ge(b"abb"), (1, false));
    }

    #[test]
    fn branch_page_reads_children() {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut header = PageHeader::new(4, PageFlag::Branch);
        header.set_count(2);
        header.write_to(&mut page);

        let mut offset = PAGE_HEADER_SIZE + 2 * ELEMENT_SIZE;
        for (i, (k, pgid)) in [(&b"a"[..], 10u64), (&b"m"[..], 11u64)].iter().enumerate() {
            let e = BranchElement::new(offset as u64, k.len() as u64, *pgid);
            let slot = PAGE_HEADER_SIZE + i * ELEMENT_SIZE;
            page[slot..slot + ELEMENT_SIZE].copy_from_slice(e.as_bytes());
            page[offset..offset + k.len()].copy_from_slice(k);
            offset += k.len();
        }

        let branch = BranchPage::from_page(&page);

        assert_eq!(branch.count(), 2);
        assert_eq!(branch.key(0), b"a");
        assert_eq!(branch.child(0), 10);
        assert_eq!(branch.child(1), 11);
        assert_eq!(branch.find_first_ge(b"m"), (1, true));
        assert_eq!(branch.find_first_ge(b"z"), (2, false));
    }

    #[test]
    #[should_panic(expected = "is not a leaf")]
    fn leaf_view_rejects_branch_page() {
        let mut page = vec![0u8; PAGE_SIZE];
        PageHeader::new(4, PageFlag::Branch).write_to(&mut page);

        let _ = LeafPage::from_page(&page);
    }
}
