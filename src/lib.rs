//! # CairnDB - Embedded Transactional Key/Value Store
//!
//! CairnDB is an embedded, single-process key/value store persisted in a
//! single file. Keys and values are arbitrary byte strings grouped into
//! named *buckets*, each bucket backed by its own B+tree. This Rust
//! implementation prioritizes:
//!
//! - **Crash safety**: copy-on-write pages and double-buffered meta pages
//! - **Snapshot isolation**: readers never block and never see partial commits
//! - **Zero-copy reads**: cursors descend directly over the mmap'd file
//!
//! ## Quick Start
//!
//! ```ignore
//! use cairndb::Db;
//!
//! let db = Db::open("./app.db")?;
//!
//! db.update(|tx| {
//!     tx.create_bucket("users")?;
//!     tx.bucket_mut("users")?.put(b"alice", b"admin")?;
//!     Ok(())
//! })?;
//!
//! db.view(|tx| {
//!     let users = tx.bucket("users")?;
//!     assert_eq!(users.get(b"alice")?.as_deref(), Some(&b"admin"[..]));
//!     Ok(())
//! })?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Public API (Db, Tx)          │
//! ├─────────────────────────────────────┤
//! │   Buckets  │  Cursors  │  Nodes     │
//! ├─────────────────────────────────────┤
//! │  Tx-Cache (shadow pages, spill)     │
//! ├─────────────────────────────────────┤
//! │  Freelist  │  Page Layout │  Meta   │
//! ├─────────────────────────────────────┤
//! │   Memory-Mapped File I/O + fsync    │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Commit Protocol
//!
//! A writable transaction mutates in-memory nodes only. At commit, dirty
//! nodes are split to page size ("spill"), written into freshly allocated
//! shadow pages, flushed, and fsynced; the meta page is rewritten last.
//! Until that final write lands, the other meta page still points at the
//! previous consistent tree, so a crash at any point is recoverable.
//!
//! ## Concurrency
//!
//! Single writer, many readers. Readers traverse the mmap snapshot taken at
//! begin; the writer mutates only transaction-local state until the final
//! meta write. Pages freed by a commit stay quarantined until every reader
//! that could still reference them has finished.
//!
//! ## Module Overview
//!
//! - [`storage`]: page layout, meta pages, mmap region, file I/O, freelist
//! - [`db`]: process-level handle, meta selection, transaction registry
//! - [`tx`]: transaction lifecycle and the commit protocol
//! - [`bucket`]: named-bucket surface and the bucket index page
//! - [`cursor`]: key lookup by tree descent
//! - `node` / `txcache`: in-memory page mirrors and the spill machinery

pub mod bucket;
pub mod cli;
pub mod cursor;
pub mod db;
pub mod error;
pub mod storage;
pub mod tx;

mod node;
mod txcache;

pub use bucket::{Bucket, BucketMut};
pub use cursor::Cursor;
pub use db::{Db, Stats};
pub use error::{Error, Result};
pub use tx::Tx;
