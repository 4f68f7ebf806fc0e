//! # Error Types
//!
//! Every fallible operation in the engine returns [`Result`]. The variants
//! below are the full set of failure kinds the engine can surface; anything
//! else (a corrupted cached node, a branch element pointing outside its page)
//! is an invariant violation and panics instead of unwinding through the
//! commit sequence as a recoverable error.
//!
//! I/O failures carry the operation that failed so a REPL user can tell an
//! open failure from a mid-commit fsync failure. A commit that fails with
//! `Io` leaves the file pointing at the previous consistent tree: the meta
//! page is only rewritten after every data page is durable.

use std::io;
use thiserror::Error;

/// Result type used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Open, read, write, seek, fsync, mmap, madvise, or flock failure.
    #[error("io error during {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Both meta pages failed magic/version/checksum validation.
    #[error("both meta pages failed validation")]
    Validation,

    /// API call after close or on a handle that never opened.
    #[error("database is not open")]
    NotOpen,

    /// API call on a committed or rolled-back transaction.
    #[error("transaction has already been committed or rolled back")]
    TxClosed,

    /// Write operation on a read-only transaction.
    #[error("transaction is not writable")]
    NotWritable,

    #[error("bucket already exists: {0}")]
    BucketExists(String),

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("bucket name must not be empty")]
    BucketNameEmpty,

    #[error("key must not be empty")]
    KeyEmpty,

    #[error("value of {size} bytes exceeds the maximum of {max}")]
    ValueTooLarge { size: usize, max: usize },

    /// The freelist ran out and growing the map would exceed the maximum.
    #[error("page allocation failed: map would exceed {max} bytes")]
    AllocFailed { max: u64 },
}

impl Error {
    /// Wraps an `io::Error` with the name of the operation that failed.
    pub fn io(op: &'static str, source: io::Error) -> Self {
        Self::Io { op, source }
    }
}
