//! # Command-Line Interface
//!
//! Interactive shell for poking at a CairnDB file:
//!
//! ```text
//! cairn> get users alice
//! admin
//! cairn> scan users
//! LeafPage 7: [{key: 'alice', val: 'admin'}]
//! cairn> exit
//! ```
//!
//! The shell speaks three commands — `get <bucket> <key>`,
//! `scan <bucket>`, `exit` — plus `help`. Errors are printed and the
//! loop continues; only EOF, `exit`, or a broken terminal end it.

mod repl;

pub use repl::Repl;
