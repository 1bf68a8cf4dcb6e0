//! # strata - a revision-safe copy-on-write B-tree
//!
//! A single-file key-value store mapping byte-string keys to
//! byte-string values, built as the durable substrate of a full-text
//! search engine: posting lists, term dictionaries, document records
//! and positional data all live in trees like this one. The design
//! favours:
//!
//! - **Crash safety without a write-ahead log**: blocks are copied on
//!   write and two alternating base files make each commit atomic; a
//!   crash at any instant leaves the last committed revision intact.
//! - **Lock-free readers**: any number of readers walk an older
//!   committed revision while a single writer prepares the next; a
//!   reader that loses the race gets a clean "reopen and retry" error,
//!   never a torn read.
//! - **Large values**: values too big for one block are split into
//!   chunked items transparently, optionally deflated first.
//!
//! ## Quick start
//!
//! ```ignore
//! use strata::{Table, TableOptions};
//!
//! let mut table = Table::create(path, TableOptions::new())?;
//! table.add(b"cat", b"meow", false)?;
//! table.commit(1)?;
//!
//! let mut reader = Table::open(path, TableOptions::new().readonly(true))?;
//! assert_eq!(reader.get_exact_entry(b"cat")?, Some(b"meow".to_vec()));
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +------------------------------------------+
//! |      Table (add/del/get/commit)          |
//! +---------------------+--------------------+
//! |   Cursor machinery  |  Chunking/deflate  |
//! +---------------------+--------------------+
//! |  Block codec + item accessors (btree)    |
//! +------------------------------------------+
//! |  Base files, free map, block I/O         |
//! |  (storage)                               |
//! +------------------------------------------+
//! ```
//!
//! ## On-disk files
//!
//! A table at path stem `P` is `P DB` (the block file), plus `P baseA`
//! and `P baseB` (alternating per-revision metadata). See
//! [`storage`] for the formats.
//!
//! ## Module overview
//!
//! - [`btree`]: the tree proper - block layout, items, table engine,
//!   cursors
//! - [`storage`]: block file I/O, the free-block map, base files
//! - [`encoding`]: packed integers for the base and changes formats
//! - [`compress`]: raw-deflate tag compression

pub mod btree;
pub mod compress;
pub mod config;
pub mod encoding;
pub mod error;
pub mod storage;

pub use btree::{Cursor, Table, MAX_KEY_LEN};
pub use compress::CompressStrategy;
pub use config::TableOptions;
pub use error::Error;
