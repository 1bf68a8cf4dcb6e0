//! # Storage Module
//!
//! The on-disk footprint of one table at path stem `P` is three files:
//!
//! ```text
//! P DB     - the data file: fixed-size blocks indexed from 0
//! P baseA  - base file A: per-revision metadata + free-block bitmap
//! P baseB  - base file B: ditto, for the alternate revision
//! ```
//!
//! At most one of the base files is the "live" one; the other belongs to
//! the previous committed revision and is unlinked on the first block
//! write of the next transaction. A temporary file `P tmp` exists only
//! for the instant between writing a new base and renaming it into
//! place.
//!
//! This module owns everything below the tree: positional block I/O
//! ([`BlockFile`]), the two-bitmap free-block map ([`FreeMap`]), and the
//! base-file codec ([`RevisionBase`]).

mod base;
mod bitmap;
mod file;

pub use base::{RevisionBase, BASE_MAGIC, BASE_VERSION};
pub use bitmap::FreeMap;
pub use file::BlockFile;

use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const MIN_BLOCK_SIZE: usize = 2048;
pub const MAX_BLOCK_SIZE: usize = 65536;
pub const DEFAULT_BLOCK_SIZE: usize = 8192;

fn with_suffix(stem: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = stem.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// `<stem>DB`, the main data file.
pub fn db_path(stem: &Path) -> PathBuf {
    with_suffix(stem, "DB")
}

/// `<stem>base<letter>`, one of the two alternating base files.
pub fn base_path(stem: &Path, letter: char) -> PathBuf {
    with_suffix(stem, &format!("base{letter}"))
}

/// `<stem>tmp`, the staging name a new base is written under before the
/// atomic rename.
pub fn tmp_path(stem: &Path) -> PathBuf {
    with_suffix(stem, "tmp")
}

pub fn other_letter(letter: char) -> char {
    if letter == 'A' {
        'B'
    } else {
        'A'
    }
}
