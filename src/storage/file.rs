//! # Block File
//!
//! Positional I/O over the `DB` data file. Every read and write covers
//! exactly one block, addressed by block number; offsets never move a
//! shared file cursor, so any number of readers can share the file
//! underneath their own `BlockFile` handles without coordination.
//!
//! Blocking points are confined to this type (plus fsync/rename/unlink
//! in the commit path); everything above it is pure memory work.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use eyre::{Result, WrapErr};

#[derive(Debug)]
pub struct BlockFile {
    file: File,
}

impl BlockFile {
    /// Opens an existing data file, read-only or read-write.
    pub fn open(path: &Path, writable: bool) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)?;
        Ok(Self { file })
    }

    /// Creates (or truncates) a data file for a fresh table.
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file })
    }

    /// Reads block `n` into `buf`; `buf.len()` is the block size.
    pub fn read_block(&self, n: u32, buf: &mut [u8]) -> Result<()> {
        let offset = buf.len() as u64 * n as u64;
        self.file
            .read_exact_at(buf, offset)
            .wrap_err_with(|| format!("error reading block {n}"))
    }

    /// Writes block `n` from `buf`; `buf.len()` is the block size.
    pub fn write_block(&self, n: u32, buf: &[u8]) -> Result<()> {
        let offset = buf.len() as u64 * n as u64;
        self.file
            .write_all_at(buf, offset)
            .wrap_err_with(|| format!("error writing block {n}"))
    }

    /// Flushes file contents and metadata to stable storage.
    pub fn sync(&self) -> std::io::Result<()> {
        self.file.sync_all()
    }
}
