//! # Error Kinds
//!
//! Most internal failures propagate as plain `eyre` reports. The kinds a
//! caller genuinely needs to tell apart carry a typed [`Error`] at the
//! root of the report so they can be recovered with
//! `report.downcast_ref::<Error>()`:
//!
//! - [`Error::Opening`] - the table could not be opened at all (missing
//!   or unreadable base files, missing data file on a non-lazy table).
//! - [`Error::Corrupt`] - a structural invariant failed while reading:
//!   level mismatch, revision ordering violation, truncated chunk chain,
//!   impossibly deep tree.
//! - [`Error::Modified`] - a reader touched a block written by a newer
//!   revision than the one it opened. Never fatal: reopen and retry.
//! - [`Error::Unimplemented`] - a request exceeded a hard limit (a value
//!   needing 65536 or more chunks).
//! - [`Error::Database`] - misuse or an unrecoverable commit failure
//!   (stale commit revision, fsync/rename failure).
//! - [`Error::Io`] - an underlying read or write failed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("error opening table: {0}")]
    Opening(String),

    #[error("table corrupt: {0}")]
    Corrupt(String),

    #[error("the revision being read has been discarded - reopen the table and retry")]
    Modified,

    #[error("unimplemented: {0}")]
    Unimplemented(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_survive_eyre_downcast() {
        let report: eyre::Report = Error::Modified.into();
        assert!(matches!(
            report.downcast_ref::<Error>(),
            Some(Error::Modified)
        ));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = Error::from(io);
        assert!(matches!(err, Error::Io(_)));
    }
}
