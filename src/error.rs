//! # Error Kinds
//!
//! All fallible operations in this crate return [`eyre::Result`] so that
//! call sites can attach rich context (file paths, positions, operation
//! names) as they propagate. The semantic *kind* of a failure is carried by
//! [`StoreError`], attached to the report at the point of failure, so
//! callers can recover it with [`StoreError::of`] and decide how to react:
//!
//! - `FileIo`: the underlying filesystem failed; surfaced to the caller
//!   except on the best-effort paths (flag maintenance, fast close).
//! - `DataFile`: the file content is inconsistent (bad size prefix, broken
//!   free-space chain). The caller may close without committing.
//! - `DataFileIsFull`: a grow request would exceed the configured maximum
//!   file size. The current operation must abort; the store stays usable.
//! - `WrongDatabaseVersion`: the header says this file was written by an
//!   unsupported version. Fatal at open.
//! - `OutOfMemory`: a row buffer could not be allocated while materialising
//!   an object. Retried once after a forced cache purge, then surfaced.

use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = eyre::Result<T>;

/// Semantic failure kinds of the page store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("data file i/o failure")]
    FileIo,
    #[error("data file is corrupted or inconsistent")]
    DataFile,
    #[error("data file has reached its maximum size")]
    DataFileIsFull,
    #[error("data file was written by an unsupported version")]
    WrongDatabaseVersion,
    #[error("out of memory while materialising a row")]
    OutOfMemory,
}

impl StoreError {
    /// Recovers the semantic kind from a report, if one was attached.
    ///
    /// Walks the chain from the outermost context inwards, so a low-level
    /// `FileIo` that was re-classified as `DataFile` by the row reader is
    /// seen as `DataFile` by the caller.
    pub fn of(report: &eyre::Report) -> Option<StoreError> {
        report.downcast_ref::<StoreError>().copied()
    }
}
