//! # Random-Access File Layer
//!
//! Everything the page store does against the operating system funnels
//! through this module: positioned reads and writes on the single data
//! file, durability barriers, file growth, and the handful of filesystem
//! operations (exists/rename/remove/archive) needed by backup rotation.
//!
//! ## Backends
//!
//! The [`RandomAccess`] trait has two backends, chosen by a factory from
//! the store configuration:
//!
//! - [`ScaledFile`]: plain positioned i/o over an [`std::fs::File`]. Also
//!   serves as the read-only backend (writes are rejected up front).
//! - [`MappedFile`]: memory-mapped i/o via `memmap2`, grown in 1 MiB
//!   chunks so the mapping is not rebuilt on every extension.
//!
//! All multi-byte integers on disk are big-endian; the trait's
//! `read_u32`/`write_u64` helpers encode that in one place.
//!
//! ## Error surface
//!
//! Every failure is reported as [`crate::error::StoreError::FileIo`] with
//! the file path attached; callers with stronger knowledge (the row reader,
//! the shadow replayer) re-classify as `DataFile` where the bytes, not the
//! filesystem, are at fault.

mod file_access;
mod mapped;
mod raf;

pub use file_access::{new_discard_name, FileAccess, LocalFileAccess};
pub use mapped::MappedFile;
pub use raf::{open_data_file, RandomAccess, ScaledFile};
