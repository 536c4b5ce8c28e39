//! Positioned file access over `std::fs::File`.
//!
//! [`ScaledFile`] is the default backend: a seek-then-read/write wrapper
//! that relies on the OS page cache for buffering. The same type doubles
//! as the read-only backend; a read-only handle rejects every mutation
//! before touching the descriptor, so a file opened for recovery
//! inspection can never be damaged by a coding mistake higher up.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use tracing::warn;

use crate::error::StoreError;

/// Synchronous positioned i/o over a single file.
///
/// The cursor set by [`seek`](RandomAccess::seek) is consumed by the
/// subsequent reads and writes, which advance it. Implementations are not
/// thread-safe; the coordinator serialises access through its lock.
pub trait RandomAccess: Send {
    fn seek(&mut self, offset: u64) -> Result<()>;
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;
    fn length(&self) -> Result<u64>;

    /// Extends the file to at least `len` bytes. Returns `false` when the
    /// OS refused to grow the file (out of disk space), which callers
    /// translate into their own error.
    fn ensure_length(&mut self, len: u64) -> Result<bool>;

    /// Forces all written data to durable storage.
    fn sync(&mut self) -> Result<()>;

    /// Flushes and detaches; the handle must not be used afterwards.
    fn close(&mut self) -> Result<()>;

    fn is_read_only(&self) -> bool;

    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_all(&value.to_be_bytes())
    }

    fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_all(&value.to_be_bytes())
    }
}

/// Opens the data file backend selected by the configuration.
///
/// Memory mapping is only used for writable handles; a read-only open is
/// always plain file i/o, which keeps recovery inspection cheap.
pub fn open_data_file(path: &Path, readonly: bool, nio: bool) -> Result<Box<dyn RandomAccess>> {
    if nio && !readonly {
        Ok(Box::new(super::MappedFile::open(path)?))
    } else {
        Ok(Box::new(ScaledFile::open(path, readonly)?))
    }
}

/// Plain positioned file i/o; also the read-only backend.
#[derive(Debug)]
pub struct ScaledFile {
    path: PathBuf,
    file: File,
    readonly: bool,
}

impl ScaledFile {
    pub fn open(path: &Path, readonly: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .create(!readonly)
            .open(path)
            .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
            .wrap_err_with(|| format!("failed to open data file '{}'", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            readonly,
        })
    }

    fn io<T>(&self, result: std::io::Result<T>, what: &str) -> Result<T> {
        result
            .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
            .wrap_err_with(|| format!("{} '{}'", what, self.path.display()))
    }

    fn guard_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(eyre::Report::new(StoreError::FileIo)
                .wrap_err(format!("write to read-only file '{}'", self.path.display())));
        }
        Ok(())
    }
}

impl RandomAccess for ScaledFile {
    fn seek(&mut self, offset: u64) -> Result<()> {
        let result = self.file.seek(SeekFrom::Start(offset));
        self.io(result, "failed to seek in").map(|_| ())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let result = self.file.read_exact(buf);
        self.io(result, "failed to read from")
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.guard_writable()?;
        let result = self.file.write_all(buf);
        self.io(result, "failed to write to")
    }

    fn length(&self) -> Result<u64> {
        let result = self.file.metadata().map(|m| m.len());
        self.io(result, "failed to stat")
    }

    fn ensure_length(&mut self, len: u64) -> Result<bool> {
        if self.readonly {
            return Ok(false);
        }
        if self.length()? >= len {
            return Ok(true);
        }

        match self.file.set_len(len) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    len,
                    error = %e,
                    "could not extend data file"
                );
                Ok(false)
            }
        }
    }

    fn sync(&mut self) -> Result<()> {
        if self.readonly {
            return Ok(());
        }
        let result = self.file.sync_all();
        self.io(result, "failed to sync")
    }

    fn close(&mut self) -> Result<()> {
        if self.readonly {
            return Ok(());
        }
        let result = self.file.sync_all();
        self.io(result, "failed to sync on close")
    }

    fn is_read_only(&self) -> bool {
        self.readonly
    }
}
