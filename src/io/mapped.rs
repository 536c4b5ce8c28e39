//! Memory-mapped data file backend.
//!
//! [`MappedFile`] keeps the whole data file mapped read-write and serves
//! positioned access as slice copies into and out of the mapping. The file
//! is grown in 1 MiB chunks; remapping invalidates the old view, so growth
//! flushes first and rebuilds the mapping before any further access. The
//! mapped length is therefore always a chunk multiple, slightly ahead of
//! the logical tail pointer the coordinator maintains in the header.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use memmap2::MmapMut;
use tracing::warn;

use super::RandomAccess;
use crate::error::StoreError;

/// Growth granularity of the mapping.
const GROW_CHUNK: u64 = 1 << 20;

fn round_up(value: u64, step: u64) -> u64 {
    value.div_ceil(step) * step
}

pub struct MappedFile {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    capacity: u64,
    pos: u64,
}

impl MappedFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
            .wrap_err_with(|| format!("failed to open data file '{}'", path.display()))?;

        let len = file
            .metadata()
            .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        // an empty file cannot be mapped; freshly created files start at
        // one chunk
        let capacity = round_up(len.max(1), GROW_CHUNK);
        if capacity != len {
            file.set_len(capacity)
                .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
                .wrap_err_with(|| format!("failed to extend '{}'", path.display()))?;
        }

        // SAFETY: map_mut is unsafe because the mapping is undefined if the
        // file is truncated or written by another process. The handle is
        // opened read-write and owned exclusively by this store instance;
        // the single-writer model means no other process touches the data
        // file while it is open. The mapping is replaced, never reused,
        // when the file is grown.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            path: path.to_path_buf(),
            file,
            mmap,
            capacity,
            pos: 0,
        })
    }

    fn grow(&mut self, min_len: u64) -> Result<()> {
        let new_capacity = round_up(min_len, GROW_CHUNK);

        self.mmap
            .flush()
            .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
            .wrap_err("failed to flush mapping before grow")?;

        self.file
            .set_len(new_capacity)
            .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
            .wrap_err_with(|| format!("failed to extend '{}'", self.path.display()))?;

        // SAFETY: the previous mapping was flushed and is dropped by the
        // assignment below; the file was extended before remapping, so the
        // new view covers new_capacity valid bytes. Exclusive ownership as
        // in open().
        self.mmap = unsafe {
            MmapMut::map_mut(&self.file)
                .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
                .wrap_err_with(|| format!("failed to remap '{}'", self.path.display()))?
        };
        self.capacity = new_capacity;

        Ok(())
    }
}

impl RandomAccess for MappedFile {
    fn seek(&mut self, offset: u64) -> Result<()> {
        self.pos = offset;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let end = self.pos + buf.len() as u64;
        if end > self.capacity {
            return Err(eyre::Report::new(StoreError::FileIo).wrap_err(format!(
                "read past end of mapped file '{}' ({} > {})",
                self.path.display(),
                end,
                self.capacity
            )));
        }

        let start = self.pos as usize;
        buf.copy_from_slice(&self.mmap[start..start + buf.len()]);
        self.pos = end;

        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let end = self.pos + buf.len() as u64;
        if end > self.capacity {
            self.grow(end)?;
        }

        let start = self.pos as usize;
        self.mmap[start..start + buf.len()].copy_from_slice(buf);
        self.pos = end;

        Ok(())
    }

    fn length(&self) -> Result<u64> {
        Ok(self.capacity)
    }

    fn ensure_length(&mut self, len: u64) -> Result<bool> {
        if len <= self.capacity {
            return Ok(true);
        }

        match self.grow(len) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    len,
                    error = %e,
                    "could not extend mapped data file"
                );
                Ok(false)
            }
        }
    }

    fn sync(&mut self) -> Result<()> {
        self.mmap
            .flush()
            .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
            .wrap_err_with(|| format!("failed to sync mapped file '{}'", self.path.display()))
    }

    fn close(&mut self) -> Result<()> {
        self.sync()
    }

    fn is_read_only(&self) -> bool {
        false
    }
}
