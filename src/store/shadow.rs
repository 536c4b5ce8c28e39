//! # Shadow File
//!
//! Page-granular copy-on-first-write log that makes a commit cycle
//! undoable. Before any byte of the data file is overwritten, the 16 KiB
//! pages covering the target range are appended to the shadow, original
//! bytes and original offsets together. Replaying the shadow over the data
//! file therefore restores exactly the state at the start of the cycle.
//!
//! ## Frame format
//!
//! ```text
//! +------------------+------------------+
//! | Frame header     | Original page    |
//! | (24 bytes)       | (<= 16384 bytes) |
//! +------------------+------------------+
//! ```
//!
//! The header carries the page length (the final page of the shadowed
//! range may be short), the original byte offset, and a CRC-64 over both
//! plus the page bytes. An invalid or truncated trailing frame marks the
//! end of the replayable log: it is the write that was in flight when the
//! process died, and the data file bytes it would protect were never
//! overwritten (the shadow is synced before the data file is touched).
//!
//! ## Laziness
//!
//! A `ShadowFile` is armed at open and after every commit, but creates its
//! backing file only on the first copy. Between commits of an idle store
//! no shadow exists on disk, which is what lets a clean open skip replay.
//!
//! Only pages below `max_offset` (the file tail when the cycle began) are
//! ever copied: bytes above it did not exist at the start of the cycle and
//! need no undo.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result, WrapErr};
use roaring::RoaringBitmap;
use tracing::debug;
use zerocopy::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::StoreError;
use crate::io::{FileAccess, RandomAccess};

pub const SHADOW_MAGIC: [u8; 8] = *b"TSKSHDW1";

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct ShadowHeader {
    magic: [u8; 8],
    page_size: U32,
    reserved: [u8; 4],
    max_offset: U64,
}

const SHADOW_HEADER_SIZE: usize = 24;
const _: () = assert!(std::mem::size_of::<ShadowHeader>() == SHADOW_HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct ShadowFrameHeader {
    length: U32,
    reserved: [u8; 4],
    offset: U64,
    checksum: U64,
}

const FRAME_HEADER_SIZE: usize = 24;
const _: () = assert!(std::mem::size_of::<ShadowFrameHeader>() == FRAME_HEADER_SIZE);

fn frame_checksum(length: u32, offset: u64, data: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&length.to_be_bytes());
    digest.update(&offset.to_be_bytes());
    digest.update(data);
    digest.finalize()
}

pub struct ShadowFile {
    path: PathBuf,
    page_size: u32,
    max_offset: u64,
    file: Option<File>,
    pages: RoaringBitmap,
    saved_length: u64,
    page_buf: Vec<u8>,
}

impl ShadowFile {
    /// Arms a shadow for a commit cycle. `max_offset` is the data file
    /// tail at this moment; nothing at or above it is ever copied.
    pub fn new(path: PathBuf, max_offset: u64, page_size: u32) -> Self {
        Self {
            path,
            page_size,
            max_offset,
            file: None,
            pages: RoaringBitmap::new(),
            saved_length: 0,
            page_buf: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total bytes written to the shadow so far.
    pub fn saved_length(&self) -> u64 {
        self.saved_length
    }

    /// Copies every not-yet-shadowed page overlapping
    /// `[offset, offset + len)` from `source` into the shadow.
    pub fn copy(
        &mut self,
        source: &mut dyn RandomAccess,
        offset: u64,
        len: u32,
    ) -> Result<()> {
        if len == 0 || offset >= self.max_offset {
            return Ok(());
        }

        let end = (offset + len as u64).min(self.max_offset);
        let first = offset / self.page_size as u64;
        let last = (end - 1) / self.page_size as u64;

        for page in first..=last {
            if self.pages.contains(page as u32) {
                continue;
            }
            self.copy_page(source, page)?;
            self.pages.insert(page as u32);
        }

        Ok(())
    }

    fn copy_page(&mut self, source: &mut dyn RandomAccess, page: u64) -> Result<()> {
        let page_offset = page * self.page_size as u64;
        let read_len = (self.page_size as u64).min(self.max_offset - page_offset) as usize;

        self.page_buf.resize(read_len, 0);
        source.seek(page_offset)?;
        source.read_exact(&mut self.page_buf[..read_len])?;

        if self.file.is_none() {
            self.create_file()?;
        }

        let checksum = frame_checksum(read_len as u32, page_offset, &self.page_buf[..read_len]);
        let header = ShadowFrameHeader {
            length: U32::new(read_len as u32),
            reserved: [0; 4],
            offset: U64::new(page_offset),
            checksum: U64::new(checksum),
        };

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| eyre::eyre!("shadow file vanished after create"))?;
        file.seek(SeekFrom::Start(self.saved_length))
            .and_then(|_| file.write_all(header.as_bytes()))
            .and_then(|_| file.write_all(&self.page_buf[..read_len]))
            .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
            .wrap_err_with(|| format!("failed to append to shadow '{}'", self.path.display()))?;

        self.saved_length += (FRAME_HEADER_SIZE + read_len) as u64;
        debug!(
            page,
            page_offset,
            read_len,
            saved = self.saved_length,
            "shadow page captured"
        );

        Ok(())
    }

    fn create_file(&mut self) -> Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
            .wrap_err_with(|| format!("failed to create shadow '{}'", self.path.display()))?;

        let header = ShadowHeader {
            magic: SHADOW_MAGIC,
            page_size: U32::new(self.page_size),
            reserved: [0; 4],
            max_offset: U64::new(self.max_offset),
        };
        file.write_all(header.as_bytes())
            .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
            .wrap_err_with(|| format!("failed to write shadow header '{}'", self.path.display()))?;

        self.saved_length = SHADOW_HEADER_SIZE as u64;
        self.file = Some(file);

        Ok(())
    }

    /// Forces the log durable. After this returns, any later overwrite of
    /// a copied page can be undone by [`restore_file`](Self::restore_file).
    pub fn sync(&mut self) -> Result<()> {
        if let Some(file) = &self.file {
            file.sync_all()
                .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
                .wrap_err_with(|| format!("failed to sync shadow '{}'", self.path.display()))?;
        }
        Ok(())
    }

    /// Drops the file handle. The shadow stays on disk; whether it is
    /// replayed or deleted is the next open's decision.
    pub fn close(&mut self) {
        self.file = None;
    }

    /// Replays every valid frame of `shadow_path` into `data_path`, syncs
    /// the data file and deletes the shadow. Returns the number of pages
    /// restored.
    pub fn restore_file(
        fa: &dyn FileAccess,
        shadow_path: &Path,
        data_path: &Path,
    ) -> Result<u64> {
        let mut shadow = File::open(shadow_path)
            .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
            .wrap_err_with(|| format!("failed to open shadow '{}'", shadow_path.display()))?;

        let mut header_buf = [0u8; SHADOW_HEADER_SIZE];
        shadow
            .read_exact(&mut header_buf)
            .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::DataFile))
            .wrap_err_with(|| format!("shadow '{}' too short", shadow_path.display()))?;
        let header = ShadowHeader::read_from_bytes(&header_buf)
            .map_err(|e| eyre::eyre!("failed to parse shadow header: {:?}", e))?;
        ensure!(
            header.magic == SHADOW_MAGIC,
            StoreError::DataFile
        );
        let page_size = header.page_size.get();

        let mut data = OpenOptions::new()
            .read(true)
            .write(true)
            .open(data_path)
            .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
            .wrap_err_with(|| format!("failed to open data file '{}'", data_path.display()))?;

        let mut restored = 0u64;
        let mut page_buf = Vec::with_capacity(page_size as usize);

        loop {
            let mut frame_buf = [0u8; FRAME_HEADER_SIZE];
            if shadow.read_exact(&mut frame_buf).is_err() {
                break;
            }
            let frame = match ShadowFrameHeader::read_from_bytes(&frame_buf) {
                Ok(frame) => frame,
                Err(_) => break,
            };

            let length = frame.length.get();
            if length > page_size {
                break;
            }

            page_buf.resize(length as usize, 0);
            if shadow.read_exact(&mut page_buf).is_err() {
                break;
            }
            if frame_checksum(length, frame.offset.get(), &page_buf) != frame.checksum.get() {
                break;
            }

            data.seek(SeekFrom::Start(frame.offset.get()))
                .and_then(|_| data.write_all(&page_buf))
                .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
                .wrap_err_with(|| {
                    format!("failed to restore page into '{}'", data_path.display())
                })?;
            restored += 1;
        }

        data.sync_all()
            .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
            .wrap_err_with(|| format!("failed to sync '{}'", data_path.display()))?;
        drop(data);
        drop(shadow);

        fa.remove(shadow_path)?;
        debug!(
            shadow = %shadow_path.display(),
            restored,
            "shadow replay complete"
        );

        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{LocalFileAccess, ScaledFile};

    fn data_file_with(dir: &Path, content: &[u8]) -> (PathBuf, ScaledFile) {
        let path = dir.join("t.data");
        std::fs::write(&path, content).unwrap();
        let file = ScaledFile::open(&path, false).unwrap();
        (path, file)
    }

    #[test]
    fn copy_is_lazy_until_first_page() {
        let dir = tempfile::tempdir().unwrap();
        let shadow_path = dir.path().join("t.backup");
        let shadow = ShadowFile::new(shadow_path.clone(), 4096, 1024);

        assert!(!shadow_path.exists());
        assert_eq!(shadow.saved_length(), 0);
    }

    #[test]
    fn copy_skips_already_shadowed_pages() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut data) = data_file_with(dir.path(), &vec![7u8; 4096]);
        let mut shadow = ShadowFile::new(dir.path().join("t.backup"), 4096, 1024);

        shadow.copy(&mut data, 0, 100).unwrap();
        let after_first = shadow.saved_length();

        shadow.copy(&mut data, 50, 200).unwrap();
        assert_eq!(shadow.saved_length(), after_first);

        shadow.copy(&mut data, 1024, 1).unwrap();
        assert!(shadow.saved_length() > after_first);
    }

    #[test]
    fn copy_ignores_offsets_beyond_max() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut data) = data_file_with(dir.path(), &vec![7u8; 8192]);
        let mut shadow = ShadowFile::new(dir.path().join("t.backup"), 2048, 1024);

        shadow.copy(&mut data, 4096, 64).unwrap();

        assert_eq!(shadow.saved_length(), 0);
    }

    #[test]
    fn restore_undoes_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let original = vec![0x11u8; 4096];
        let (data_path, mut data) = data_file_with(dir.path(), &original);
        let shadow_path = dir.path().join("t.backup");

        let mut shadow = ShadowFile::new(shadow_path.clone(), 4096, 1024);
        shadow.copy(&mut data, 1024, 512).unwrap();
        shadow.sync().unwrap();

        data.seek(1024).unwrap();
        data.write_all(&[0xFFu8; 512]).unwrap();
        data.sync().unwrap();
        shadow.close();
        drop(data);

        let restored =
            ShadowFile::restore_file(&LocalFileAccess, &shadow_path, &data_path).unwrap();
        assert_eq!(restored, 1);
        assert!(!shadow_path.exists());
        assert_eq!(std::fs::read(&data_path).unwrap(), original);
    }

    #[test]
    fn truncated_final_frame_ends_replay() {
        let dir = tempfile::tempdir().unwrap();
        let original = vec![0x22u8; 4096];
        let (data_path, mut data) = data_file_with(dir.path(), &original);
        let shadow_path = dir.path().join("t.backup");

        let mut shadow = ShadowFile::new(shadow_path.clone(), 4096, 1024);
        shadow.copy(&mut data, 0, 1).unwrap();
        shadow.copy(&mut data, 2048, 1).unwrap();
        shadow.sync().unwrap();
        let full = shadow.saved_length();
        shadow.close();

        // chop into the second frame's page bytes
        let truncated = File::options().write(true).open(&shadow_path).unwrap();
        truncated.set_len(full - 5).unwrap();
        drop(truncated);

        data.seek(0).unwrap();
        data.write_all(&[0xEEu8; 1024]).unwrap();
        data.seek(2048).unwrap();
        data.write_all(&[0xEEu8; 1024]).unwrap();
        data.sync().unwrap();
        drop(data);

        let restored =
            ShadowFile::restore_file(&LocalFileAccess, &shadow_path, &data_path).unwrap();
        assert_eq!(restored, 1);

        let bytes = std::fs::read(&data_path).unwrap();
        assert_eq!(&bytes[..1024], &original[..1024], "first page restored");
        assert_eq!(&bytes[2048..3072], &[0xEEu8; 1024][..], "second page untouched");
    }

    #[test]
    fn final_short_page_is_clamped_to_max_offset() {
        let dir = tempfile::tempdir().unwrap();
        let original = vec![0x33u8; 1536];
        let (data_path, mut data) = data_file_with(dir.path(), &original);
        let shadow_path = dir.path().join("t.backup");

        let mut shadow = ShadowFile::new(shadow_path.clone(), 1536, 1024);
        shadow.copy(&mut data, 0, 1536).unwrap();
        shadow.sync().unwrap();
        shadow.close();

        data.seek(0).unwrap();
        data.write_all(&vec![0u8; 1536]).unwrap();
        data.sync().unwrap();
        drop(data);

        let restored =
            ShadowFile::restore_file(&LocalFileAccess, &shadow_path, &data_path).unwrap();
        assert_eq!(restored, 2);
        assert_eq!(std::fs::read(&data_path).unwrap(), original);
    }

    #[test]
    fn restore_rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let shadow_path = dir.path().join("t.backup");
        let data_path = dir.path().join("t.data");
        std::fs::write(&shadow_path, b"a compressed backup, not a shadow log...").unwrap();
        std::fs::write(&data_path, [0u8; 64]).unwrap();

        let err = ShadowFile::restore_file(&LocalFileAccess, &shadow_path, &data_path)
            .unwrap_err();

        assert_eq!(StoreError::of(&err), Some(StoreError::DataFile));
    }
}
