//! Filesystem adapter for backup rotation.
//!
//! The backup and defragmentation machinery renames, removes and archives
//! whole files. Those operations go through the [`FileAccess`] trait so an
//! embedding application can reroute them (virtual filesystems, test
//! harnesses); [`LocalFileAccess`] is the `std::fs` implementation used by
//! default.
//!
//! `archive`/`unarchive` stream a raw deflate compression of the data
//! file; the backup is a compressed image of a committed file, not a
//! container format.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::error::StoreError;

pub trait FileAccess: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    /// Removes a file; a missing file is not an error.
    fn remove(&self, path: &Path) -> Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Writes a deflate-compressed copy of `source` to `dest` and syncs it.
    fn archive(&self, source: &Path, dest: &Path) -> Result<()> {
        let mut input = File::open(source)
            .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
            .wrap_err_with(|| format!("failed to open '{}' for archiving", source.display()))?;
        let output = File::create(dest)
            .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
            .wrap_err_with(|| format!("failed to create archive '{}'", dest.display()))?;

        let mut encoder = DeflateEncoder::new(output, Compression::default());
        io::copy(&mut input, &mut encoder)
            .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
            .wrap_err_with(|| format!("failed to compress '{}'", source.display()))?;

        let output = encoder
            .finish()
            .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
            .wrap_err_with(|| format!("failed to finish archive '{}'", dest.display()))?;
        output
            .sync_all()
            .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
            .wrap_err_with(|| format!("failed to sync archive '{}'", dest.display()))?;

        Ok(())
    }

    /// Inflates an archive written by [`archive`](FileAccess::archive)
    /// over `dest`, replacing its contents.
    fn unarchive(&self, source: &Path, dest: &Path) -> Result<()> {
        let input = File::open(source)
            .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
            .wrap_err_with(|| format!("failed to open archive '{}'", source.display()))?;
        let mut output = File::create(dest)
            .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
            .wrap_err_with(|| format!("failed to create '{}'", dest.display()))?;

        let mut decoder = DeflateDecoder::new(input);
        io::copy(&mut decoder, &mut output)
            .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::DataFile))
            .wrap_err_with(|| format!("failed to inflate archive '{}'", source.display()))?;

        output
            .sync_all()
            .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
            .wrap_err_with(|| format!("failed to sync '{}'", dest.display()))?;

        Ok(())
    }
}

/// `std::fs` implementation of [`FileAccess`].
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileAccess;

impl FileAccess for LocalFileAccess {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn remove(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(eyre::Report::new(e).wrap_err(StoreError::FileIo))
                .wrap_err_with(|| format!("failed to remove '{}'", path.display())),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        std::fs::rename(from, to)
            .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
            .wrap_err_with(|| {
                format!("failed to rename '{}' to '{}'", from.display(), to.display())
            })
    }
}

/// Picks an unused `<path>.old.<n>` name for a file that could not be
/// deleted and has to be moved aside instead.
pub fn new_discard_name(path: &Path) -> PathBuf {
    let base = path.as_os_str().to_os_string();

    for n in 0u32.. {
        let mut candidate = base.clone();
        candidate.push(format!(".old.{}", n));
        let candidate = PathBuf::from(candidate);
        if !candidate.exists() {
            return candidate;
        }
    }

    unreachable!("u32 discard names exhausted")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("t.data");
        let backup = dir.path().join("t.backup");
        let restored = dir.path().join("t.restored");

        let payload: Vec<u8> = (0..10_000u32).flat_map(|v| v.to_be_bytes()).collect();
        std::fs::write(&source, &payload).unwrap();

        let fa = LocalFileAccess;
        fa.archive(&source, &backup).unwrap();
        assert!(backup.exists());

        fa.unarchive(&backup, &restored).unwrap();
        assert_eq!(std::fs::read(&restored).unwrap(), payload);
    }

    #[test]
    fn unarchive_of_garbage_is_data_file_error() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("t.backup");
        std::fs::write(&bogus, b"not a deflate stream at all").unwrap();

        let fa = LocalFileAccess;
        let err = fa
            .unarchive(&bogus, &dir.path().join("t.data"))
            .unwrap_err();

        assert_eq!(StoreError::of(&err), Some(StoreError::DataFile));
    }

    #[test]
    fn remove_ignores_missing_files() {
        let dir = tempfile::tempdir().unwrap();

        LocalFileAccess
            .remove(&dir.path().join("nothing-here"))
            .unwrap();
    }

    #[test]
    fn discard_names_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.data");
        std::fs::write(&path, b"x").unwrap();

        let first = new_discard_name(&path);
        assert!(first.to_string_lossy().ends_with("t.data.old.0"));
        std::fs::write(&first, b"x").unwrap();

        let second = new_discard_name(&path);
        assert!(second.to_string_lossy().ends_with("t.data.old.1"));
    }
}
