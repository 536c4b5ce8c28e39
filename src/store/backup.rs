//! # Backup Artifacts and Rotation State
//!
//! Given a store base name `B`, the persistence core owns this family of
//! filesystem artifacts:
//!
//! ```text
//! B.data         the data file
//! B.backup       full deflate backup, or the shadow log in incremental mode
//! B.data.new     staged replacement data file (defragmentation)
//! B.backup.new   staged replacement backup
//! B.data.old.<n> a data file that could not be deleted, moved aside
//! B.state        the db-modified marker
//! ```
//!
//! The marker makes the defragmentation rotation crash-safe: it is forced
//! to `modified-new` after the staged files are complete and back to
//! `not-modified` once they are swapped into place. An open that reads
//! `modified-new` finishes the swap; any other value means staged files
//! are stale leftovers and are removed.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use tracing::warn;

use crate::error::StoreError;
use crate::io::FileAccess;

/// The filesystem artifact names derived from one base name.
#[derive(Debug, Clone)]
pub struct StoreFiles {
    pub data: PathBuf,
    pub backup: PathBuf,
    pub data_new: PathBuf,
    pub backup_new: PathBuf,
    pub marker: PathBuf,
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

impl StoreFiles {
    pub fn new(base: &Path) -> Self {
        Self {
            data: with_suffix(base, ".data"),
            backup: with_suffix(base, ".backup"),
            data_new: with_suffix(base, ".data.new"),
            backup_new: with_suffix(base, ".backup.new"),
            marker: with_suffix(base, ".state"),
        }
    }

    /// Artifact names for the temporary store a defragmentation writes
    /// into. Its data file is the staged `B.data.new`; the other names are
    /// derived from it and never used in a completed run.
    pub fn defrag_target(&self) -> Self {
        Self {
            data: self.data_new.clone(),
            backup: with_suffix(&self.data_new, ".backup"),
            data_new: with_suffix(&self.data_new, ".new"),
            backup_new: with_suffix(&self.data_new, ".backup.new"),
            marker: with_suffix(&self.data_new, ".state"),
        }
    }
}

/// Persistent db-modified marker guiding rotation recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbModified {
    NotModified,
    Modified,
    ModifiedNew,
}

impl DbModified {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotModified => "not-modified",
            Self::Modified => "modified",
            Self::ModifiedNew => "modified-new",
        }
    }

    fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "not-modified" => Some(Self::NotModified),
            "modified" => Some(Self::Modified),
            "modified-new" => Some(Self::ModifiedNew),
            _ => None,
        }
    }
}

/// Reads the marker; a missing file means `NotModified`.
pub fn read_marker(fa: &dyn FileAccess, path: &Path) -> Result<DbModified> {
    if !fa.exists(path) {
        return Ok(DbModified::NotModified);
    }

    let text = std::fs::read_to_string(path)
        .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
        .wrap_err_with(|| format!("failed to read marker '{}'", path.display()))?;

    Ok(DbModified::parse(&text).unwrap_or_else(|| {
        warn!(path = %path.display(), content = %text.trim(), "unrecognized marker value");
        DbModified::NotModified
    }))
}

/// Writes and syncs the marker; rotation ordering depends on it being
/// durable before the renames begin.
pub fn write_marker(path: &Path, value: DbModified) -> Result<()> {
    let mut file = File::create(path)
        .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
        .wrap_err_with(|| format!("failed to create marker '{}'", path.display()))?;

    file.write_all(value.as_str().as_bytes())
        .and_then(|_| file.sync_all())
        .map_err(|e| eyre::Report::new(e).wrap_err(StoreError::FileIo))
        .wrap_err_with(|| format!("failed to write marker '{}'", path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::LocalFileAccess;

    #[test]
    fn derives_artifact_names() {
        let files = StoreFiles::new(Path::new("/db/accounts"));

        assert_eq!(files.data, Path::new("/db/accounts.data"));
        assert_eq!(files.backup, Path::new("/db/accounts.backup"));
        assert_eq!(files.data_new, Path::new("/db/accounts.data.new"));
        assert_eq!(files.backup_new, Path::new("/db/accounts.backup.new"));
        assert_eq!(files.marker, Path::new("/db/accounts.state"));
    }

    #[test]
    fn defrag_target_writes_the_staged_data_file() {
        let files = StoreFiles::new(Path::new("/db/accounts"));
        let target = files.defrag_target();

        assert_eq!(target.data, files.data_new);
    }

    #[test]
    fn marker_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.state");

        for value in [
            DbModified::NotModified,
            DbModified::Modified,
            DbModified::ModifiedNew,
        ] {
            write_marker(&path, value).unwrap();
            assert_eq!(read_marker(&LocalFileAccess, &path).unwrap(), value);
        }
    }

    #[test]
    fn missing_marker_reads_as_not_modified() {
        let dir = tempfile::tempdir().unwrap();

        let value = read_marker(&LocalFileAccess, &dir.path().join("t.state")).unwrap();

        assert_eq!(value, DbModified::NotModified);
    }

    #[test]
    fn garbage_marker_reads_as_not_modified() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.state");
        std::fs::write(&path, "??").unwrap();

        let value = read_marker(&LocalFileAccess, &path).unwrap();

        assert_eq!(value, DbModified::NotModified);
    }
}
