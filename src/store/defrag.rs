//! # Defragmentation
//!
//! A one-shot pass that rebuilds the data file with compacted row
//! positions. The store cannot enumerate live rows itself (the free-space
//! manager knows what is free, not what is used), so the copy is driven by
//! an external [`DefragPass`] that owns row enumeration and keeps the map
//! from old to new positions for its index roots.
//!
//! ## Rotation protocol
//!
//! ```text
//! 1. flush dirty rows
//! 2. pass writes the compacted store into B.data.new
//! 3. close both stores
//! 4. full-backup mode: archive B.data.new as B.backup.new
//! 5. marker := modified-new           (rotation is now committed)
//! 6. rename B.backup.new -> B.backup, B.data.new -> B.data
//! 7. marker := not-modified
//! 8. reopen, marker := modified
//! ```
//!
//! A crash before step 5 abandons the staging files (the next open removes
//! them); a crash after it finds `modified-new` and finishes the renames
//! before reading the header. Either way exactly one complete data file
//! survives.

use eyre::{ensure, Result, WrapErr};
use tracing::{info, warn};

use super::backup::{write_marker, DbModified};
use super::data_file_cache::DataFileCache;

/// External pass copying live rows from `source` into `target`.
///
/// The pass uses the ordinary public surface of both stores (`get`,
/// `set_file_pos`, `add`); neither store's lock is held between its
/// calls.
pub trait DefragPass {
    fn process(&mut self, source: &DataFileCache, target: &DataFileCache) -> Result<()>;
}

impl DataFileCache {
    /// Rewrites the data file through `pass` and swaps it into place,
    /// leaving the store reopened on the compacted file.
    pub fn defrag(&self, pass: &mut dyn DefragPass) -> Result<()> {
        ensure!(self.is_file_open(), "data file cache is not open");
        ensure!(!self.is_data_read_only(), "read-only data file cache");

        info!(file = %self.file_name().display(), "defragmentation start");
        self.save_all()?;

        let target = self.new_defrag_target();
        target.open()?;

        if let Err(e) = pass.process(self, &target) {
            warn!(error = ?e, "defragmentation pass abandoned");
            target.close(false).ok();
            if let Err(cleanup) = self.file_access().remove(target.file_name()) {
                warn!(error = ?cleanup, "could not remove abandoned staging file");
            }
            return Err(e).wrap_err("defragmentation pass failed");
        }

        target.close(true)?;
        self.close(true)?;

        if !self.config().increment_backup {
            self.backup_for_defrag()?;
        }

        write_marker(self.marker_path(), DbModified::ModifiedNew)?;
        self.rotate_staged_files()?;
        write_marker(self.marker_path(), DbModified::NotModified)?;

        self.open()?;
        write_marker(self.marker_path(), DbModified::Modified)?;

        info!("defragmentation end");
        Ok(())
    }

    /// The temporary store the pass writes into: same layout options,
    /// modest cache ceilings, no backup maintenance of its own.
    fn new_defrag_target(&self) -> DataFileCache {
        let mut config = self.config().clone();
        config.max_cache_rows = 1024;
        config.max_cache_bytes = 4 * 1024 * 1024;
        config.increment_backup = false;
        config.readonly = false;

        DataFileCache::with_files(self.files().defrag_target(), config, false)
    }
}
