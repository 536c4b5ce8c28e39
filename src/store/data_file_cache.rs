//! # Data File Cache Coordinator
//!
//! Owns the single `*.data` file of the store and everything layered on
//! it: the bounded object cache, the free-space manager, the shadow undo
//! log and the backup artifacts. All client traffic (lookups, inserts,
//! write-back, commit, recovery) goes through this type.
//!
//! ## Locking model
//!
//! One reader-writer lock guards the whole state. A lookup that hits the
//! cache runs under the read lock; pinning and access stamping are atomic
//! on the cached objects themselves. A miss escalates to the write lock,
//! re-checks the cache (another thread may have loaded the row in the
//! meantime) and only then touches the disk, because the reusable row
//! buffers are shared and the file cursor is a single resource. Every
//! mutation holds the write lock for its full duration, disk i/o
//! included; the lock is not reentrant and nothing here re-enters it.
//!
//! ## Commit cycle
//!
//! ```text
//! open ──> [writes: saved flag cleared + synced once, shadow captures
//!           originals before each overwrite] ──> commit:
//!     1. flush dirty rows through the shadow
//!     2. persist free-space chain, write header fields, set saved flag
//!     3. sync the data file
//!     4. retire the shadow, arm a fresh one
//! ```
//!
//! A crash anywhere before step 3 completes leaves the saved flag clear;
//! the next open detects that and restores from the shadow (incremental
//! mode) or the compressed backup (full mode). A crash after step 3 is a
//! committed state; the stale shadow, if any, is discarded on open.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use super::backup::{read_marker, write_marker, DbModified, StoreFiles};
use super::header::{
    HeaderFlags, INT_SPACE_LIST_POS, LONG_EMPTY_SIZE, LONG_FREE_POS_POS,
};
use super::object_cache::ObjectCache;
use super::row::{CachedObject, PersistentStore, RowInput, RowOutput, NO_POS};
use super::shadow::ShadowFile;
use super::spaces::{BlockSpaceManager, FreeSpaceManager, SimpleSpaceManager, SpaceHost};
use crate::config::{
    StoreConfig, FIXED_BLOCK_SIZE_UNIT, INIT_IO_BUFFER_SIZE, MAX_ROW_SIZE, SHADOW_PAGE_SIZE,
};
use crate::error::StoreError;
use crate::io::{
    new_discard_name, open_data_file, FileAccess, LocalFileAccess, RandomAccess, ScaledFile,
};

/// Crash-safe page store over a single data file.
pub struct DataFileCache {
    config: StoreConfig,
    files: StoreFiles,
    fa: Arc<dyn FileAccess>,
    state: RwLock<State>,
}

struct State {
    data_file: Option<Box<dyn RandomAccess>>,
    shadow: Option<ShadowFile>,
    space: Option<FreeSpaceManager>,
    cache: ObjectCache,
    scale: u32,
    initial_free_pos: u64,
    max_data_file_size: u64,
    file_free_position: u64,
    file_start_free_position: u64,
    lost_space_size: u64,
    space_manager_position: u64,
    file_modified: bool,
    cache_modified: bool,
    increment_backup: bool,
    refresh_backup_on_commit: bool,
    readonly: bool,
    store_count: i64,
    row_in: Vec<u8>,
    row_out: RowOutput,
}

/// The narrow handle free-space managers operate through; borrows just
/// the file and the tail pointer out of the state.
struct FileSpaceHost<'a> {
    file: &'a mut dyn RandomAccess,
    free_pos: &'a mut u64,
    max_size: u64,
}

impl SpaceHost for FileSpaceHost<'_> {
    fn enlarge_file_space(&mut self, delta: u64) -> Result<u64> {
        let position = *self.free_pos;

        if position + delta > self.max_size {
            error!(position, delta, max = self.max_size, "data file reached maximum size");
            return Err(eyre::Report::new(StoreError::DataFileIsFull));
        }
        if !self.file.ensure_length(position + delta)? {
            error!(position, delta, "data file cannot be enlarged");
            return Err(eyre::Report::new(StoreError::DataFileIsFull));
        }

        *self.free_pos = position + delta;
        Ok(position)
    }

    fn file_free_position(&self) -> u64 {
        *self.free_pos
    }

    fn retract_file_space(&mut self, new_tail: u64) {
        *self.free_pos = new_tail;
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(offset)?;
        self.file.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(offset)?;
        self.file.write_all(buf)
    }
}

impl State {
    fn new(config: &StoreConfig) -> Self {
        Self {
            data_file: None,
            shadow: None,
            space: None,
            cache: ObjectCache::new(config.max_cache_rows, config.max_cache_bytes),
            scale: config.data_file_scale,
            initial_free_pos: config.initial_free_pos(),
            max_data_file_size: config.max_data_file_size(),
            file_free_position: config.initial_free_pos(),
            file_start_free_position: config.initial_free_pos(),
            lost_space_size: 0,
            space_manager_position: 0,
            file_modified: false,
            cache_modified: false,
            increment_backup: config.increment_backup,
            refresh_backup_on_commit: true,
            readonly: config.readonly,
            store_count: 0,
            row_in: Vec::with_capacity(INIT_IO_BUFFER_SIZE),
            row_out: RowOutput::new(INIT_IO_BUFFER_SIZE),
        }
    }

    fn file(&mut self) -> Result<&mut (dyn RandomAccess + '_)> {
        match self.data_file.as_deref_mut() {
            Some(file) => Ok(file),
            None => Err(eyre::eyre!("data file is not open")),
        }
    }

    fn with_space<R>(
        &mut self,
        f: impl FnOnce(&mut FreeSpaceManager, &mut dyn SpaceHost) -> Result<R>,
    ) -> Result<R> {
        let mut space = match self.space.take() {
            Some(space) => space,
            None => return Err(eyre::eyre!("free-space manager is not open")),
        };

        let result = match self.data_file.as_deref_mut() {
            Some(file) => {
                let mut host = FileSpaceHost {
                    file,
                    free_pos: &mut self.file_free_position,
                    max_size: self.max_data_file_size,
                };
                f(&mut space, &mut host)
            }
            None => Err(eyre::eyre!("data file is not open")),
        };

        self.space = Some(space);
        result
    }

    /// Header and flag initialisation of a brand-new data file.
    fn init_new_file(&mut self) -> Result<()> {
        self.file_free_position = self.initial_free_pos;
        self.file_start_free_position = self.initial_free_pos;
        self.lost_space_size = 0;
        self.space_manager_position = 0;

        let increment = self.increment_backup;
        let free_pos = self.file_free_position;
        let file = self.file()?;

        file.seek(LONG_FREE_POS_POS)?;
        file.write_u64(free_pos)?;

        let mut flags = HeaderFlags::new()
            .with(HeaderFlags::IS_SAVED)
            .with(HeaderFlags::V_NEW);
        if increment {
            flags = flags.with(HeaderFlags::IS_SHADOWED);
        }
        flags.store(file)?;
        file.sync()?;

        Ok(())
    }

    /// Arms the undo log for the coming commit cycle. Nothing is written
    /// until the first copy; an empty file needs no undo at all.
    fn open_shadow_file(&mut self, backup_path: &Path) {
        if self.increment_backup && self.file_free_position != self.initial_free_pos {
            self.shadow = Some(ShadowFile::new(
                backup_path.to_path_buf(),
                self.file_free_position,
                SHADOW_PAGE_SIZE,
            ));
        }
    }

    /// Clears the saved flag ahead of the first payload write of the
    /// cycle, with a barrier. Best-effort: a failure is logged and left
    /// for the next write to retry, never propagated.
    fn set_file_modified(&mut self) {
        if self.file_modified || self.readonly {
            return;
        }

        let result: Result<()> = (|| {
            let file = self
                .data_file
                .as_deref_mut()
                .ok_or_else(|| eyre::eyre!("data file is not open"))?;
            let flags = HeaderFlags::load(file)?.without(HeaderFlags::IS_SAVED);
            flags.store(file)?;
            file.sync()?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                debug!("saved flag cleared for this commit cycle");
                self.file_modified = true;
            }
            Err(e) => debug!(error = ?e, "could not clear saved flag"),
        }
    }

    fn copy_shadow(&mut self, rows: &[Arc<dyn CachedObject>]) -> Result<()> {
        let Some(shadow) = self.shadow.as_mut() else {
            return Ok(());
        };
        let file = self
            .data_file
            .as_deref_mut()
            .ok_or_else(|| eyre::eyre!("data file is not open"))?;

        for row in rows {
            let offset = row
                .pos()
                .checked_mul(self.scale as u64)
                .ok_or_else(|| eyre::Report::new(StoreError::DataFile))?;
            shadow.copy(file, offset, row.storage_size())?;
        }
        shadow.sync()?;
        debug!(saved = shadow.saved_length(), "shadow synced");

        Ok(())
    }

    fn save_row_no_lock(&mut self, row: &Arc<dyn CachedObject>) -> Result<()> {
        self.row_out.reset();
        self.row_out.reserve_for(row.storage_size());
        row.write(&mut self.row_out)?;
        ensure!(
            self.row_out.len() == row.storage_size() as usize,
            StoreError::DataFile
        );

        let offset = row
            .pos()
            .checked_mul(self.scale as u64)
            .ok_or_else(|| eyre::Report::new(StoreError::DataFile))?;
        let file = self
            .data_file
            .as_deref_mut()
            .ok_or_else(|| eyre::eyre!("data file is not open"))?;
        file.seek(offset)?;
        file.write_all(self.row_out.bytes())?;

        row.set_changed(false);
        Ok(())
    }

    /// Write-back protocol: originals into the shadow, saved flag
    /// cleared, then the new images, sequential in file order.
    fn save_rows(&mut self, rows: &[Arc<dyn CachedObject>]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        self.copy_shadow(rows)?;
        self.set_file_modified();
        for row in rows {
            self.save_row_no_lock(row)?;
        }

        Ok(())
    }

    fn save_all_rows(&mut self) -> Result<()> {
        let dirty = self.cache.dirty_snapshot_sorted();
        self.save_rows(&dirty)
    }

    /// Insert honouring the cache ceilings: over-limit inserts first run
    /// a cleanup pass that saves and evicts the oldest unpinned third.
    fn cache_put(&mut self, object: Arc<dyn CachedObject>) -> Result<()> {
        if self.cache.needs_clean_up(object.storage_size()) {
            self.clean_up(object.storage_size())?;
        }
        self.cache.put(object);
        Ok(())
    }

    fn clean_up(&mut self, incoming_size: u32) -> Result<()> {
        let batch = self.cache.cleanup_batch();
        let mut dirty: Vec<Arc<dyn CachedObject>> = batch
            .iter()
            .filter(|o| o.has_changed())
            .cloned()
            .collect();
        dirty.sort_by_key(|o| o.pos());

        self.save_rows(&dirty)?;
        let evicted = self.cache.evict_batch(&batch, 1, incoming_size as u64);
        debug!(evicted, remaining = self.cache.size(), "cache cleanup pass");

        Ok(())
    }

    /// Saves and drops every unpinned entry.
    fn force_clean_up(&mut self) -> Result<()> {
        let unpinned = self.cache.unpinned();
        let mut dirty: Vec<Arc<dyn CachedObject>> = unpinned
            .iter()
            .filter(|o| o.has_changed())
            .cloned()
            .collect();
        dirty.sort_by_key(|o| o.pos());
        self.save_rows(&dirty)?;

        for object in &unpinned {
            self.cache.remove(object.pos());
        }
        debug!(dropped = unpinned.len(), "forced cache purge");

        Ok(())
    }

    /// Reads the record at `pos` into the shared input buffer and returns
    /// its size. With `size` absent the 4-byte prefix is read first.
    fn read_object(&mut self, pos: u64, size: Option<u32>) -> Result<u32> {
        let offset = pos
            .checked_mul(self.scale as u64)
            .ok_or_else(|| eyre::Report::new(StoreError::DataFile))?;

        let file = self
            .data_file
            .as_deref_mut()
            .ok_or_else(|| eyre::eyre!("data file is not open"))?;
        file.seek(offset)?;

        let (size, prefix_consumed) = match size {
            Some(size) => (size, false),
            None => (
                file.read_u32().wrap_err(StoreError::DataFile)?,
                true,
            ),
        };
        ensure!(size >= 8 && size <= MAX_ROW_SIZE, StoreError::DataFile);

        // buffer growth is the allocation-heavy step; failure here feeds
        // the one-shot purge-and-retry in the read path
        if self.row_in.len() < size as usize {
            let additional = size as usize - self.row_in.len();
            self.row_in
                .try_reserve(additional)
                .map_err(|_| eyre::Report::new(StoreError::OutOfMemory))?;
            self.row_in.resize(size as usize, 0);
        }

        let file = self
            .data_file
            .as_deref_mut()
            .ok_or_else(|| eyre::eyre!("data file is not open"))?;
        if prefix_consumed {
            self.row_in[..4].copy_from_slice(&size.to_be_bytes());
            file.read_exact(&mut self.row_in[4..size as usize])
                .wrap_err(StoreError::DataFile)?;
        } else {
            file.read_exact(&mut self.row_in[..size as usize])
                .wrap_err(StoreError::DataFile)?;
        }

        Ok(size)
    }

    fn materialise(
        &mut self,
        pos: u64,
        size: Option<u32>,
        store: &dyn PersistentStore,
    ) -> Result<Option<Arc<dyn CachedObject>>> {
        let size = self.read_object(pos, size)?;
        let mut input = RowInput::new(pos, size, &self.row_in[..size as usize]);
        store.get(&mut input)
    }
}

impl DataFileCache {
    /// Creates a closed store for `<base>.data`; nothing touches the disk
    /// until [`open`](Self::open).
    pub fn new(base: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let files = StoreFiles::new(base.as_ref());
        Ok(Self::with_files(files, config, true))
    }

    pub(crate) fn with_files(files: StoreFiles, config: StoreConfig, refresh_backup: bool) -> Self {
        let mut state = State::new(&config);
        state.refresh_backup_on_commit = refresh_backup;

        Self {
            config,
            files,
            fa: Arc::new(LocalFileAccess),
            state: RwLock::new(state),
        }
    }

    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn files(&self) -> &StoreFiles {
        &self.files
    }

    pub(crate) fn file_access(&self) -> &dyn FileAccess {
        self.fa.as_ref()
    }

    /// Opens the data file, running crash recovery if the header demands
    /// it, and builds the free-space manager the header describes.
    pub fn open(&self) -> Result<()> {
        let mut state = self.state.write();
        ensure!(state.data_file.is_none(), "data file cache is already open");

        info!(file = %self.files.data.display(), "data file cache open start");

        if let Err(e) = self.open_locked(&mut state) {
            error!(error = ?e, file = %self.files.data.display(), "data file cache open failed");
            self.close_locked(&mut state, false).ok();
            return Err(e.wrap_err(format!(
                "failed to open data file cache '{}'",
                self.files.data.display()
            )));
        }

        info!("data file cache open end");
        Ok(())
    }

    fn open_locked(&self, state: &mut State) -> Result<()> {
        self.recover_staged_files()?;

        state.increment_backup = self.config.increment_backup;
        state.file_free_position = state.initial_free_pos;
        state.file_start_free_position = state.initial_free_pos;

        if self.config.readonly {
            return self.open_readonly_locked(state);
        }

        let mut preexists = self.fa.exists(&self.files.data);
        let mut is_incremental = self.config.increment_backup;
        let mut is_saved = false;

        if preexists {
            let mut peek = ScaledFile::open(&self.files.data, true)?;
            let length = peek.length()?;
            let mut wrong_version = false;

            if length > state.initial_free_pos {
                let flags = HeaderFlags::load(&mut peek)?;
                is_saved = flags.contains(HeaderFlags::IS_SAVED);
                is_incremental = flags.contains(HeaderFlags::IS_SHADOWED);
                wrong_version = flags.contains(HeaderFlags::WRONG_VERSION);
            }
            drop(peek);

            if length > state.max_data_file_size {
                return Err(eyre::Report::new(StoreError::WrongDatabaseVersion)
                    .wrap_err("data file requires large file support"));
            }
            if wrong_version {
                return Err(eyre::Report::new(StoreError::WrongDatabaseVersion));
            }
        }

        if is_saved {
            if is_incremental {
                // commit syncs the header before retiring the shadow, so a
                // shadow next to a saved file is a stale leftover
                self.delete_backup()?;
            } else if !self.fa.exists(&self.files.backup) {
                // full-backup mode recovers to the state observed now
                self.backup_data_file(false)?;
                self.rename_backup_file()?;
            }
        } else {
            preexists = if is_incremental {
                self.restore_backup_incremental()?
            } else {
                self.restore_backup()?
            };
        }

        let file = open_data_file(&self.files.data, false, self.config.nio_data_file)?;
        state.data_file = Some(file);

        if preexists {
            let file = state.file()?;
            file.seek(LONG_EMPTY_SIZE)?;
            let lost_space_size = file.read_u64()?;
            file.seek(LONG_FREE_POS_POS)?;
            let file_free_position = file.read_u64()?;
            file.seek(INT_SPACE_LIST_POS)?;
            let space_root = file.read_u32()? as u64 * FIXED_BLOCK_SIZE_UNIT;

            state.lost_space_size = lost_space_size;
            state.file_free_position = file_free_position;
            state.file_start_free_position = file_free_position;
            state.space_manager_position = space_root;
            state.open_shadow_file(&self.files.backup);
        } else {
            state.init_new_file()?;
        }

        state.file_modified = false;
        state.cache_modified = false;

        let scale = state.scale;
        let lost = state.lost_space_size;
        let root = state.space_manager_position;
        let manager = if root != 0 {
            let manager = {
                let file = state
                    .data_file
                    .as_deref_mut()
                    .ok_or_else(|| eyre::eyre!("data file is not open"))?;
                let mut host = FileSpaceHost {
                    file,
                    free_pos: &mut state.file_free_position,
                    max_size: state.max_data_file_size,
                };
                BlockSpaceManager::open(scale, lost, root, &mut host)?
            };
            FreeSpaceManager::Blocks(manager)
        } else if self.config.file_spaces {
            FreeSpaceManager::Blocks(BlockSpaceManager::new(scale, lost))
        } else {
            FreeSpaceManager::Simple(SimpleSpaceManager::new(scale, lost))
        };
        state.space = Some(manager);

        Ok(())
    }

    fn open_readonly_locked(&self, state: &mut State) -> Result<()> {
        ensure!(
            self.fa.exists(&self.files.data),
            "data file '{}' does not exist",
            self.files.data.display()
        );

        let mut file = open_data_file(&self.files.data, true, false)?;

        if file.length()? > state.initial_free_pos {
            let flags = HeaderFlags::load(file.as_mut())?;
            if flags.contains(HeaderFlags::WRONG_VERSION) {
                return Err(eyre::Report::new(StoreError::WrongDatabaseVersion));
            }
            file.seek(LONG_FREE_POS_POS)?;
            state.file_free_position = file.read_u64()?;
            state.file_start_free_position = state.file_free_position;
            file.seek(INT_SPACE_LIST_POS)?;
            state.space_manager_position = file.read_u32()? as u64 * FIXED_BLOCK_SIZE_UNIT;
        }

        state.data_file = Some(file);
        state.space = Some(FreeSpaceManager::Simple(SimpleSpaceManager::new(
            state.scale,
            0,
        )));

        Ok(())
    }

    /// Completes a rotation that crashed between marker writes, or clears
    /// staging leftovers from an abandoned one.
    fn recover_staged_files(&self) -> Result<()> {
        match read_marker(self.fa.as_ref(), &self.files.marker)? {
            DbModified::ModifiedNew => {
                info!("completing interrupted file rotation");
                self.rename_backup_file()?;
                self.rename_data_file()?;
                write_marker(&self.files.marker, DbModified::NotModified)?;
            }
            _ => {
                if self.fa.exists(&self.files.data_new) {
                    warn!(file = %self.files.data_new.display(), "removing stale staging file");
                    self.fa.remove(&self.files.data_new)?;
                }
                if self.fa.exists(&self.files.backup_new) {
                    warn!(file = %self.files.backup_new.display(), "removing stale staging file");
                    self.fa.remove(&self.files.backup_new)?;
                }
            }
        }
        Ok(())
    }

    /// Restores the data file from the compressed full backup. The data
    /// file is reset first; without a backup the caller starts fresh.
    fn restore_backup(&self) -> Result<bool> {
        self.delete_data_file()?;

        if self.fa.exists(&self.files.backup) {
            info!(backup = %self.files.backup.display(), "restoring data file from full backup");
            self.fa.unarchive(&self.files.backup, &self.files.data)?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Replays and deletes the shadow log, restoring the pre-crash
    /// committed state.
    fn restore_backup_incremental(&self) -> Result<bool> {
        if self.fa.exists(&self.files.backup) {
            info!(backup = %self.files.backup.display(), "replaying incremental backup");
            ShadowFile::restore_file(self.fa.as_ref(), &self.files.backup, &self.files.data)?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Archives the data file (or the staged one) to `B.backup.new`. In
    /// incremental mode there is nothing to archive; a stale backup is
    /// removed instead.
    fn backup_data_file(&self, staged_source: bool) -> Result<()> {
        if self.config.increment_backup {
            if self.fa.exists(&self.files.backup) {
                self.delete_backup()?;
            }
            return Ok(());
        }

        let source = if staged_source {
            &self.files.data_new
        } else {
            &self.files.data
        };
        if self.fa.exists(source) {
            debug!(source = %source.display(), "archiving data file");
            self.fa.archive(source, &self.files.backup_new)?;
        }

        Ok(())
    }

    fn rename_backup_file(&self) -> Result<()> {
        if self.config.increment_backup {
            return self.delete_backup();
        }

        if self.fa.exists(&self.files.backup_new) {
            self.delete_backup()?;
            self.fa.rename(&self.files.backup_new, &self.files.backup)?;
        }

        Ok(())
    }

    fn rename_data_file(&self) -> Result<()> {
        if self.fa.exists(&self.files.data_new) {
            self.delete_data_file()?;
            self.fa.rename(&self.files.data_new, &self.files.data)?;
        }

        Ok(())
    }

    /// Removes the data file; if the filesystem refuses, the file is
    /// moved aside under a discard name so the path becomes free.
    fn delete_data_file(&self) -> Result<()> {
        self.fa.remove(&self.files.data)?;

        if self.fa.exists(&self.files.data) {
            let discard = new_discard_name(&self.files.data);
            warn!(
                file = %self.files.data.display(),
                discard = %discard.display(),
                "data file could not be deleted; moving aside"
            );
            self.fa.rename(&self.files.data, &discard)?;
        }

        Ok(())
    }

    fn delete_backup(&self) -> Result<()> {
        self.fa.remove(&self.files.backup)
    }

    /// Flushes dirty rows, persists the header and free-space state, syncs
    /// and marks the file saved. Afterwards the shadow of the finished
    /// cycle is discarded and a fresh one armed.
    pub fn commit_changes(&self) -> Result<()> {
        let mut state = self.state.write();
        self.commit_locked(&mut state)
    }

    fn commit_locked(&self, state: &mut State) -> Result<()> {
        if state.readonly || state.data_file.is_none() {
            return Ok(());
        }

        info!("data file cache commit start");
        let result = self.commit_inner(state);
        if let Err(e) = &result {
            error!(error = ?e, "data file cache commit failed");
        } else {
            debug!("data file cache commit end");
        }
        result
    }

    fn commit_inner(&self, state: &mut State) -> Result<()> {
        state.save_all_rows()?;

        let space_modified = state
            .space
            .as_ref()
            .map(|s| s.is_modified())
            .unwrap_or(false);
        let wrote = state.file_modified || space_modified;

        if wrote {
            let root = state.with_space(|space, host| space.persist(host))?;
            state.space_manager_position = root;
            state.lost_space_size = state
                .space
                .as_ref()
                .map(|s| s.lost_blocks_size())
                .unwrap_or(0);

            let lost = state.lost_space_size;
            let free_pos = state.file_free_position;
            let space_root = (state.space_manager_position / FIXED_BLOCK_SIZE_UNIT) as u32;

            let file = state.file()?;
            file.seek(LONG_EMPTY_SIZE)?;
            file.write_u64(lost)?;
            file.seek(LONG_FREE_POS_POS)?;
            file.write_u64(free_pos)?;
            file.seek(INT_SPACE_LIST_POS)?;
            file.write_u32(space_root)?;

            let flags = HeaderFlags::load(file)?.with(HeaderFlags::IS_SAVED);
            flags.store(file)?;
        }

        state.file()?.sync()?;
        state.file_modified = false;
        state.cache_modified = false;
        state.file_start_free_position = state.file_free_position;

        // retire this cycle's undo log, arm the next one
        if let Some(mut shadow) = state.shadow.take() {
            shadow.close();
        }
        if state.increment_backup {
            self.fa.remove(&self.files.backup)?;
            state.open_shadow_file(&self.files.backup);
        } else if wrote && state.refresh_backup_on_commit {
            self.backup_data_file(false)?;
            self.rename_backup_file()?;
        }

        Ok(())
    }

    /// Writes out dirty cached rows without committing the header; the
    /// file stays in the unsaved state until [`commit_changes`].
    ///
    /// [`commit_changes`]: Self::commit_changes
    pub fn save_all(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.readonly {
            return Ok(());
        }
        state.save_all_rows()
    }

    /// Orderly (`write = true`) or fast close. The fast close never
    /// propagates an error: it logs and carries on, so shutdown paths can
    /// always rely on it.
    pub fn close(&self, write: bool) -> Result<()> {
        let mut state = self.state.write();
        self.close_locked(&mut state, write)
    }

    fn close_locked(&self, state: &mut State, write: bool) -> Result<()> {
        if state.data_file.is_none() {
            return Ok(());
        }

        if write {
            self.commit_locked(state)?;
        } else if let Some(mut shadow) = state.shadow.take() {
            // the shadow handle is dropped; the log stays for the next
            // open to replay
            shadow.close();
        }

        let close_result = state.file().and_then(|f| f.close());
        state.data_file = None;
        state.space = None;
        state.shadow = None;
        state.cache.clear();

        match close_result {
            Ok(()) => debug!("data file closed"),
            Err(e) if write => {
                return Err(e).wrap_err("failed to close data file");
            }
            Err(e) => warn!(error = ?e, "ignored failure during fast close"),
        }

        if write && !state.readonly && state.file_free_position == state.initial_free_pos {
            // nothing stored; leave no artifacts behind
            self.delete_data_file()?;
            self.delete_backup()?;
        }

        Ok(())
    }

    /// Allocates file space for the object and stamps the position on it.
    pub fn set_file_pos(&self, object: &Arc<dyn CachedObject>, as_block: bool) -> Result<u64> {
        let mut state = self.state.write();
        ensure!(!state.readonly, "read-only data file cache");

        let size = object.storage_size();
        let pos = state.with_space(|space, host| space.get_file_position(size, as_block, host))?;
        object.set_pos(pos);

        Ok(pos)
    }

    /// Admits an object into the cache. The object must already carry its
    /// file position.
    pub fn add(&self, object: &Arc<dyn CachedObject>) -> Result<()> {
        let mut state = self.state.write();
        ensure!(!state.readonly, "read-only data file cache");
        ensure!(object.pos() != NO_POS, "object has no file position");

        state.cache_modified = true;
        let size = object.storage_size();
        state.cache_put(Arc::clone(object))?;
        state.row_out.reserve_for(size);

        Ok(())
    }

    /// Replaces the cached object at its position.
    pub fn replace(&self, object: &Arc<dyn CachedObject>) -> Result<()> {
        let mut state = self.state.write();
        ensure!(!state.readonly, "read-only data file cache");

        state.cache_modified = true;
        state.cache.replace(object.pos(), Arc::clone(object));

        Ok(())
    }

    /// Writes one row through the shadow protocol immediately.
    pub fn save_row(&self, row: &Arc<dyn CachedObject>) -> Result<()> {
        let mut state = self.state.write();
        ensure!(!state.readonly, "read-only data file cache");

        let result = (|| {
            state.copy_shadow(std::slice::from_ref(row))?;
            state.set_file_modified();
            state.save_row_no_lock(row)
        })();

        if let Err(e) = &result {
            error!(pos = row.pos(), error = ?e, "save row failed");
        }
        result
    }

    /// Looks up the object at `pos`, reading and materialising it through
    /// `store` on a cache miss. `size` short-circuits the prefix read when
    /// the caller already knows the record length. `keep` pins the result.
    pub fn get(
        &self,
        pos: u64,
        size: Option<u32>,
        store: &dyn PersistentStore,
        keep: bool,
    ) -> Result<Option<Arc<dyn CachedObject>>> {
        {
            let state = self.state.read();
            if let Some(object) = state.cache.get(pos) {
                if keep {
                    object.keep_in_memory(true);
                }
                return Ok(Some(object));
            }
        }

        self.get_from_file(pos, size, store, keep)
    }

    /// Fast path for a handle that may already be resident.
    pub fn get_object(
        &self,
        object: &Arc<dyn CachedObject>,
        store: &dyn PersistentStore,
        keep: bool,
    ) -> Result<Option<Arc<dyn CachedObject>>> {
        if object.is_in_memory() {
            if keep {
                object.keep_in_memory(true);
            }
            return Ok(Some(Arc::clone(object)));
        }
        if object.pos() == NO_POS {
            return Ok(None);
        }

        self.get(object.pos(), None, store, keep)
    }

    fn get_from_file(
        &self,
        pos: u64,
        size: Option<u32>,
        store: &dyn PersistentStore,
        keep: bool,
    ) -> Result<Option<Arc<dyn CachedObject>>> {
        let mut state = self.state.write();

        // double-checked: another thread may have loaded it between our
        // read unlock and write lock
        if let Some(object) = state.cache.get(pos) {
            if keep {
                object.keep_in_memory(true);
            }
            return Ok(Some(object));
        }

        let mut retried = false;
        let object = loop {
            match state.materialise(pos, size, store) {
                Ok(object) => break object,
                Err(e)
                    if !retried && StoreError::of(&e) == Some(StoreError::OutOfMemory) =>
                {
                    warn!(pos, "out of memory materialising row; purging cache and retrying");
                    state.force_clean_up()?;
                    retried = true;
                }
                Err(e) => {
                    error!(pos, error = ?e, "get from file failed");
                    return Err(e);
                }
            }
        };

        let Some(object) = object else {
            return Ok(None);
        };

        state.cache_put(Arc::clone(&object))?;
        if keep {
            object.keep_in_memory(true);
        }
        store.set(&object)?;

        Ok(Some(object))
    }

    /// Record size at `pos`: from the cache when resident, otherwise read
    /// off the size prefix.
    pub fn get_storage_size(&self, pos: u64) -> Result<u32> {
        {
            let state = self.state.read();
            if let Some(object) = state.cache.get(pos) {
                return Ok(object.storage_size());
            }
        }

        let mut state = self.state.write();
        if let Some(object) = state.cache.get(pos) {
            return Ok(object.storage_size());
        }

        let offset = pos
            .checked_mul(state.scale as u64)
            .ok_or_else(|| eyre::Report::new(StoreError::DataFile))?;
        let file = state.file()?;
        file.seek(offset)?;
        file.read_u32().wrap_err(StoreError::DataFile)
    }

    /// Unpins the object at `pos`.
    pub fn release(&self, pos: u64) -> Option<Arc<dyn CachedObject>> {
        let state = self.state.write();
        state.cache.release(pos)
    }

    /// Drops the object from the cache and returns its file space.
    pub fn remove(&self, object: &Arc<dyn CachedObject>) -> Result<()> {
        let mut state = self.state.write();
        ensure!(!state.readonly, "read-only data file cache");

        let pos = object.pos();
        let size = object.storage_size();
        state.cache.remove(pos);
        state.with_space(|space, host| {
            space.release(pos, size, host);
            Ok(())
        })?;

        Ok(())
    }

    /// Evicts every cached object with `start <= pos < limit`.
    pub fn release_range(&self, start: u64, limit: u64) {
        let mut state = self.state.write();
        for pos in state.cache.positions_in_range(start, limit) {
            state.cache.remove(pos);
        }
    }

    /// Saves and drops all unpinned cached objects.
    pub fn force_clean_up(&self) -> Result<()> {
        let mut state = self.state.write();
        state.force_clean_up()
    }

    /// Flips the incremental-backup header flag. Best-effort like the
    /// saved-flag maintenance: failures are logged, never surfaced. The
    /// existing backup artifact is removed because its format no longer
    /// matches the mode.
    pub fn set_increment_backup(&self, value: bool) {
        let mut state = self.state.write();
        if state.readonly || state.data_file.is_none() {
            return;
        }

        let result: Result<()> = (|| {
            let file = state
                .data_file
                .as_deref_mut()
                .ok_or_else(|| eyre::eyre!("data file is not open"))?;
            let flags = HeaderFlags::load(file)?;
            let flags = if value {
                flags.with(HeaderFlags::IS_SHADOWED)
            } else {
                flags.without(HeaderFlags::IS_SHADOWED)
            };
            flags.store(file)?;
            file.sync()?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                state.increment_backup = value;
                state.file_modified = true;
                if let Some(mut shadow) = state.shadow.take() {
                    shadow.close();
                }
                if let Err(e) = self.fa.remove(&self.files.backup) {
                    warn!(error = ?e, "could not remove backup after mode switch");
                }
                debug!(incremental = value, "backup mode switched");
            }
            Err(e) => error!(error = ?e, "could not switch backup mode"),
        }
    }

    /// Raw header flag word; diagnostic, best-effort, 0 on failure.
    pub fn get_flags(&self) -> u32 {
        let mut state = self.state.write();
        match state.file().and_then(|file| HeaderFlags::load(file)) {
            Ok(flags) => flags.bits(),
            Err(e) => {
                debug!(error = ?e, "could not read header flags");
                0
            }
        }
    }

    /// Bookkeeping for attached row stores; carries no shutdown
    /// semantics.
    pub fn adjust_store_count(&self, delta: i64) {
        let mut state = self.state.write();
        state.store_count += delta;
    }

    pub fn store_count(&self) -> i64 {
        self.state.read().store_count
    }

    pub fn capacity(&self) -> usize {
        self.config.max_cache_rows
    }

    pub fn bytes_capacity(&self) -> u64 {
        self.config.max_cache_bytes
    }

    pub fn total_cached_block_size(&self) -> u64 {
        self.state.read().cache.total_cached_block_size()
    }

    pub fn lost_block_size(&self) -> u64 {
        let state = self.state.read();
        state
            .space
            .as_ref()
            .map(|s| s.lost_blocks_size())
            .unwrap_or(state.lost_space_size)
    }

    pub fn free_block_count(&self) -> u64 {
        self.state
            .read()
            .space
            .as_ref()
            .map(|s| s.free_block_count())
            .unwrap_or(0)
    }

    pub fn total_free_block_size(&self) -> u64 {
        self.state
            .read()
            .space
            .as_ref()
            .map(|s| s.free_block_size())
            .unwrap_or(0)
    }

    pub fn file_free_pos(&self) -> u64 {
        self.state.read().file_free_position
    }

    pub fn file_start_free_pos(&self) -> u64 {
        self.state.read().file_start_free_position
    }

    pub fn cached_object_count(&self) -> usize {
        self.state.read().cache.size()
    }

    pub fn access_count(&self) -> u64 {
        self.state.read().cache.increment_access_count()
    }

    pub fn file_name(&self) -> &Path {
        &self.files.data
    }

    pub fn backup_file_name(&self) -> &Path {
        &self.files.backup
    }

    pub fn data_file_scale(&self) -> u32 {
        self.config.data_file_scale
    }

    pub fn is_file_modified(&self) -> bool {
        self.state.read().file_modified
    }

    pub fn is_modified(&self) -> bool {
        self.state.read().cache_modified
    }

    pub fn is_file_open(&self) -> bool {
        self.state.read().data_file.is_some()
    }

    pub fn is_data_read_only(&self) -> bool {
        self.config.readonly
    }

    pub(crate) fn marker_path(&self) -> &PathBuf {
        &self.files.marker
    }

    pub(crate) fn backup_for_defrag(&self) -> Result<()> {
        self.backup_data_file(true)
    }

    pub(crate) fn rotate_staged_files(&self) -> Result<()> {
        self.rename_backup_file()?;
        self.rename_data_file()
    }
}
