//! # Store Configuration
//!
//! This module centralizes the tunable surface of the persistence core. The
//! options mirror the persistent database properties that select a file
//! backend, a backup strategy, a free-space manager variant and the cache
//! ceilings. Interdependent values are derived in one place so they cannot
//! drift apart:
//!
//! ```text
//! data_file_scale (8..=1024, power of two)
//!       │
//!       ├─> cached_row_padding  = max(scale, 8)
//!       │     Every row's storage size is a multiple of this.
//!       │
//!       ├─> initial_free_pos    = max(32, scale)
//!       │     First usable byte offset after the fixed header.
//!       │
//!       └─> max_data_file_size  = i32::MAX * scale * data_file_factor
//!             Hard ceiling for the file tail pointer (overridable).
//! ```
//!
//! A [`StoreConfig`] is immutable once the store is opened; the only
//! post-open mutation of a persistent option is
//! `DataFileCache::set_increment_backup`, which rewrites the header flag
//! word under the write lock.

use eyre::{ensure, Result};

/// Permitted values of `data_file_scale`.
pub const DATA_FILE_SCALES: &[u32] = &[8, 16, 32, 64, 128, 256, 512, 1024];

/// Smallest first usable offset; the fixed header occupies `[0..32)`.
pub const MIN_INITIAL_FREE_POS: u64 = 32;

/// Shadow pages are captured at this granularity.
pub const SHADOW_PAGE_SIZE: u32 = 1 << 14;

/// The header stores the free-space root divided by this unit.
pub const FIXED_BLOCK_SIZE_UNIT: u64 = 4096;

/// Allocation granularity of the persistent free-space manager, in scale
/// units. Block-aligned allocations are aligned to this many units.
pub const FILE_BLOCK_UNITS: u64 = 1024;

/// Initial capacity of the reusable row i/o buffers.
pub const INIT_IO_BUFFER_SIZE: usize = 4096;

/// Free regions tracked before the smallest is sacrificed as lost space.
pub const MAX_FREE_REGIONS: usize = 512;

/// Upper bound accepted for a single row record; larger size prefixes are
/// treated as corruption.
pub const MAX_ROW_SIZE: u32 = 1 << 28;

/// Tunable options of a [`crate::store::DataFileCache`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Address unit: physical offset = position * scale.
    pub data_file_scale: u32,
    /// Multiplier for the maximum data file size.
    pub data_file_factor: u32,
    /// Use the memory-mapped file backend instead of buffered i/o.
    pub nio_data_file: bool,
    /// Use the incremental shadow backup instead of a compressed full backup.
    pub increment_backup: bool,
    /// Use the persistent block free-space manager.
    pub file_spaces: bool,
    /// Object-count ceiling of the row cache.
    pub max_cache_rows: usize,
    /// Byte ceiling of the row cache.
    pub max_cache_bytes: u64,
    /// Open the data file read-only; every mutation fails.
    pub readonly: bool,
    /// Explicit maximum file size; `None` derives it from scale and factor.
    pub max_data_file_size: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_file_scale: 16,
            data_file_factor: 1,
            nio_data_file: false,
            increment_backup: false,
            file_spaces: false,
            max_cache_rows: 50_000,
            max_cache_bytes: 10 * 1024 * 1024,
            readonly: false,
            max_data_file_size: None,
        }
    }
}

impl StoreConfig {
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder {
            config: Self::default(),
        }
    }

    /// Rows are padded so their storage size is a multiple of this.
    pub fn cached_row_padding(&self) -> u32 {
        self.data_file_scale.max(8)
    }

    /// First usable byte offset in the data file.
    pub fn initial_free_pos(&self) -> u64 {
        MIN_INITIAL_FREE_POS.max(self.data_file_scale as u64)
    }

    /// Hard ceiling for the file tail pointer.
    pub fn max_data_file_size(&self) -> u64 {
        self.max_data_file_size.unwrap_or_else(|| {
            i32::MAX as u64 * self.data_file_scale as u64 * self.data_file_factor as u64
        })
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            DATA_FILE_SCALES.contains(&self.data_file_scale),
            "data_file_scale {} is not one of {:?}",
            self.data_file_scale,
            DATA_FILE_SCALES
        );
        ensure!(self.data_file_factor > 0, "data_file_factor must be positive");
        ensure!(self.max_cache_rows > 0, "max_cache_rows must be positive");
        ensure!(self.max_cache_bytes > 0, "max_cache_bytes must be positive");

        Ok(())
    }
}

pub struct StoreConfigBuilder {
    config: StoreConfig,
}

impl StoreConfigBuilder {
    pub fn data_file_scale(mut self, scale: u32) -> Self {
        self.config.data_file_scale = scale;
        self
    }

    pub fn data_file_factor(mut self, factor: u32) -> Self {
        self.config.data_file_factor = factor;
        self
    }

    pub fn nio_data_file(mut self, nio: bool) -> Self {
        self.config.nio_data_file = nio;
        self
    }

    pub fn increment_backup(mut self, incremental: bool) -> Self {
        self.config.increment_backup = incremental;
        self
    }

    pub fn file_spaces(mut self, file_spaces: bool) -> Self {
        self.config.file_spaces = file_spaces;
        self
    }

    pub fn max_cache_rows(mut self, rows: usize) -> Self {
        self.config.max_cache_rows = rows;
        self
    }

    pub fn max_cache_bytes(mut self, bytes: u64) -> Self {
        self.config.max_cache_bytes = bytes;
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.config.readonly = readonly;
        self
    }

    pub fn max_data_file_size(mut self, bytes: u64) -> Self {
        self.config.max_data_file_size = Some(bytes);
        self
    }

    pub fn build(self) -> Result<StoreConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        StoreConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_odd_scale() {
        let result = StoreConfig::builder().data_file_scale(24).build();

        assert!(result.is_err());
    }

    #[test]
    fn rejects_zero_factor() {
        let result = StoreConfig::builder().data_file_factor(0).build();

        assert!(result.is_err());
    }

    #[test]
    fn padding_never_below_eight() {
        let config = StoreConfig::builder().data_file_scale(8).build().unwrap();

        assert_eq!(config.cached_row_padding(), 8);
    }

    #[test]
    fn padding_follows_large_scales() {
        let config = StoreConfig::builder().data_file_scale(256).build().unwrap();

        assert_eq!(config.cached_row_padding(), 256);
        assert_eq!(config.initial_free_pos(), 256);
    }

    #[test]
    fn max_file_size_derives_from_scale_and_factor() {
        let config = StoreConfig::builder()
            .data_file_scale(16)
            .data_file_factor(4)
            .build()
            .unwrap();

        assert_eq!(config.max_data_file_size(), i32::MAX as u64 * 16 * 4);
    }

    #[test]
    fn max_file_size_override_wins() {
        let config = StoreConfig::builder()
            .max_data_file_size(4096)
            .build()
            .unwrap();

        assert_eq!(config.max_data_file_size(), 4096);
    }
}
