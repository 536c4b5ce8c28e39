//! # Row I/O and Cached Object Contracts
//!
//! The page store treats row content as opaque bytes. A row record on disk
//! is a 4-byte big-endian size prefix (counting itself) followed by the
//! payload, padded so the total is a multiple of the configured row
//! padding. Decoding those bytes into live objects is the business of a
//! [`PersistentStore`] collaborator; the store only moves records between
//! the file, the shadow log and the object cache.
//!
//! [`RowInput`] and [`RowOutput`] are the two views of the coordinator's
//! reusable i/o buffers. They are only ever used under the write lock, so
//! one buffer of each per store instance is enough.
//!
//! [`CachedObject`] state (position, pin count, dirty flag, residency) is
//! atomic: cache hits run under the read lock and still need to pin and
//! stamp objects, the same way the pin protocol works in a sharded page
//! cache.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};

use crate::error::StoreError;

/// Size of the leading record length field.
pub const ROW_SIZE_PREFIX: u32 = 4;

/// Position of an object that has not been assigned file space yet.
pub const NO_POS: u64 = u64::MAX;

/// Rounds a raw record length up to the storage padding.
pub fn padded_size(payload_len: usize, padding: u32) -> u32 {
    let raw = ROW_SIZE_PREFIX as usize + payload_len;
    (raw.div_ceil(padding as usize) * padding as usize) as u32
}

/// Read view of one row record.
///
/// `buf` holds the complete record including the size prefix; the typed
/// readers start after the prefix and advance a cursor.
pub struct RowInput<'a> {
    pos: u64,
    size: u32,
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> RowInput<'a> {
    pub fn new(pos: u64, size: u32, buf: &'a [u8]) -> Self {
        debug_assert!(buf.len() >= size as usize);
        Self {
            pos,
            size,
            buf,
            cursor: ROW_SIZE_PREFIX as usize,
        }
    }

    /// Scaled position this record was read from.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Total record size including prefix and padding.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Record bytes after the size prefix, padding included.
    pub fn payload(&self) -> &'a [u8] {
        &self.buf[ROW_SIZE_PREFIX as usize..self.size as usize]
    }

    pub fn remaining(&self) -> usize {
        self.size as usize - self.cursor
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().expect("4-byte slice")))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_be_bytes(bytes.try_into().expect("8-byte slice")))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        ensure!(
            self.cursor + len <= self.size as usize,
            StoreError::DataFile
        );
        let bytes = &self.buf[self.cursor..self.cursor + len];
        self.cursor += len;
        Ok(bytes)
    }
}

/// Write view of the shared row output buffer.
pub struct RowOutput {
    buf: Vec<u8>,
}

impl RowOutput {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Grows the backing buffer so a record of `size` bytes fits without
    /// reallocation during the write.
    pub fn reserve_for(&mut self, size: u32) {
        if self.buf.capacity() < size as usize {
            self.buf.reserve(size as usize - self.buf.len());
        }
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Zero-fills up to `size`; the record tail padding.
    pub fn pad_to(&mut self, size: u32) {
        debug_assert!(self.buf.len() <= size as usize);
        self.buf.resize(size as usize, 0);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// An object held by the object cache.
///
/// Implementations keep their bookkeeping state in atomics: the cache
/// returns shared handles, and hits pin objects under the read lock.
pub trait CachedObject: Send + Sync + std::fmt::Debug {
    /// Scaled file position, or [`NO_POS`] before allocation.
    fn pos(&self) -> u64;

    fn set_pos(&self, pos: u64);

    /// On-disk record size in bytes; a multiple of the row padding.
    fn storage_size(&self) -> u32;

    /// Whether the object is resident in a cache. A non-resident object
    /// must never be handed out by the cache.
    fn is_in_memory(&self) -> bool;

    fn set_in_memory(&self, in_memory: bool);

    /// Pins (`true`) or unpins (`false`) the object. Pinned objects are
    /// never evicted.
    fn keep_in_memory(&self, keep: bool);

    fn is_pinned(&self) -> bool;

    /// Whether the in-memory image differs from the last saved one.
    fn has_changed(&self) -> bool;

    fn set_changed(&self, changed: bool);

    /// Serialises the complete record, prefix and padding included.
    fn write(&self, out: &mut RowOutput) -> Result<()>;
}

/// Materialises row bytes into objects and registers loaded objects.
pub trait PersistentStore: Send + Sync {
    /// Decodes one record. `Ok(None)` means the record decodes to nothing
    /// (a deleted placeholder); such positions are not cached.
    fn get(&self, input: &mut RowInput<'_>) -> Result<Option<Arc<dyn CachedObject>>>;

    /// Called once a freshly materialised object has been inserted into
    /// the cache.
    fn set(&self, object: &Arc<dyn CachedObject>) -> Result<()>;
}

/// Byte-buffer row: the plain [`CachedObject`] used where no richer row
/// representation is layered on top.
#[derive(Debug)]
pub struct CachedRow {
    pos: AtomicU64,
    storage_size: u32,
    payload: Vec<u8>,
    in_memory: AtomicBool,
    pin_count: AtomicU32,
    changed: AtomicBool,
}

impl CachedRow {
    /// Wraps a payload; the storage size is padded up from the payload
    /// length. New rows start dirty and unplaced.
    pub fn new(payload: Vec<u8>, padding: u32) -> Self {
        let storage_size = padded_size(payload.len(), padding);
        Self {
            pos: AtomicU64::new(NO_POS),
            storage_size,
            payload,
            in_memory: AtomicBool::new(false),
            pin_count: AtomicU32::new(0),
            changed: AtomicBool::new(true),
        }
    }

    /// Rebuilds a row from a record read off disk. Fails with an
    /// out-of-memory kind when the payload buffer cannot be allocated,
    /// which the read path turns into a cache purge and retry.
    pub fn from_input(input: &RowInput<'_>) -> Result<Self> {
        let source = input.payload();
        let mut payload = Vec::new();
        payload
            .try_reserve_exact(source.len())
            .map_err(|_| eyre::Report::new(StoreError::OutOfMemory))?;
        payload.extend_from_slice(source);

        Ok(Self {
            pos: AtomicU64::new(input.pos()),
            storage_size: input.size(),
            payload,
            in_memory: AtomicBool::new(false),
            pin_count: AtomicU32::new(0),
            changed: AtomicBool::new(false),
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl CachedObject for CachedRow {
    fn pos(&self) -> u64 {
        self.pos.load(Ordering::Acquire)
    }

    fn set_pos(&self, pos: u64) {
        self.pos.store(pos, Ordering::Release);
    }

    fn storage_size(&self) -> u32 {
        self.storage_size
    }

    fn is_in_memory(&self) -> bool {
        self.in_memory.load(Ordering::Acquire)
    }

    fn set_in_memory(&self, in_memory: bool) {
        self.in_memory.store(in_memory, Ordering::Release);
    }

    fn keep_in_memory(&self, keep: bool) {
        if keep {
            self.pin_count.fetch_add(1, Ordering::AcqRel);
        } else {
            let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(prev > 0, "unpin of unpinned row");
        }
    }

    fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }

    fn has_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    fn set_changed(&self, changed: bool) {
        self.changed.store(changed, Ordering::Release);
    }

    fn write(&self, out: &mut RowOutput) -> Result<()> {
        out.write_u32(self.storage_size);
        out.write_bytes(&self.payload);
        out.pad_to(self.storage_size);
        Ok(())
    }
}

/// [`PersistentStore`] producing [`CachedRow`] objects.
#[derive(Debug, Default, Clone, Copy)]
pub struct RowStore;

impl PersistentStore for RowStore {
    fn get(&self, input: &mut RowInput<'_>) -> Result<Option<Arc<dyn CachedObject>>> {
        let row = CachedRow::from_input(input)?;
        Ok(Some(Arc::new(row)))
    }

    fn set(&self, _object: &Arc<dyn CachedObject>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_size_rounds_up() {
        assert_eq!(padded_size(60, 16), 64);
        assert_eq!(padded_size(0, 16), 16);
        assert_eq!(padded_size(28, 16), 32);
        assert_eq!(padded_size(12, 8), 16);
        assert_eq!(padded_size(4, 8), 8);
    }

    #[test]
    fn row_output_writes_prefix_and_padding() {
        let row = CachedRow::new(b"hello".to_vec(), 16);
        assert_eq!(row.storage_size(), 16);

        let mut out = RowOutput::new(64);
        row.write(&mut out).unwrap();

        assert_eq!(out.len(), 16);
        assert_eq!(&out.bytes()[..4], &16u32.to_be_bytes());
        assert_eq!(&out.bytes()[4..9], b"hello");
        assert_eq!(&out.bytes()[9..], &[0u8; 7]);
    }

    #[test]
    fn row_input_round_trip() {
        let row = CachedRow::new(b"abcdef".to_vec(), 16);
        let mut out = RowOutput::new(64);
        row.write(&mut out).unwrap();

        let input = RowInput::new(7, row.storage_size(), out.bytes());
        let rebuilt = CachedRow::from_input(&input).unwrap();

        assert_eq!(rebuilt.pos(), 7);
        assert_eq!(rebuilt.storage_size(), 16);
        assert_eq!(&rebuilt.payload()[..6], b"abcdef");
        assert!(!rebuilt.has_changed());
    }

    #[test]
    fn row_input_typed_readers() {
        let mut out = RowOutput::new(64);
        out.write_u32(24);
        out.write_u32(77);
        out.write_u64(0xAABB);
        out.pad_to(24);

        let mut input = RowInput::new(2, 24, out.bytes());
        assert_eq!(input.read_u32().unwrap(), 77);
        assert_eq!(input.read_u64().unwrap(), 0xAABB);
        assert_eq!(input.remaining(), 8);
    }

    #[test]
    fn row_input_read_past_end_fails() {
        let mut out = RowOutput::new(16);
        out.write_u32(8);
        out.pad_to(8);

        let mut input = RowInput::new(2, 8, out.bytes());
        input.read_u32().unwrap();
        let err = input.read_u32().unwrap_err();

        assert_eq!(
            crate::error::StoreError::of(&err),
            Some(crate::error::StoreError::DataFile)
        );
    }

    #[test]
    fn pin_count_tracks_nesting() {
        let row = CachedRow::new(vec![1, 2, 3], 8);

        assert!(!row.is_pinned());
        row.keep_in_memory(true);
        row.keep_in_memory(true);
        row.keep_in_memory(false);
        assert!(row.is_pinned());
        row.keep_in_memory(false);
        assert!(!row.is_pinned());
    }

    #[test]
    fn new_rows_are_dirty_and_unplaced() {
        let row = CachedRow::new(vec![0; 10], 8);

        assert!(row.has_changed());
        assert_eq!(row.pos(), NO_POS);
    }
}
