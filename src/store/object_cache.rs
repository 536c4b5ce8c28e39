//! # Bounded Object Cache
//!
//! In-memory map from scaled file position to cached row object, bounded
//! by an object count and a byte total. The cache itself performs no file
//! i/o: when a cleanup pass needs to write dirty survivors the coordinator
//! drives it, because write-back has to run through the shadow log and the
//! header flag protocol.
//!
//! ## Eviction
//!
//! When an insert would exceed either ceiling, entries are ordered by
//! last-access stamp ascending and the oldest third that are unpinned form
//! the cleanup batch. Dirty members of the batch are saved first (sorted
//! by position so the disk writes are sequential), then batch members are
//! dropped until both ceilings hold. Pinned entries are never evicted, so
//! the count bound is soft under heavy pinning.
//!
//! ## Locking
//!
//! The cache lives inside the coordinator's reader-writer lock. Lookups
//! run under the read lock and still stamp access order and pin objects,
//! which is why entry state is atomic; every structural change (insert,
//! remove, clear) happens under the write lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;

use super::row::{CachedObject, NO_POS};

struct CacheEntry {
    object: Arc<dyn CachedObject>,
    last_access: AtomicU64,
}

pub struct ObjectCache {
    map: HashMap<u64, CacheEntry>,
    max_rows: usize,
    max_bytes: u64,
    total_bytes: u64,
    access_count: AtomicU64,
}

impl ObjectCache {
    pub fn new(max_rows: usize, max_bytes: u64) -> Self {
        Self {
            map: HashMap::with_capacity(max_rows.min(4096)),
            max_rows,
            max_bytes,
            total_bytes: 0,
            access_count: AtomicU64::new(0),
        }
    }

    fn next_stamp(&self) -> u64 {
        self.access_count.fetch_add(1, Ordering::Relaxed)
    }

    /// Looks up a resident object and stamps its access order. Objects
    /// marked non-resident are invisible even if still mapped.
    pub fn get(&self, pos: u64) -> Option<Arc<dyn CachedObject>> {
        let entry = self.map.get(&pos)?;
        if !entry.object.is_in_memory() {
            return None;
        }

        entry.last_access.store(self.next_stamp(), Ordering::Relaxed);
        Some(Arc::clone(&entry.object))
    }

    /// Inserts an object under its position. The caller has already made
    /// room via [`cleanup_batch`](Self::cleanup_batch) /
    /// [`evict_batch`](Self::evict_batch) if the ceilings demanded it.
    pub fn put(&mut self, object: Arc<dyn CachedObject>) {
        let pos = object.pos();
        debug_assert_ne!(pos, NO_POS, "cache insert of unplaced object");

        object.set_in_memory(true);
        let size = object.storage_size() as u64;
        let entry = CacheEntry {
            object,
            last_access: AtomicU64::new(self.next_stamp()),
        };

        if let Some(old) = self.map.insert(pos, entry) {
            old.object.set_in_memory(false);
            self.total_bytes -= old.object.storage_size() as u64;
        }
        self.total_bytes += size;
    }

    /// Replaces the object at `pos`; the previous occupant is detached.
    pub fn replace(&mut self, pos: u64, object: Arc<dyn CachedObject>) {
        debug_assert_eq!(pos, object.pos());
        self.put(object);
    }

    /// Unpins the object at `pos`, making it evictable once more.
    pub fn release(&self, pos: u64) -> Option<Arc<dyn CachedObject>> {
        let entry = self.map.get(&pos)?;
        entry.object.keep_in_memory(false);
        Some(Arc::clone(&entry.object))
    }

    /// Drops the entry at `pos` regardless of its state.
    pub fn remove(&mut self, pos: u64) -> Option<Arc<dyn CachedObject>> {
        let entry = self.map.remove(&pos)?;
        entry.object.set_in_memory(false);
        self.total_bytes -= entry.object.storage_size() as u64;
        Some(entry.object)
    }

    /// Whether inserting an object of `incoming_size` bytes would exceed a
    /// ceiling.
    pub fn needs_clean_up(&self, incoming_size: u32) -> bool {
        self.map.len() + 1 > self.max_rows
            || self.total_bytes + incoming_size as u64 > self.max_bytes
    }

    /// The unpinned entries among the oldest-accessed third, ordered by
    /// access stamp ascending. Dirty members must be saved before
    /// [`evict_batch`](Self::evict_batch) will drop them.
    pub fn cleanup_batch(&self) -> Vec<Arc<dyn CachedObject>> {
        let mut candidates: Vec<(u64, Arc<dyn CachedObject>)> = self
            .map
            .values()
            .filter(|e| !e.object.is_pinned())
            .map(|e| {
                (
                    e.last_access.load(Ordering::Relaxed),
                    Arc::clone(&e.object),
                )
            })
            .collect();

        candidates.sort_by_key(|(stamp, _)| *stamp);
        let batch_len = (self.map.len() / 3).max(1).min(candidates.len());
        candidates.truncate(batch_len);

        candidates.into_iter().map(|(_, object)| object).collect()
    }

    /// Drops batch members (oldest first) until both ceilings hold with
    /// `reserve_rows`/`reserve_bytes` of headroom. Pinned or still-dirty
    /// members are skipped; returns the number evicted.
    pub fn evict_batch(
        &mut self,
        batch: &[Arc<dyn CachedObject>],
        reserve_rows: usize,
        reserve_bytes: u64,
    ) -> usize {
        let mut evicted = 0;

        for object in batch {
            let within = self.map.len() + reserve_rows <= self.max_rows
                && self.total_bytes + reserve_bytes <= self.max_bytes;
            if within {
                break;
            }
            if object.is_pinned() || object.has_changed() {
                continue;
            }
            if self.remove(object.pos()).is_some() {
                evicted += 1;
            }
        }

        evicted
    }

    /// All unpinned objects, for a forced purge.
    pub fn unpinned(&self) -> Vec<Arc<dyn CachedObject>> {
        self.map
            .values()
            .filter(|e| !e.object.is_pinned())
            .map(|e| Arc::clone(&e.object))
            .collect()
    }

    /// All dirty objects ordered by position ascending, so write-back is
    /// sequential in the file.
    pub fn dirty_snapshot_sorted(&self) -> Vec<Arc<dyn CachedObject>> {
        let mut dirty: Vec<Arc<dyn CachedObject>> = self
            .map
            .values()
            .filter(|e| e.object.has_changed())
            .map(|e| Arc::clone(&e.object))
            .collect();

        dirty.sort_by_key(|o| o.pos());
        dirty
    }

    /// Stable snapshot of every cached object.
    pub fn snapshot(&self) -> Vec<Arc<dyn CachedObject>> {
        self.map.values().map(|e| Arc::clone(&e.object)).collect()
    }

    /// Positions of cached objects with `start <= pos < limit`.
    pub fn positions_in_range(&self, start: u64, limit: u64) -> Vec<u64> {
        self.map
            .keys()
            .copied()
            .filter(|&pos| pos >= start && pos < limit)
            .collect()
    }

    pub fn clear(&mut self) {
        for entry in self.map.values() {
            entry.object.set_in_memory(false);
        }
        self.map.clear();
        self.total_bytes = 0;
    }

    pub fn size(&self) -> usize {
        self.map.len()
    }

    pub fn total_cached_block_size(&self) -> u64 {
        self.total_bytes
    }

    pub fn increment_access_count(&self) -> u64 {
        self.next_stamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::row::CachedRow;

    fn row_at(pos: u64, payload_len: usize) -> Arc<dyn CachedObject> {
        let row = CachedRow::new(vec![0xAB; payload_len], 16);
        row.set_pos(pos);
        row.set_changed(false);
        Arc::new(row)
    }

    #[test]
    fn get_returns_resident_objects_only() {
        let mut cache = ObjectCache::new(8, 1 << 20);
        let row = row_at(2, 10);
        cache.put(Arc::clone(&row));

        assert!(cache.get(2).is_some());

        row.set_in_memory(false);
        assert!(cache.get(2).is_none());
    }

    #[test]
    fn put_tracks_byte_total() {
        let mut cache = ObjectCache::new(8, 1 << 20);
        cache.put(row_at(2, 10)); // storage 16
        cache.put(row_at(4, 40)); // storage 48

        assert_eq!(cache.size(), 2);
        assert_eq!(cache.total_cached_block_size(), 64);

        cache.remove(4);
        assert_eq!(cache.total_cached_block_size(), 16);
    }

    #[test]
    fn replacing_a_position_detaches_the_old_object() {
        let mut cache = ObjectCache::new(8, 1 << 20);
        let old = row_at(2, 10);
        cache.put(Arc::clone(&old));

        let new = row_at(2, 40);
        cache.replace(2, Arc::clone(&new));

        assert!(!old.is_in_memory());
        assert_eq!(cache.size(), 1);
        assert_eq!(cache.total_cached_block_size(), 48);
    }

    #[test]
    fn cleanup_batch_prefers_oldest_unpinned() {
        let mut cache = ObjectCache::new(16, 1 << 20);
        for pos in [2u64, 4, 6, 8, 10, 12] {
            cache.put(row_at(pos, 10));
        }

        // touch everything except pos 2 and 4 so they stay oldest
        for pos in [6u64, 8, 10, 12] {
            cache.get(pos);
        }

        let batch = cache.cleanup_batch();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].pos(), 2);
        assert_eq!(batch[1].pos(), 4);
    }

    #[test]
    fn pinned_objects_are_not_offered_for_cleanup() {
        let mut cache = ObjectCache::new(16, 1 << 20);
        let pinned = row_at(2, 10);
        pinned.keep_in_memory(true);
        cache.put(Arc::clone(&pinned));
        cache.put(row_at(4, 10));

        let batch = cache.cleanup_batch();
        assert!(batch.iter().all(|o| o.pos() != 2));
    }

    #[test]
    fn evict_batch_stops_once_within_bounds() {
        let mut cache = ObjectCache::new(4, 1 << 20);
        for pos in [2u64, 4, 6, 8] {
            cache.put(row_at(pos, 10));
        }

        let batch = cache.cleanup_batch();
        let evicted = cache.evict_batch(&batch, 1, 16);

        assert_eq!(evicted, 1);
        assert_eq!(cache.size(), 3);
    }

    #[test]
    fn evict_batch_never_drops_dirty_objects() {
        let mut cache = ObjectCache::new(2, 1 << 20);
        let dirty = row_at(2, 10);
        dirty.set_changed(true);
        cache.put(Arc::clone(&dirty));
        cache.put(row_at(4, 10));

        let batch = cache.snapshot();
        cache.evict_batch(&batch, 1, 16);

        assert!(cache.get(2).is_some(), "dirty object survived eviction");
    }

    #[test]
    fn dirty_snapshot_is_sorted_by_position() {
        let mut cache = ObjectCache::new(8, 1 << 20);
        for pos in [10u64, 2, 6] {
            let row = row_at(pos, 10);
            row.set_changed(true);
            cache.put(row);
        }

        let dirty = cache.dirty_snapshot_sorted();
        let positions: Vec<u64> = dirty.iter().map(|o| o.pos()).collect();
        assert_eq!(positions, vec![2, 6, 10]);
    }

    #[test]
    fn clear_detaches_everything() {
        let mut cache = ObjectCache::new(8, 1 << 20);
        let row = row_at(2, 10);
        cache.put(Arc::clone(&row));

        cache.clear();

        assert!(!row.is_in_memory());
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.total_cached_block_size(), 0);
    }

    #[test]
    fn positions_in_range_is_half_open() {
        let mut cache = ObjectCache::new(8, 1 << 20);
        for pos in [2u64, 4, 6, 8] {
            cache.put(row_at(pos, 10));
        }

        let mut hits = cache.positions_in_range(4, 8);
        hits.sort_unstable();
        assert_eq!(hits, vec![4, 6]);
    }
}
