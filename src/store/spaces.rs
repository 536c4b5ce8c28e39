//! # Free-Space Management
//!
//! Tracks the free regions inside the data file and serves row-sized
//! allocations out of them, extending the file only when no tracked region
//! fits. Two variants share one contract:
//!
//! - **Simple**: the region set lives purely in memory. A crash loses it;
//!   the space becomes lost bytes until the next defragmentation. The file
//!   grows by exactly the padded row size.
//! - **Blocks**: the region set additionally persists as a linked chain of
//!   4096-byte metadata blocks inside the data file, rooted at the
//!   header's space-list field. The file grows to the next 1024-unit
//!   boundary so large allocations stay block-aligned.
//!
//! ## Region set
//!
//! Regions are kept sorted by offset and coalesced on release. A region
//! released at the file tail retracts the tail pointer instead of entering
//! the set, cascading into any tracked regions that now abut the tail. The
//! set is capacity-bounded; on overflow the smallest region is sacrificed
//! and its bytes counted as lost space.
//!
//! ## Coordinator handle
//!
//! Managers never see the coordinator; they operate through the narrow
//! [`SpaceHost`] handle, which exposes tail extension/retraction and raw
//! block i/o. That keeps the ownership one-directional: the coordinator
//! owns the manager, the manager borrows a host per call.
//!
//! ## Block chain format
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  --------------------------------------
//! 0       4     magic
//! 4       4     entry count in this block
//! 8       8     byte offset of next chain block (0 = end)
//! 16      16*n  entries: (byte offset u64, length u64)
//! ```
//!
//! The chain is rewritten wholesale on flush; the previous chain's storage
//! is released into the set first, so chain blocks themselves recycle.

use eyre::{ensure, Result};
use tracing::debug;
use zerocopy::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{FILE_BLOCK_UNITS, FIXED_BLOCK_SIZE_UNIT, MAX_FREE_REGIONS};
use crate::error::StoreError;

/// Narrow coordinator handle the managers operate through.
pub trait SpaceHost {
    /// Advances the file tail by `delta` bytes and returns the previous
    /// tail. Fails with a file-full kind when the maximum size would be
    /// exceeded.
    fn enlarge_file_space(&mut self, delta: u64) -> Result<u64>;

    /// Current file tail pointer.
    fn file_free_position(&self) -> u64;

    /// Moves the tail pointer back to `new_tail`.
    fn retract_file_space(&mut self, new_tail: u64);

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;
}

fn round_up(value: u64, step: u64) -> u64 {
    value.div_ceil(step) * step
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Region {
    offset: u64,
    len: u64,
}

impl Region {
    fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Sorted, coalescing, capacity-bounded set of free regions.
#[derive(Debug)]
struct RegionSet {
    regions: Vec<Region>,
    capacity: usize,
    lost: u64,
}

impl RegionSet {
    fn new(capacity: usize, lost: u64) -> Self {
        Self {
            regions: Vec::new(),
            capacity,
            lost,
        }
    }

    fn len(&self) -> usize {
        self.regions.len()
    }

    fn total(&self) -> u64 {
        self.regions.iter().map(|r| r.len).sum()
    }

    fn lost(&self) -> u64 {
        self.lost
    }

    fn insert(&mut self, region: Region) {
        if region.len == 0 {
            return;
        }

        let idx = self
            .regions
            .partition_point(|r| r.offset < region.offset);
        debug_assert!(
            idx == 0 || self.regions[idx - 1].end() <= region.offset,
            "free region overlaps predecessor"
        );
        debug_assert!(
            idx == self.regions.len() || region.end() <= self.regions[idx].offset,
            "free region overlaps successor"
        );

        let merges_prev = idx > 0 && self.regions[idx - 1].end() == region.offset;
        let merges_next = idx < self.regions.len() && region.end() == self.regions[idx].offset;

        match (merges_prev, merges_next) {
            (true, true) => {
                self.regions[idx - 1].len += region.len + self.regions[idx].len;
                self.regions.remove(idx);
            }
            (true, false) => self.regions[idx - 1].len += region.len,
            (false, true) => {
                self.regions[idx].offset = region.offset;
                self.regions[idx].len += region.len;
            }
            (false, false) => {
                self.regions.insert(idx, region);
                if self.regions.len() > self.capacity {
                    self.evict_smallest();
                }
            }
        }
    }

    fn evict_smallest(&mut self) {
        if let Some(idx) = self
            .regions
            .iter()
            .enumerate()
            .min_by_key(|(_, r)| r.len)
            .map(|(i, _)| i)
        {
            let victim = self.regions.remove(idx);
            self.lost += victim.len;
            debug!(
                offset = victim.offset,
                len = victim.len,
                lost = self.lost,
                "free region dropped as lost space"
            );
        }
    }

    /// First-fit allocation of `len` bytes at `align`ment; slack at either
    /// end of the chosen region returns to the set.
    fn take_first_fit(&mut self, len: u64, align: u64) -> Option<u64> {
        let idx = self.regions.iter().position(|r| {
            let aligned = round_up(r.offset, align);
            aligned - r.offset + len <= r.len
        })?;

        let region = self.regions.remove(idx);
        let aligned = round_up(region.offset, align);
        let head = aligned - region.offset;
        let tail = region.len - head - len;

        self.insert(Region {
            offset: region.offset,
            len: head,
        });
        self.insert(Region {
            offset: aligned + len,
            len: tail,
        });

        Some(aligned)
    }

    /// Removes and returns the last region iff it ends exactly at `tail`.
    fn pop_tail_region(&mut self, tail: u64) -> Option<Region> {
        if self.regions.last()?.end() == tail {
            self.regions.pop()
        } else {
            None
        }
    }

    fn snapshot(&self) -> Vec<Region> {
        self.regions.clone()
    }
}

fn allocate(
    set: &mut RegionSet,
    scale: u32,
    row_size: u32,
    as_block: bool,
    growth_granularity: Option<u64>,
    host: &mut dyn SpaceHost,
) -> Result<u64> {
    ensure!(
        row_size > 0 && row_size as u64 % scale as u64 == 0,
        StoreError::DataFile
    );

    let align = if as_block {
        FILE_BLOCK_UNITS * scale as u64
    } else {
        scale as u64
    };

    if let Some(offset) = set.take_first_fit(row_size as u64, align) {
        return Ok(offset / scale as u64);
    }

    let tail = host.file_free_position();
    let aligned = round_up(tail, align);
    let end = aligned + row_size as u64;
    let new_tail = match growth_granularity {
        Some(granularity) => round_up(end, granularity),
        None => end,
    };

    host.enlarge_file_space(new_tail - tail)?;

    set.insert(Region {
        offset: tail,
        len: aligned - tail,
    });
    set.insert(Region {
        offset: end,
        len: new_tail - end,
    });

    Ok(aligned / scale as u64)
}

fn release(set: &mut RegionSet, scale: u32, pos: u64, size: u32, host: &mut dyn SpaceHost) {
    let offset = pos * scale as u64;
    let len = size as u64;

    if offset + len == host.file_free_position() {
        host.retract_file_space(offset);
        while let Some(region) = set.pop_tail_region(host.file_free_position()) {
            host.retract_file_space(region.offset);
        }
    } else {
        set.insert(Region { offset, len });
    }
}

/// In-memory free-space manager; nothing survives a close.
#[derive(Debug)]
pub struct SimpleSpaceManager {
    scale: u32,
    set: RegionSet,
    modified: bool,
}

impl SimpleSpaceManager {
    pub fn new(scale: u32, lost: u64) -> Self {
        Self {
            scale,
            set: RegionSet::new(MAX_FREE_REGIONS, lost),
            modified: false,
        }
    }
}

const SPACE_BLOCK_MAGIC: u32 = 0x5453_5043;
const SPACE_BLOCK_SIZE: usize = FIXED_BLOCK_SIZE_UNIT as usize;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct SpaceBlockHeader {
    magic: U32,
    count: U32,
    next: U64,
}

const SPACE_BLOCK_HEADER_SIZE: usize = 16;
const _: () = assert!(std::mem::size_of::<SpaceBlockHeader>() == SPACE_BLOCK_HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct SpaceEntry {
    offset: U64,
    len: U64,
}

const SPACE_ENTRY_SIZE: usize = 16;
const ENTRIES_PER_BLOCK: usize = (SPACE_BLOCK_SIZE - SPACE_BLOCK_HEADER_SIZE) / SPACE_ENTRY_SIZE;

/// Sanity bound when walking a chain from disk.
const MAX_CHAIN_BLOCKS: usize = 1 << 20;

/// Persistent free-space manager backed by a chain of metadata blocks.
#[derive(Debug)]
pub struct BlockSpaceManager {
    scale: u32,
    set: RegionSet,
    modified: bool,
    root_pos: u64,
    chain: Vec<u64>,
}

impl BlockSpaceManager {
    pub fn new(scale: u32, lost: u64) -> Self {
        Self {
            scale,
            set: RegionSet::new(MAX_FREE_REGIONS, lost),
            modified: false,
            root_pos: 0,
            chain: Vec::new(),
        }
    }

    /// Rebuilds the manager by walking the chain rooted at `root_pos`.
    pub fn open(scale: u32, lost: u64, root_pos: u64, host: &mut dyn SpaceHost) -> Result<Self> {
        let mut manager = Self::new(scale, lost);
        manager.root_pos = root_pos;

        let mut block_pos = root_pos;
        let mut buf = vec![0u8; SPACE_BLOCK_SIZE];

        while block_pos != 0 {
            ensure!(manager.chain.len() < MAX_CHAIN_BLOCKS, StoreError::DataFile);
            host.read_at(block_pos, &mut buf)?;

            let header = SpaceBlockHeader::read_from_bytes(&buf[..SPACE_BLOCK_HEADER_SIZE])
                .map_err(|e| eyre::eyre!("failed to parse space block header: {:?}", e))?;
            ensure!(header.magic.get() == SPACE_BLOCK_MAGIC, StoreError::DataFile);
            let count = header.count.get() as usize;
            ensure!(count <= ENTRIES_PER_BLOCK, StoreError::DataFile);

            for i in 0..count {
                let start = SPACE_BLOCK_HEADER_SIZE + i * SPACE_ENTRY_SIZE;
                let entry = SpaceEntry::read_from_bytes(&buf[start..start + SPACE_ENTRY_SIZE])
                    .map_err(|e| eyre::eyre!("failed to parse space entry: {:?}", e))?;
                manager.set.insert(Region {
                    offset: entry.offset.get(),
                    len: entry.len.get(),
                });
            }

            manager.chain.push(block_pos);
            block_pos = header.next.get();
        }

        debug!(
            blocks = manager.chain.len(),
            regions = manager.set.len(),
            "free-space chain loaded"
        );

        Ok(manager)
    }

    fn growth_granularity(&self) -> u64 {
        FILE_BLOCK_UNITS * self.scale as u64
    }

    /// Rewrites the chain from the current region set; returns the new
    /// root offset (0 when the set is empty).
    fn persist(&mut self, host: &mut dyn SpaceHost) -> Result<u64> {
        // the old chain's storage is free again and may be recycled
        for block in std::mem::take(&mut self.chain) {
            self.set.insert(Region {
                offset: block,
                len: SPACE_BLOCK_SIZE as u64,
            });
        }

        // allocating a chain block can itself split off a slack region,
        // growing the set; iterate until the chain length settles
        loop {
            let needed = self.set.len().div_ceil(ENTRIES_PER_BLOCK);
            if self.chain.len() >= needed {
                break;
            }

            let tail = host.file_free_position();
            let aligned = round_up(tail, FIXED_BLOCK_SIZE_UNIT);
            host.enlarge_file_space(aligned + SPACE_BLOCK_SIZE as u64 - tail)?;
            self.set.insert(Region {
                offset: tail,
                len: aligned - tail,
            });
            self.chain.push(aligned);
        }

        // coalescing during chain allocation may have shrunk the set below
        // the allocated chain length; surplus blocks are written with a
        // zero count and stay referenced so the next flush recycles them
        let snapshot = self.set.snapshot();
        let mut chunks = snapshot.chunks(ENTRIES_PER_BLOCK);
        let mut buf = vec![0u8; SPACE_BLOCK_SIZE];

        for i in 0..self.chain.len() {
            let chunk = chunks.next().unwrap_or(&[]);
            buf.fill(0);
            let header = SpaceBlockHeader {
                magic: U32::new(SPACE_BLOCK_MAGIC),
                count: U32::new(chunk.len() as u32),
                next: U64::new(self.chain.get(i + 1).copied().unwrap_or(0)),
            };
            buf[..SPACE_BLOCK_HEADER_SIZE].copy_from_slice(header.as_bytes());

            for (j, region) in chunk.iter().enumerate() {
                let entry = SpaceEntry {
                    offset: U64::new(region.offset),
                    len: U64::new(region.len),
                };
                let start = SPACE_BLOCK_HEADER_SIZE + j * SPACE_ENTRY_SIZE;
                buf[start..start + SPACE_ENTRY_SIZE].copy_from_slice(entry.as_bytes());
            }

            host.write_at(self.chain[i], &buf)?;
        }

        self.root_pos = self.chain.first().copied().unwrap_or(0);
        self.modified = false;

        debug!(
            root = self.root_pos,
            blocks = self.chain.len(),
            regions = snapshot.len(),
            "free-space chain written"
        );

        Ok(self.root_pos)
    }
}

/// The two free-space manager variants behind one contract.
#[derive(Debug)]
pub enum FreeSpaceManager {
    Simple(SimpleSpaceManager),
    Blocks(BlockSpaceManager),
}

impl FreeSpaceManager {
    /// Allocates `row_size` bytes (a multiple of the scale) and returns
    /// the scaled unit position. `as_block` demands 1024-unit alignment.
    pub fn get_file_position(
        &mut self,
        row_size: u32,
        as_block: bool,
        host: &mut dyn SpaceHost,
    ) -> Result<u64> {
        match self {
            Self::Simple(m) => {
                let pos = allocate(&mut m.set, m.scale, row_size, as_block, None, host)?;
                m.modified = true;
                Ok(pos)
            }
            Self::Blocks(m) => {
                let granularity = m.growth_granularity();
                let pos = allocate(
                    &mut m.set,
                    m.scale,
                    row_size,
                    as_block,
                    Some(granularity),
                    host,
                )?;
                m.modified = true;
                Ok(pos)
            }
        }
    }

    /// Returns a region to the free set, coalescing with neighbours or
    /// retracting the file tail.
    pub fn release(&mut self, pos: u64, size: u32, host: &mut dyn SpaceHost) {
        match self {
            Self::Simple(m) => {
                release(&mut m.set, m.scale, pos, size, host);
                m.modified = true;
            }
            Self::Blocks(m) => {
                release(&mut m.set, m.scale, pos, size, host);
                m.modified = true;
            }
        }
    }

    pub fn free_block_count(&self) -> u64 {
        self.set().len() as u64
    }

    pub fn free_block_size(&self) -> u64 {
        self.set().total()
    }

    pub fn lost_blocks_size(&self) -> u64 {
        self.set().lost()
    }

    pub fn is_modified(&self) -> bool {
        match self {
            Self::Simple(m) => m.modified,
            Self::Blocks(m) => m.modified,
        }
    }

    /// Persists whatever the variant persists and returns the root block
    /// offset for the header (always 0 for the simple variant). Invoked on
    /// every commit, which is also what the final close runs through.
    pub fn persist(&mut self, host: &mut dyn SpaceHost) -> Result<u64> {
        match self {
            Self::Simple(m) => {
                m.modified = false;
                Ok(0)
            }
            Self::Blocks(m) => m.persist(host),
        }
    }

    fn set(&self) -> &RegionSet {
        match self {
            Self::Simple(m) => &m.set,
            Self::Blocks(m) => &m.set,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::bail;

    struct TestHost {
        tail: u64,
        max: u64,
        file: Vec<u8>,
    }

    impl TestHost {
        fn new(tail: u64) -> Self {
            Self {
                tail,
                max: u64::MAX,
                file: Vec::new(),
            }
        }
    }

    impl SpaceHost for TestHost {
        fn enlarge_file_space(&mut self, delta: u64) -> Result<u64> {
            if self.tail + delta > self.max {
                bail!(StoreError::DataFileIsFull);
            }
            let old = self.tail;
            self.tail += delta;
            Ok(old)
        }

        fn file_free_position(&self) -> u64 {
            self.tail
        }

        fn retract_file_space(&mut self, new_tail: u64) {
            self.tail = new_tail;
        }

        fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
            let start = offset as usize;
            buf.copy_from_slice(&self.file[start..start + buf.len()]);
            Ok(())
        }

        fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
            let end = offset as usize + buf.len();
            if self.file.len() < end {
                self.file.resize(end, 0);
            }
            self.file[offset as usize..end].copy_from_slice(buf);
            Ok(())
        }
    }

    fn simple(scale: u32) -> FreeSpaceManager {
        FreeSpaceManager::Simple(SimpleSpaceManager::new(scale, 0))
    }

    #[test]
    fn grows_the_file_when_no_region_fits() {
        let mut host = TestHost::new(32);
        let mut manager = simple(16);

        let pos = manager.get_file_position(64, false, &mut host).unwrap();

        assert_eq!(pos, 2);
        assert_eq!(host.tail, 96);
    }

    #[test]
    fn released_region_is_reused_first_fit() {
        let mut host = TestHost::new(32);
        let mut manager = simple(16);

        let a = manager.get_file_position(32, false, &mut host).unwrap();
        let b = manager.get_file_position(32, false, &mut host).unwrap();
        let c = manager.get_file_position(32, false, &mut host).unwrap();
        assert_eq!((a, b, c), (2, 4, 6));

        manager.release(b, 32, &mut host);
        let reused = manager.get_file_position(32, false, &mut host).unwrap();

        assert_eq!(reused, b);
        assert_eq!(manager.lost_blocks_size(), 0);
        assert_eq!(host.tail, 128);
    }

    #[test]
    fn release_at_tail_retracts_the_pointer() {
        let mut host = TestHost::new(32);
        let mut manager = simple(16);

        manager.get_file_position(32, false, &mut host).unwrap();
        let b = manager.get_file_position(32, false, &mut host).unwrap();
        assert_eq!(host.tail, 96);

        manager.release(b, 32, &mut host);

        assert_eq!(host.tail, 64);
        assert_eq!(manager.free_block_count(), 0);
    }

    #[test]
    fn tail_retraction_cascades_through_tracked_regions() {
        let mut host = TestHost::new(32);
        let mut manager = simple(16);

        let a = manager.get_file_position(32, false, &mut host).unwrap();
        let b = manager.get_file_position(32, false, &mut host).unwrap();
        let c = manager.get_file_position(32, false, &mut host).unwrap();
        assert_eq!(host.tail, 128);

        // middle first: region tracked, tail untouched
        manager.release(b, 32, &mut host);
        assert_eq!(host.tail, 128);

        // tail next: retracts past the tracked middle region too
        manager.release(c, 32, &mut host);
        assert_eq!(host.tail, 64);

        manager.release(a, 32, &mut host);
        assert_eq!(host.tail, 32);
        assert_eq!(manager.free_block_size(), 0);
    }

    #[test]
    fn adjacent_releases_coalesce() {
        let mut host = TestHost::new(32);
        let mut manager = simple(16);

        let a = manager.get_file_position(32, false, &mut host).unwrap();
        let b = manager.get_file_position(32, false, &mut host).unwrap();
        manager.get_file_position(32, false, &mut host).unwrap();

        manager.release(a, 32, &mut host);
        manager.release(b, 32, &mut host);

        assert_eq!(manager.free_block_count(), 1);
        assert_eq!(manager.free_block_size(), 64);

        // the coalesced region serves a larger request
        let big = manager.get_file_position(64, false, &mut host).unwrap();
        assert_eq!(big, a);
    }

    #[test]
    fn failed_growth_leaves_state_unchanged() {
        let mut host = TestHost::new(32);
        host.max = 128;
        let mut manager = simple(16);

        manager.get_file_position(64, false, &mut host).unwrap();
        let before_tail = host.tail;
        let before_count = manager.free_block_count();

        let err = manager.get_file_position(64, false, &mut host).unwrap_err();

        assert_eq!(StoreError::of(&err), Some(StoreError::DataFileIsFull));
        assert_eq!(host.tail, before_tail);
        assert_eq!(manager.free_block_count(), before_count);
    }

    #[test]
    fn block_aligned_allocation_pushes_head_slack_back() {
        let mut host = TestHost::new(32);
        let mut manager = simple(16);

        // align = 1024 units * 16 bytes; tail 32 -> aligned 16384
        let pos = manager.get_file_position(64, true, &mut host).unwrap();

        assert_eq!(pos, 1024);
        assert_eq!(manager.free_block_size(), 16384 - 32);

        // the slack serves ordinary allocations
        let small = manager.get_file_position(32, false, &mut host).unwrap();
        assert_eq!(small, 2);
    }

    #[test]
    fn region_set_overflow_becomes_lost_space() {
        let mut set = RegionSet::new(4, 0);

        // disjoint, non-coalescing regions
        for i in 0..5u64 {
            set.insert(Region {
                offset: i * 100,
                len: 16 + i,
            });
        }

        assert_eq!(set.len(), 4);
        assert_eq!(set.lost(), 16);
    }

    #[test]
    fn rejects_unscaled_sizes() {
        let mut host = TestHost::new(32);
        let mut manager = simple(16);

        let err = manager.get_file_position(30, false, &mut host).unwrap_err();

        assert_eq!(StoreError::of(&err), Some(StoreError::DataFile));
    }

    #[test]
    fn blocks_variant_grows_to_unit_boundaries() {
        let mut host = TestHost::new(32);
        let mut manager = FreeSpaceManager::Blocks(BlockSpaceManager::new(16, 0));

        let pos = manager.get_file_position(64, false, &mut host).unwrap();

        assert_eq!(pos, 2);
        // tail rounded to the next 1024-unit boundary
        assert_eq!(host.tail, 16384);
        // the rounding slack is tracked, not lost
        assert_eq!(manager.free_block_size(), 16384 - 96);
        assert_eq!(manager.lost_blocks_size(), 0);
    }

    #[test]
    fn blocks_chain_round_trip() {
        let mut host = TestHost::new(32);
        let mut manager = FreeSpaceManager::Blocks(BlockSpaceManager::new(16, 0));

        let a = manager.get_file_position(64, false, &mut host).unwrap();
        let b = manager.get_file_position(64, false, &mut host).unwrap();
        manager.release(a, 64, &mut host);
        assert!(manager.is_modified());

        let root = manager.persist(&mut host).unwrap();
        assert_ne!(root, 0);
        assert_eq!(root % FIXED_BLOCK_SIZE_UNIT, 0);
        assert!(!manager.is_modified());

        let reopened = BlockSpaceManager::open(16, 0, root, &mut host).unwrap();
        let mut reopened = FreeSpaceManager::Blocks(reopened);
        assert_eq!(reopened.free_block_size(), manager.free_block_size());

        // the freed region is found again after the round trip
        let reused = reopened.get_file_position(64, false, &mut host).unwrap();
        assert_eq!(reused, a);
        let _ = b;
    }

    #[test]
    fn empty_chain_flushes_to_root_zero() {
        let mut host = TestHost::new(32);
        let mut manager = FreeSpaceManager::Blocks(BlockSpaceManager::new(16, 0));

        let root = manager.persist(&mut host).unwrap();

        assert_eq!(root, 0);
    }

    #[test]
    fn reflushing_recycles_old_chain_blocks() {
        let mut host = TestHost::new(32);
        let mut manager = FreeSpaceManager::Blocks(BlockSpaceManager::new(16, 0));

        let a = manager.get_file_position(64, false, &mut host).unwrap();
        manager.release(a, 64, &mut host);
        let first_root = manager.persist(&mut host).unwrap();
        let tail_after_first = host.tail;

        // another cycle: old chain block is released and reused
        let b = manager.get_file_position(64, false, &mut host).unwrap();
        manager.release(b, 64, &mut host);
        let second_root = manager.persist(&mut host).unwrap();

        assert_ne!(second_root, 0);
        assert!(host.tail <= tail_after_first + SPACE_BLOCK_SIZE as u64);
        let _ = first_root;
    }

    #[test]
    fn open_rejects_corrupt_chain() {
        let mut host = TestHost::new(32);
        host.write_at(4096, &vec![0xFFu8; SPACE_BLOCK_SIZE]).unwrap();

        let err = BlockSpaceManager::open(16, 0, 4096, &mut host).unwrap_err();

        assert_eq!(StoreError::of(&err), Some(StoreError::DataFile));
    }
}
