//! # Defragmentation Integration Tests
//!
//! The compaction pass is driven externally: the test pass enumerates the
//! rows it knows about, copies them into the staged store and keeps the
//! old-to-new position map, the way an index rebuild would.

use std::sync::Arc;

use tempfile::tempdir;
use tuskdb::store::RowStore;
use tuskdb::{
    CachedObject, CachedRow, DataFileCache, DefragPass, Result, RowOutput, StoreConfig,
};

fn row(payload: &[u8]) -> Arc<dyn CachedObject> {
    Arc::new(CachedRow::new(payload.to_vec(), 16))
}

fn payload_of(object: &Arc<dyn CachedObject>) -> Vec<u8> {
    let mut out = RowOutput::new(object.storage_size() as usize);
    object.write(&mut out).unwrap();
    out.bytes()[4..].to_vec()
}

/// Copies the listed rows in order and records their new positions.
struct CopyPass {
    sources: Vec<u64>,
    map: Vec<(u64, u64)>,
}

impl CopyPass {
    fn new(sources: Vec<u64>) -> Self {
        Self {
            sources,
            map: Vec::new(),
        }
    }
}

impl DefragPass for CopyPass {
    fn process(&mut self, source: &DataFileCache, target: &DataFileCache) -> Result<()> {
        for &pos in &self.sources {
            let object = source
                .get(pos, None, &RowStore, false)?
                .ok_or_else(|| eyre::eyre!("row {} missing during defrag", pos))?;

            let copy: Arc<dyn CachedObject> = Arc::new(CachedRow::new(payload_of(&object), 16));
            target.set_file_pos(&copy, false)?;
            target.add(&copy)?;
            self.map.push((pos, copy.pos()));
        }
        Ok(())
    }
}

/// Pass that dies halfway through.
struct FailingPass;

impl DefragPass for FailingPass {
    fn process(&mut self, _source: &DataFileCache, _target: &DataFileCache) -> Result<()> {
        eyre::bail!("index enumeration failed")
    }
}

#[test]
fn defrag_compacts_the_file_and_rotates_names() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("t");
    let cache = DataFileCache::new(&base, StoreConfig::default()).unwrap();
    cache.open().unwrap();

    let rows: Vec<Arc<dyn CachedObject>> = (0..4u8)
        .map(|i| row(&[b'A' + i; 60]))
        .collect();
    for r in &rows {
        cache.set_file_pos(r, false).unwrap();
        cache.add(r).unwrap();
    }
    assert_eq!(cache.file_free_pos(), 32 + 4 * 64);
    cache.commit_changes().unwrap();

    // drop the second row; its slot becomes a hole defrag will squeeze out
    cache.remove(&rows[1]).unwrap();
    cache.commit_changes().unwrap();

    let survivors: Vec<u64> = vec![rows[0].pos(), rows[2].pos(), rows[3].pos()];
    let mut pass = CopyPass::new(survivors);
    cache.defrag(&mut pass).unwrap();

    assert!(cache.is_file_open(), "store reopened on the compacted file");
    assert_eq!(cache.file_free_pos(), 32 + 3 * 64, "hole squeezed out");
    assert_eq!(pass.map.len(), 3);
    assert!(!dir.path().join("t.data.new").exists());

    for (i, (_, new_pos)) in pass.map.iter().enumerate() {
        let expected = match i {
            0 => vec![b'A'; 60],
            1 => vec![b'C'; 60],
            _ => vec![b'D'; 60],
        };
        let loaded = cache.get(*new_pos, None, &RowStore, false).unwrap().unwrap();
        assert_eq!(payload_of(&loaded), expected);
    }

    let marker = std::fs::read_to_string(dir.path().join("t.state")).unwrap();
    assert_eq!(marker.trim(), "modified");

    cache.close(true).unwrap();

    // the compacted file survives a reopen on its own
    let cache = DataFileCache::new(&base, StoreConfig::default()).unwrap();
    cache.open().unwrap();
    let loaded = cache.get(2, None, &RowStore, false).unwrap().unwrap();
    assert_eq!(payload_of(&loaded), vec![b'A'; 60]);
    cache.close(true).unwrap();
}

#[test]
fn failed_defrag_pass_leaves_the_store_untouched() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("t");
    let cache = DataFileCache::new(&base, StoreConfig::default()).unwrap();
    cache.open().unwrap();

    let r = row(&[b'K'; 60]);
    cache.set_file_pos(&r, false).unwrap();
    cache.add(&r).unwrap();
    cache.commit_changes().unwrap();

    let err = cache.defrag(&mut FailingPass).unwrap_err();
    assert!(err.to_string().contains("defragmentation pass failed"));

    assert!(cache.is_file_open(), "source store still open");
    assert!(!dir.path().join("t.data.new").exists(), "staging removed");

    let loaded = cache.get(r.pos(), None, &RowStore, false).unwrap().unwrap();
    assert_eq!(payload_of(&loaded), vec![b'K'; 60]);
    cache.close(true).unwrap();
}
