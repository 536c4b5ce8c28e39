//! # Page Store Layer
//!
//! The persistence core proper: everything that turns a single growable
//! `*.data` file into a crash-safe row store.
//!
//! ## Components
//!
//! - [`HeaderFlags`]: the fixed 32-byte file header and the typed flag
//!   word whose saved bit drives crash detection.
//! - [`RowInput`]/[`RowOutput`]: opaque row records, the cached object
//!   contract and the [`PersistentStore`] collaborator that turns record
//!   bytes into live objects.
//! - [`ObjectCache`]: count- and byte-bounded map from file position to
//!   cached object, with pinning and batched write-back.
//! - [`ShadowFile`]: copy-on-first-write undo log making each commit
//!   cycle reversible.
//! - [`FreeSpaceManager`]: first-fit allocator over the free regions of
//!   the file, in a transient and a persistent variant.
//! - [`DataFileCache`]: the coordinator owning all of the above plus the
//!   backup artifacts and the single reader-writer lock.
//! - [`DefragPass`]: externally driven one-shot file compaction.
//!
//! ## Data flow
//!
//! ```text
//! client ──> DataFileCache::get/add/save_row
//!              │ hit                    │ miss / write
//!              ▼                        ▼
//!          ObjectCache          RandomAccess file at pos * scale
//!                                       │
//!                         ShadowFile (undo) + header flags
//! ```

mod backup;
mod data_file_cache;
mod defrag;
mod header;
mod object_cache;
mod row;
mod shadow;
mod spaces;

pub use backup::{read_marker, write_marker, DbModified, StoreFiles};
pub use data_file_cache::DataFileCache;
pub use defrag::DefragPass;
pub use header::{
    HeaderFlags, FLAGS_POS, INT_SPACE_LIST_POS, LONG_EMPTY_SIZE, LONG_FREE_POS_POS,
};
pub use object_cache::ObjectCache;
pub use row::{
    padded_size, CachedObject, CachedRow, PersistentStore, RowInput, RowOutput, RowStore,
    NO_POS, ROW_SIZE_PREFIX,
};
pub use shadow::{ShadowFile, SHADOW_MAGIC};
pub use spaces::{BlockSpaceManager, FreeSpaceManager, SimpleSpaceManager, SpaceHost};
