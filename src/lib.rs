//! # tuskdb — Embedded Database Persistence Core
//!
//! The on-disk data file cache and crash-safe page store of an embedded
//! relational database: a single `*.data` file holds the persistent rows
//! of cached tables, a bounded in-memory cache keeps hot row images with
//! pin counts, a free-space allocator reuses released regions inside the
//! growable file, and a shadow-paging / backup protocol guarantees the
//! file recovers to its last committed state after a crash.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tuskdb::{CachedRow, DataFileCache, RowStore, StoreConfig};
//!
//! let config = StoreConfig::builder().increment_backup(true).build()?;
//! let cache = DataFileCache::new("./accounts", config)?;
//! cache.open()?;
//!
//! let row: Arc<dyn tuskdb::CachedObject> =
//!     Arc::new(CachedRow::new(payload_bytes, cache.data_file_scale().max(8)));
//! cache.set_file_pos(&row, false)?;
//! cache.add(&row)?;
//! cache.commit_changes()?;
//!
//! let loaded = cache.get(row.pos(), None, &RowStore, false)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │        DataFileCache (coordinator)           │
//! │  open / commit / close · header flag word    │
//! ├───────────────┬───────────────┬──────────────┤
//! │  ObjectCache  │ FreeSpaceMgr  │  ShadowFile  │
//! │  bounded, pin │ first-fit,    │  page-level  │
//! │  counts       │ coalescing    │  undo log    │
//! ├───────────────┴───────────────┴──────────────┤
//! │      RandomAccess file (plain / mmap)        │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## File format
//!
//! Rows live at scaled positions: physical offset = position ×
//! `data_file_scale`. Each record is a 4-byte big-endian size prefix plus
//! opaque payload, padded to the row padding. The first 32 bytes of the
//! file are a fixed header carrying the tail pointer, the lost-space
//! total, the free-space root and the flag word.
//!
//! ## Crash safety
//!
//! The header's saved flag is cleared (and synced) before the first
//! payload write of every commit cycle and set again by a successful
//! commit. An open that observes a cleared flag restores the previous
//! committed state: by replaying the shadow log in incremental mode, or
//! by inflating the deflate-compressed full backup otherwise.
//!
//! ## Concurrency
//!
//! One reader-writer lock per store. Cache hits run under the read lock;
//! everything else, disk i/o included, holds the write lock. There is no
//! async machinery and no cancellation: operations run to completion or
//! fail with a typed [`StoreError`](error::StoreError) kind.
//!
//! ## Module Overview
//!
//! - [`config`]: store options and derived layout constants
//! - [`error`]: typed failure kinds over `eyre` reports
//! - [`io`]: random-access file backends and the filesystem adapter
//! - [`store`]: cache, shadow, free-space, backup and the coordinator

pub mod config;
pub mod error;
pub mod io;
pub mod store;

pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use store::{
    CachedObject, CachedRow, DataFileCache, DefragPass, PersistentStore, RowInput, RowOutput,
    RowStore,
};
