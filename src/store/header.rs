//! # Data File Header
//!
//! The first 32 bytes of the data file are a fixed header. Offsets are
//! frozen; old files must stay readable:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----------------------------------------------
//! 0       4     reserved
//! 4       8     lost space size (bytes released but unreusable)
//! 12      8     file tail pointer (next free byte offset)
//! 20      4     reserved
//! 24      4     free-space root block offset / FIXED_BLOCK_SIZE_UNIT
//! 28      4     flag word
//! ```
//!
//! All fields are big-endian. The flag word is the on-disk state machine
//! for crash recovery: a clean, committed file carries `IS_SAVED`; the
//! first payload write of every commit cycle clears it (and syncs) before
//! any row byte is touched, so an open that observes a cleared `IS_SAVED`
//! knows recovery is required.
//!
//! [`HeaderFlags`] is the only representation of the flag word; every
//! transition goes through [`HeaderFlags::load`] / [`HeaderFlags::store`]
//! under the coordinator's write lock, never through ad-hoc integer
//! arithmetic at call sites.

use eyre::Result;

use crate::io::RandomAccess;

/// Byte offset of the lost-space field.
pub const LONG_EMPTY_SIZE: u64 = 4;
/// Byte offset of the file tail pointer.
pub const LONG_FREE_POS_POS: u64 = 12;
/// Byte offset of the free-space root field.
pub const INT_SPACE_LIST_POS: u64 = 24;
/// Byte offset of the flag word.
pub const FLAGS_POS: u64 = 28;

/// Typed view of the header flag word.
///
/// Flag constants are bit positions; bit `n` contributes `1 << n` to the
/// stored word. A freshly initialised incremental-mode file therefore
/// carries `IS_SHADOWED | IS_SAVED | V_NEW = 22`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderFlags(u32);

impl HeaderFlags {
    /// The file uses an incremental shadow backup.
    pub const IS_SHADOWED: u32 = 1;
    /// The file is in a consistent, committed state.
    pub const IS_SAVED: u32 = 2;
    /// Rows carry extra bookkeeping info (reserved, never set here).
    pub const ROW_INFO: u32 = 3;
    /// Current file format generation.
    pub const V_NEW: u32 = 4;
    /// Format from a newer, unsupported generation.
    pub const WRONG_VERSION: u32 = 5;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn with(self, flag: u32) -> Self {
        Self(self.0 | (1 << flag))
    }

    #[must_use]
    pub fn without(self, flag: u32) -> Self {
        Self(self.0 & !(1 << flag))
    }

    pub fn contains(self, flag: u32) -> bool {
        self.0 & (1 << flag) != 0
    }

    /// Reads the flag word from the file header.
    pub fn load(file: &mut dyn RandomAccess) -> Result<Self> {
        file.seek(FLAGS_POS)?;
        Ok(Self(file.read_u32()?))
    }

    /// Writes the flag word to the file header. The caller decides when to
    /// sync; the saved-flag transitions require a barrier before payload
    /// writes may proceed.
    pub fn store(self, file: &mut dyn RandomAccess) -> Result<()> {
        file.seek(FLAGS_POS)?;
        file.write_u32(self.0)
    }
}
