//! On-disk directory storage.
//!
//! A directory is a persistent sorted map from filename to `(id, kind)`,
//! stored as a B-tree over a block-paged stream. The stream is typically an
//! [`crate::stream::AesGcmCryptStream`], so directory pages inherit the
//! stream's integrity protection, but the engine works over any
//! [`crate::stream::ByteStream`].

use thiserror::Error;

use crate::stream::StreamError;

pub mod btree;

pub use btree::BtreeDirectory;

/// Page size of the directory stream. Pinned by the on-disk format.
pub const BLOCK_SIZE: usize = 4096;

/// Longest filename a directory entry can carry, in bytes.
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Sentinel page number meaning "no such page".
pub const INVALID_PAGE: u32 = 0xffff_ffff;

/// Upper bound on tree depth; exceeding it means the page graph has a cycle.
pub const BTREE_MAX_DEPTH: usize = 32;

/// Largest entry count whose serialized node fits in one page:
/// `8 + 4·(n+1) + n·292 <= 4096`. Pinned by the on-disk format.
pub const DEFAULT_MAX_ENTRIES: usize = 13;

/// Identifier a directory entry points at.
pub type FileId = [u8; 32];

/// One directory entry. `kind` is an opaque 32-bit value owned by the
/// layer above (regular/dir/symlink discrimination happens there).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub id: FileId,
    pub kind: u32,
}

/// Errors raised by directory operations.
#[derive(Error, Debug)]
pub enum DirectoryError {
    /// A structural invariant of the B-tree or free list does not hold.
    #[error("corrupted directory: {reason}")]
    Corrupted { reason: &'static str },

    /// Filename exceeds [`MAX_FILENAME_LENGTH`].
    #[error("filename of {length} bytes exceeds the {MAX_FILENAME_LENGTH}-byte limit")]
    NameTooLong { length: usize },

    /// Error propagated from the backing stream.
    #[error(transparent)]
    Stream(#[from] StreamError),
}

pub(crate) fn corrupted(reason: &'static str) -> DirectoryError {
    DirectoryError::Corrupted { reason }
}

/// Point-in-time directory page accounting, for hosts and self-checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirStats {
    pub total_pages: u32,
    pub free_pages: u32,
    pub root_present: bool,
}
