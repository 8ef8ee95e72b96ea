//! The slice of an on-disk inode that directory repair works on.

use xrec_types::InodeNumber;

/// Data-fork format byte of the inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeFormat {
    /// Entries packed in the inode fork (shortform).
    Local,
    /// Extent list.
    Extents,
    /// Extent btree.
    Btree,
}

/// Directory inode view: identity, declared size, format, and the literal
/// fork area (meaningful for shortform directories).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirInode {
    pub ino: InodeNumber,
    pub di_size: u64,
    pub format: InodeFormat,
    /// Full fork capacity; shortform content occupies the first `di_size`
    /// bytes.
    pub fork: Vec<u8>,
    /// Set when the inode core or fork was modified and must be written
    /// back by the caller.
    pub dirty: bool,
}

impl DirInode {
    #[must_use]
    pub fn new(ino: InodeNumber, di_size: u64, format: InodeFormat, fork: Vec<u8>) -> Self {
        Self {
            ino,
            di_size,
            format,
            fork,
            dirty: false,
        }
    }
}
