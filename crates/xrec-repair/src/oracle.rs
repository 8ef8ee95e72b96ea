//! Inode reference oracle.
//!
//! Directory repair consults this for every referenced inode number. The
//! real implementation is backed by the inode-table scan of an earlier
//! phase; tests use a map-backed double.

use xrec_types::{AgInode, AgNumber, Generation, InodeNumber};

/// Inodes per oracle record chunk.
pub const INODES_PER_REC: u32 = 64;

/// One chunk of known inodes: 64 allocation states starting at
/// `start_agino`, as confirmed/free bitmaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeRec {
    pub start_agino: AgInode,
    pub confirmed: u64,
    pub free: u64,
}

impl InodeRec {
    /// Offset of `agino` within this record, if it falls inside.
    #[must_use]
    pub fn offset_of(&self, agino: AgInode) -> Option<u32> {
        let off = agino.0.checked_sub(self.start_agino.0)?;
        (off < INODES_PER_REC).then_some(off)
    }

    #[must_use]
    pub fn is_confirmed(&self, offset: u32) -> bool {
        offset < INODES_PER_REC && self.confirmed & (1_u64 << offset) != 0
    }

    #[must_use]
    pub fn is_free(&self, offset: u32) -> bool {
        offset < INODES_PER_REC && self.free & (1_u64 << offset) != 0
    }
}

/// Answers "is this inode allocated / known / free?" and records inode
/// numbers that cannot be decided yet.
pub trait InodeOracle: Send + Sync {
    /// Structural validity of an inode number for this filesystem.
    fn verify_inum(&self, ino: InodeNumber) -> bool;

    /// The record covering `agino` in `agno`, if the inode is known.
    fn find_inode_rec(&self, agno: AgNumber, agino: AgInode) -> Option<InodeRec>;

    fn is_inode_confirmed(&self, rec: &InodeRec, offset: u32) -> bool {
        rec.is_confirmed(offset)
    }

    fn is_inode_free(&self, rec: &InodeRec, offset: u32) -> bool {
        rec.is_free(offset)
    }

    /// Queue a structurally valid but unknown inode for a later pass.
    fn add_inode_uncertain(&self, ino: InodeNumber, generation: Generation);
}
