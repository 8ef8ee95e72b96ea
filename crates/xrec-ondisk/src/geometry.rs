//! Filesystem and directory geometry.
//!
//! `FsGeometry` carries the mount-level identity and layout the recovery
//! core needs (UUID, log length, reserved metadata inodes, AG math);
//! `DirGeometry` derives the directory block layout from the filesystem
//! block size and format version.

use serde::{Deserialize, Serialize};
use xrec_types::{AgInode, AgNumber, DaBlock, InodeNumber};

/// Directory on-disk format version. V3 blocks carry a CRC header with the
/// block number, LSN, UUID, and owner inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirVersion {
    V2,
    V3,
}

/// Mount-level geometry and identity supplied by the phase driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsGeometry {
    pub uuid: [u8; 16],
    /// Filesystem block size in bytes (power of two, 512..=65536).
    pub block_size: u32,
    /// Physical log length in basic blocks.
    pub log_bb_len: u32,
    pub root_ino: InodeNumber,
    /// Reserved metadata inodes; entries may be `InodeNumber::NULL` when the
    /// feature is absent.
    pub rbm_ino: InodeNumber,
    pub rsum_ino: InodeNumber,
    pub uquot_ino: InodeNumber,
    pub gquot_ino: InodeNumber,
    pub pquot_ino: InodeNumber,
    pub ag_count: u32,
    /// Bits of an inode number below the AG number.
    pub ag_inode_bits: u32,
}

impl FsGeometry {
    #[must_use]
    pub fn ino_to_ag(&self, ino: InodeNumber) -> AgNumber {
        AgNumber((ino.0 >> self.ag_inode_bits) as u32)
    }

    #[must_use]
    pub fn ino_to_agino(&self, ino: InodeNumber) -> AgInode {
        AgInode((ino.0 & ((1_u64 << self.ag_inode_bits) - 1)) as u32)
    }

    /// Structural inode-number check: in AG range, no reserved high bits,
    /// not zero, not the null sentinel.
    #[must_use]
    pub fn inum_is_valid(&self, ino: InodeNumber) -> bool {
        if ino.0 == 0 || ino.is_null() {
            return false;
        }
        let agno = ino.0 >> self.ag_inode_bits;
        agno < u64::from(self.ag_count)
    }

    /// If `ino` is one of the reserved metadata inodes, name it.
    #[must_use]
    pub fn reserved_metadata_kind(&self, ino: InodeNumber) -> Option<&'static str> {
        if ino.is_null() {
            return None;
        }
        if ino == self.rbm_ino {
            Some("realtime bitmap")
        } else if ino == self.rsum_ino {
            Some("realtime summary")
        } else if ino == self.uquot_ino {
            Some("user quota")
        } else if ino == self.gquot_ino {
            Some("group quota")
        } else if ino == self.pquot_ino {
            Some("project quota")
        } else {
            None
        }
    }
}

/// Byte offset where the leaf address space of a directory begins: the hash
/// index lives 32 GiB into the directory's own block space.
const LEAF_SPACE_OFFSET: u64 = 1 << 35;

/// Alignment of every record in a directory data block.
pub const DATA_ALIGN: usize = 8;

/// Derived directory block layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirGeometry {
    pub version: DirVersion,
    /// Directory block size in bytes (equals the fs block size here; the
    /// repair core does not support multi-fsb directory blocks).
    pub blksize: u32,
    /// Filesystem blocks per directory block.
    pub fsbcount: u32,
    /// First data block in directory block space.
    pub datablk: DaBlock,
    /// First block of the leaf (hash index) address space.
    pub leafblk: DaBlock,
    /// First block of the freespace index address space.
    pub freeblk: DaBlock,
    /// Maximum btree entries in one interior node block.
    pub node_ents: u32,
}

impl DirGeometry {
    #[must_use]
    pub fn new(block_size: u32, version: DirVersion) -> Self {
        let blocklog = block_size.trailing_zeros();
        let leafblk = DaBlock((LEAF_SPACE_OFFSET >> blocklog) as u32);
        let freeblk = DaBlock(((2 * LEAF_SPACE_OFFSET) >> blocklog) as u32);
        let node_hdr = match version {
            DirVersion::V2 => NODE_HDR_SIZE_V2,
            DirVersion::V3 => NODE_HDR_SIZE_V3,
        };
        Self {
            version,
            blksize: block_size,
            fsbcount: 1,
            datablk: DaBlock(0),
            leafblk,
            freeblk,
            node_ents: (block_size - node_hdr as u32) / 8,
        }
    }

    /// Offset of the first data entry in a data block.
    #[must_use]
    pub fn data_first_offset(&self) -> usize {
        match self.version {
            DirVersion::V2 => DATA_HDR_SIZE_V2,
            DirVersion::V3 => DATA_HDR_SIZE_V3,
        }
    }

    /// On-disk size of a data entry with an `namelen`-byte name: inumber,
    /// namelen, name, tag, rounded up to [`DATA_ALIGN`].
    #[must_use]
    pub fn data_entsize(&self, namelen: usize) -> usize {
        (8 + 1 + namelen + 2).div_ceil(DATA_ALIGN) * DATA_ALIGN
    }
}

/// v2 data header: magic + bestfree table.
pub const DATA_HDR_SIZE_V2: usize = 16;
/// v3 data header: magic, crc, blkno, lsn, uuid, owner, bestfree, pad.
pub const DATA_HDR_SIZE_V3: usize = 64;

/// v2 node/leaf header: forw, back, magic, pad + count/level or count/stale.
pub const NODE_HDR_SIZE_V2: usize = 16;
/// v3 node/leaf header adds crc, blkno, lsn, uuid, owner.
pub const NODE_HDR_SIZE_V3: usize = 64;
