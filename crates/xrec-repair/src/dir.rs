//! Directory repair entry point and the single-block / leaf-data paths.

use crate::blkmap::BlockMap;
use crate::context::RepairContext;
use crate::data::{DirScanState, process_data_block};
use crate::inode::{DirInode, InodeFormat};
use crate::node;
use crate::oracle::InodeOracle;
use crate::sf::process_sf_dir;
use tracing::warn;
use xrec_block::{BlockIo, LogBuf, read_scattered};
use xrec_error::Result;
use xrec_ondisk::dir::{
    DATA_V3_CRC_OFFSET, DataBlockKind, block_leaf_base, data_block_kind, read_block_tail,
    update_block_crc, verify_block_crc,
};
use xrec_ondisk::geometry::DirVersion;
use xrec_types::{BBSIZE, DaBlock, InodeNumber};

/// Result of repairing one directory inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirReport {
    /// The directory is beyond in-place repair; a later phase rebuilds it.
    pub discard: bool,
    /// Parent from `..` (or the shortform header); NULL when unknown.
    pub parent: InodeNumber,
    /// Something was fixed and written back.
    pub repaired: bool,
    pub saw_dot: bool,
    pub saw_dotdot: bool,
}

/// The four mutually exclusive directory encodings, chosen from
/// `(size, format, block map extent)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirLayout {
    Shortform,
    Block,
    Leaf,
    Node,
}

impl DirLayout {
    /// Classify a directory inode, or `None` when size/format/map disagree
    /// with every layout.
    #[must_use]
    pub fn classify(ctx: &RepairContext, inode: &DirInode, blkmap: &BlockMap) -> Option<Self> {
        let last = blkmap.last_off();
        let fsbcount = u64::from(ctx.dir_geo.fsbcount);
        let leafblk = u64::from(ctx.dir_geo.leafblk.0);

        if inode.di_size <= inode.fork.len() as u64 && inode.format == InodeFormat::Local {
            return Some(Self::Shortform);
        }
        if inode.format == InodeFormat::Local {
            return None;
        }
        if last == fsbcount {
            Some(Self::Block)
        } else if last > leafblk + fsbcount {
            Some(Self::Node)
        } else if last >= leafblk + fsbcount {
            Some(Self::Leaf)
        } else {
            None
        }
    }
}

/// Validate and repair one directory inode in place.
pub fn process_dir(
    ctx: &RepairContext,
    oracle: &dyn InodeOracle,
    dev: &dyn BlockIo,
    inode: &mut DirInode,
    blkmap: &BlockMap,
) -> Result<DirReport> {
    let ino = inode.ino;
    let mut state = DirScanState::default();

    let Some(layout) = DirLayout::classify(ctx, inode, blkmap) else {
        warn!(target: "xrec::repair::dir", %ino, size = inode.di_size, "bad size/format for directory");
        return Ok(DirReport {
            discard: true,
            parent: InodeNumber::NULL,
            repaired: false,
            saw_dot: false,
            saw_dotdot: false,
        });
    };

    let (discard, parent, repaired) = match layout {
        DirLayout::Shortform => {
            // Shortform encodes `.` and `..` in its own header.
            state.dot = true;
            state.dotdot = true;
            let out = process_sf_dir(ctx, oracle, inode)?;
            (false, out.parent, out.repaired)
        }
        DirLayout::Block => {
            let (good, repaired) = process_block_dir(ctx, oracle, dev, inode, blkmap, &mut state)?;
            (!good, state.parent.unwrap_or(InodeNumber::NULL), repaired)
        }
        DirLayout::Leaf | DirLayout::Node => {
            let isnode = layout == DirLayout::Node;
            let (good, repaired) =
                process_leaf_node_dir(ctx, oracle, dev, inode, blkmap, &mut state, isnode)?;
            (!good, state.parent.unwrap_or(InodeNumber::NULL), repaired)
        }
    };

    // Missing `.`/`..` entries are not created here; a later phase does
    // that. The root's missing `..` latches process-wide state.
    if !state.dot {
        warn!(target: "xrec::repair::dir", %ino, "no . entry for directory");
    }
    if !state.dotdot {
        if ino == ctx.fs.root_ino {
            warn!(target: "xrec::repair::dir", %ino, "no .. entry for root directory");
            ctx.set_need_root_dotdot();
        } else {
            warn!(target: "xrec::repair::dir", %ino, "no .. entry for directory");
        }
    }

    Ok(DirReport {
        discard,
        parent,
        repaired,
        saw_dot: state.dot,
        saw_dotdot: state.dotdot,
    })
}

/// Read one directory block (one or more device extents) into an owned
/// buffer. `Ok(None)` means the block is unmapped or unreadable, which the
/// caller treats as structure damage, not a fatal error.
pub(crate) fn read_dir_block(
    ctx: &RepairContext,
    dev: &dyn BlockIo,
    blkmap: &BlockMap,
    ino: InodeNumber,
    da_bno: u64,
) -> Result<Option<Vec<u8>>> {
    let bb_per_fsb = ctx.fs.block_size / BBSIZE as u32;
    let Some(maps) = blkmap.getn(da_bno, ctx.dir_geo.fsbcount, bb_per_fsb) else {
        warn!(
            target: "xrec::repair::dir",
            %ino,
            block = da_bno,
            "can't get map info for directory block"
        );
        return Ok(None);
    };
    match read_scattered(dev, &maps, None) {
        Ok(buf) => Ok(Some(buf.into_vec())),
        Err(err) => {
            warn!(
                target: "xrec::repair::dir",
                %ino,
                block = da_bno,
                %err,
                "can't read block for directory inode"
            );
            Ok(None)
        }
    }
}

/// Write a directory block back through the same extents it was read from.
pub(crate) fn write_dir_block(
    ctx: &RepairContext,
    dev: &dyn BlockIo,
    blkmap: &BlockMap,
    ino: InodeNumber,
    da_bno: u64,
    block: &[u8],
) -> Result<()> {
    let bb_per_fsb = ctx.fs.block_size / BBSIZE as u32;
    let Some(maps) = blkmap.getn(da_bno, ctx.dir_geo.fsbcount, bb_per_fsb) else {
        return Err(xrec_error::RecoveryError::Format(format!(
            "directory inode {ino} block {da_bno} vanished from the block map"
        )));
    };
    let mut written = 0_usize;
    for map in maps {
        let len = map.nbbs as usize * BBSIZE;
        let mut buf = LogBuf::zeroed(map.nbbs);
        buf.as_mut_slice().copy_from_slice(&block[written..written + len]);
        dev.write_bbs(map.daddr, map.nbbs, &buf)?;
        written += len;
    }
    Ok(())
}

/// Single-block directory: data area plus an inline leaf tail.
fn process_block_dir(
    ctx: &RepairContext,
    oracle: &dyn InodeOracle,
    dev: &dyn BlockIo,
    inode: &mut DirInode,
    blkmap: &BlockMap,
    state: &mut DirScanState,
) -> Result<(bool, bool)> {
    let ino = inode.ino;
    let datablk = u64::from(ctx.dir_geo.datablk.0);
    let Some(mut block) = read_dir_block(ctx, dev, blkmap, ino, datablk)? else {
        return Ok((false, false));
    };

    let version = ctx.dir_geo.version;
    match data_block_kind(&block) {
        Ok(DataBlockKind::Block(_)) => {}
        Ok(DataBlockKind::Data(_)) | Err(_) => {
            warn!(
                target: "xrec::repair::dir",
                %ino,
                "bad directory block magic in single-block directory"
            );
        }
    }
    let bad_crc = version == DirVersion::V3 && !verify_block_crc(&block, DATA_V3_CRC_OFFSET)?;

    // The inline leaf-entry array grows down from the tail; the data walk
    // must never run into it.
    let tail = read_block_tail(&block)?;
    let end = block_leaf_base(block.len(), tail.count).unwrap_or(0);
    let first = ctx.dir_geo.data_first_offset();

    let mut dirty = false;
    let good = process_data_block(
        ctx,
        oracle,
        ino,
        &mut block,
        ctx.dir_geo.datablk,
        version,
        first,
        end,
        state,
        &mut dirty,
    )?;
    if !good {
        // A block found corrupt mid-walk is discarded without write-back,
        // whatever the dirty flag says.
        return Ok((false, false));
    }
    if bad_crc {
        dirty = true;
    }

    let mut repaired = false;
    if dirty && !ctx.no_modify() {
        if version == DirVersion::V3 {
            update_block_crc(&mut block, DATA_V3_CRC_OFFSET)?;
        }
        write_dir_block(ctx, dev, blkmap, ino, datablk, &block)?;
        repaired = true;
    }
    Ok((true, repaired))
}

/// Leaf and node directories: walk every data block below the leaf address
/// space, then (for node format) verify the hash btree.
fn process_leaf_node_dir(
    ctx: &RepairContext,
    oracle: &dyn InodeOracle,
    dev: &dyn BlockIo,
    inode: &mut DirInode,
    blkmap: &BlockMap,
    state: &mut DirScanState,
    isnode: bool,
) -> Result<(bool, bool)> {
    let ino = inode.ino;
    let leafblk = u64::from(ctx.dir_geo.leafblk.0);
    let fsbcount = u64::from(ctx.dir_geo.fsbcount);
    let version = ctx.dir_geo.version;
    let first = ctx.dir_geo.data_first_offset();

    let mut good = 0_u32;
    let mut repaired = false;
    let mut next = blkmap.next_off(0);
    while let Some(dbno) = next {
        if dbno >= leafblk {
            break;
        }
        next = blkmap.next_off(dbno + fsbcount);

        let Some(mut block) = read_dir_block(ctx, dev, blkmap, ino, dbno)? else {
            continue;
        };
        match data_block_kind(&block) {
            Ok(DataBlockKind::Data(_)) => {}
            Ok(DataBlockKind::Block(_)) | Err(_) => {
                warn!(
                    target: "xrec::repair::dir",
                    %ino,
                    block = dbno,
                    "bad directory block magic in data block"
                );
            }
        }
        let bad_crc = version == DirVersion::V3 && !verify_block_crc(&block, DATA_V3_CRC_OFFSET)?;

        let mut dirty = false;
        let end = block.len();
        let good_block = process_data_block(
            ctx,
            oracle,
            ino,
            &mut block,
            DaBlock(dbno as u32),
            version,
            first,
            end,
            state,
            &mut dirty,
        )?;
        if good_block {
            good += 1;
            if bad_crc {
                dirty = true;
            }
            if dirty && !ctx.no_modify() {
                if version == DirVersion::V3 {
                    update_block_crc(&mut block, DATA_V3_CRC_OFFSET)?;
                }
                write_dir_block(ctx, dev, blkmap, ino, dbno, &block)?;
                repaired = true;
            }
        }
    }

    if good == 0 {
        return Ok((false, repaired));
    }
    if !isnode || ctx.is_bad_dir(ino) {
        return Ok((true, repaired));
    }

    let (tree_ok, tree_repaired) = node::process_node(ctx, dev, blkmap, ino)?;
    repaired |= tree_repaired;
    if !tree_ok {
        ctx.add_bad_dir(ino);
    }
    Ok((true, repaired))
}
