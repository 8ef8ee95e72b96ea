//! Node-format directory btree verification.
//!
//! Walks down the left spine of the hash index building a per-level
//! cursor, then walks the leaf chain left to right. Every time a block at
//! some level is exhausted the path above it is verified: the parent entry
//! must name the child block and carry the child's greatest hash (patched
//! in place when it does not). Each cursor level owns at most one block
//! buffer; the error path tolerates still-held buffers, the success path
//! expects none.

use crate::blkmap::BlockMap;
use crate::context::RepairContext;
use crate::dir::{read_dir_block, write_dir_block};
use tracing::warn;
use xrec_block::BlockIo;
use xrec_error::Result;
use xrec_ondisk::dir::{
    DA_MAX_DEPTH, DA_V3_CRC_OFFSET, DaHeader, NULL_DATAPTR, da_is_v3_magic, leaf_entry_at,
    node_entry_at, parse_da_header, put_node_hashval, update_block_crc, verify_block_crc,
};
use xrec_types::InodeNumber;

/// One level of the descent cursor.
#[derive(Debug, Clone, Default)]
struct CursorLevel {
    hashval: u32,
    bno: u64,
    index: u32,
    dirty: bool,
    bad_crc: bool,
    block: Option<Vec<u8>>,
}

struct Cursor {
    levels: Vec<CursorLevel>,
    /// Root level of the tree; levels `1..=active` hold interior nodes.
    active: usize,
    /// Greatest directory block seen; the corrected directory length.
    greatest_bno: u64,
}

impl Cursor {
    fn new() -> Self {
        Self {
            levels: vec![CursorLevel::default(); DA_MAX_DEPTH],
            active: 0,
            greatest_bno: 0,
        }
    }
}

struct NodeWalk<'a> {
    ctx: &'a RepairContext,
    dev: &'a dyn BlockIo,
    blkmap: &'a BlockMap,
    ino: InodeNumber,
    repaired: bool,
}

impl NodeWalk<'_> {
    fn read(&self, da_bno: u64) -> Result<Option<Vec<u8>>> {
        read_dir_block(self.ctx, self.dev, self.blkmap, self.ino, da_bno)
    }

    /// Write a cursor-held block back, refreshing its v3 checksum.
    fn write(&mut self, da_bno: u64, block: &mut [u8]) -> Result<()> {
        if let Ok(magic) = xrec_ondisk::dir::da_magic(block) {
            if da_is_v3_magic(magic) {
                update_block_crc(block, DA_V3_CRC_OFFSET)?;
            }
        }
        write_dir_block(self.ctx, self.dev, self.blkmap, self.ino, da_bno, block)?;
        self.repaired = true;
        Ok(())
    }
}

enum Traverse {
    Bad,
    /// The root itself is a leaf; nothing else to verify.
    LeafRoot,
    Leftmost,
}

/// Verify (and where possible patch) the hash btree of one node directory.
/// `Ok((false, _))` means the tree is beyond in-place repair.
pub(crate) fn process_node(
    ctx: &RepairContext,
    dev: &dyn BlockIo,
    blkmap: &BlockMap,
    ino: InodeNumber,
) -> Result<(bool, bool)> {
    let mut walk = NodeWalk {
        ctx,
        dev,
        blkmap,
        ino,
        repaired: false,
    };
    let mut cursor = Cursor::new();

    match traverse_int(&mut walk, &mut cursor)? {
        Traverse::Bad => {
            release_cursor(&walk, &mut cursor, 0, true);
            Ok((false, walk.repaired))
        }
        Traverse::LeafRoot => {
            release_cursor(&walk, &mut cursor, 0, false);
            Ok((true, walk.repaired))
        }
        Traverse::Leftmost => {
            let ok = process_leaf_level(&mut walk, &mut cursor)?;
            Ok((ok, walk.repaired))
        }
    }
}

/// Walk down the left side of the tree setting up the cursor, ending on
/// the leftmost leaf block number in `cursor.levels[0].bno`.
fn traverse_int(walk: &mut NodeWalk<'_>, cursor: &mut Cursor) -> Result<Traverse> {
    let ino = walk.ino;
    let mut bno = u64::from(walk.ctx.dir_geo.leafblk.0);
    let mut current: Option<usize> = None;
    cursor.active = 0;

    loop {
        let Some(block) = walk.read(bno)? else {
            return Ok(Traverse::Bad);
        };
        let Ok(hdr) = parse_da_header(&block) else {
            warn!(target: "xrec::repair::dir", %ino, block = bno, "bad dir magic number in tree block");
            return Ok(Traverse::Bad);
        };

        if hdr.is_leafn() {
            if current.is_some() {
                warn!(
                    target: "xrec::repair::dir",
                    %ino,
                    block = bno,
                    "found non-root LEAFN node"
                );
            }
            return Ok(Traverse::LeafRoot);
        }
        if !hdr.is_node() {
            warn!(
                target: "xrec::repair::dir",
                %ino,
                block = bno,
                magic = hdr.magic,
                "bad dir magic number in tree block"
            );
            return Ok(Traverse::Bad);
        }
        if da_is_v3_magic(hdr.magic) && !verify_block_crc(&block, DA_V3_CRC_OFFSET)? {
            warn!(target: "xrec::repair::dir", %ino, block = bno, "corrupt tree block");
            return Ok(Traverse::Bad);
        }
        if u32::from(hdr.count) > walk.ctx.dir_geo.node_ents {
            warn!(
                target: "xrec::repair::dir",
                %ino,
                count = hdr.count,
                max = walk.ctx.dir_geo.node_ents,
                "bad record count in directory tree block"
            );
            return Ok(Traverse::Bad);
        }

        let level = usize::from(hdr.fourth);
        let this = match current {
            None => {
                if !(1..DA_MAX_DEPTH).contains(&level) {
                    warn!(target: "xrec::repair::dir", %ino, "bad header depth for directory");
                    return Ok(Traverse::Bad);
                }
                cursor.active = level;
                level
            }
            Some(prev) => {
                if level != prev - 1 {
                    warn!(target: "xrec::repair::dir", %ino, "bad directory btree");
                    return Ok(Traverse::Bad);
                }
                level
            }
        };
        current = Some(this);

        let first = node_entry_at(&block, hdr.hdr_size(), 0)?;
        let slot = &mut cursor.levels[this];
        slot.hashval = first.hashval;
        slot.bno = bno;
        slot.index = 0;
        slot.dirty = false;
        slot.bad_crc = false;
        slot.block = Some(block);

        bno = u64::from(first.before);
        if this == 1 {
            break;
        }
    }

    cursor.levels[0].bno = bno;
    Ok(Traverse::Leftmost)
}

/// Check one leaf block: entries within bounds, hash order non-decreasing,
/// stale count accurate.
fn check_leaf_block(
    walk: &NodeWalk<'_>,
    block: &[u8],
    hdr: &DaHeader,
    da_bno: u64,
    mut last_hashval: u32,
) -> Option<u32> {
    let ino = walk.ino;
    let blksize = walk.ctx.dir_geo.blksize as usize;
    let base = hdr.hdr_size();
    let mut stale = 0_u16;

    for i in 0..usize::from(hdr.count) {
        if base + (i + 1) * xrec_ondisk::dir::LEAF_ENTRY_SIZE > blksize {
            warn!(
                target: "xrec::repair::dir",
                %ino,
                block = da_bno,
                "bad entry count in leaf block"
            );
            return None;
        }
        let Ok(ent) = leaf_entry_at(block, base, i) else {
            return None;
        };
        if ent.address == NULL_DATAPTR {
            stale += 1;
        } else if ent.hashval < last_hashval {
            warn!(
                target: "xrec::repair::dir",
                %ino,
                block = da_bno,
                "bad hash ordering in leaf block"
            );
            return None;
        }
        last_hashval = ent.hashval;
    }
    if stale != hdr.fourth {
        warn!(
            target: "xrec::repair::dir",
            %ino,
            block = da_bno,
            stored = hdr.fourth,
            counted = stale,
            "bad stale count in leaf block"
        );
        return None;
    }
    Some(last_hashval)
}

/// Walk the leaf chain left to right, verifying the interior path every
/// time a block is exhausted.
fn process_leaf_level(walk: &mut NodeWalk<'_>, cursor: &mut Cursor) -> Result<bool> {
    let ino = walk.ino;
    let mut da_bno = cursor.levels[0].bno;
    let mut prev_bno = 0_u64;
    let mut current_hashval = 0_u32;

    loop {
        // Block 0 is the root of the tree; no leaf can sit there.
        debug_assert_ne!(da_bno, 0, "leaf chain must not point at the root block");
        let Some(block) = walk.read(da_bno)? else {
            release_cursor(walk, cursor, 0, true);
            return Ok(false);
        };
        let Ok(hdr) = parse_da_header(&block) else {
            release_cursor(walk, cursor, 0, true);
            return Ok(false);
        };
        if !hdr.is_leafn() {
            warn!(
                target: "xrec::repair::dir",
                %ino,
                block = da_bno,
                magic = hdr.magic,
                "bad directory leaf magic"
            );
            release_cursor(walk, cursor, 0, true);
            return Ok(false);
        }
        let bad_crc = da_is_v3_magic(hdr.magic) && !verify_block_crc(&block, DA_V3_CRC_OFFSET)?;

        let Some(greatest_hashval) = check_leaf_block(walk, &block, &hdr, da_bno, current_hashval)
        else {
            release_cursor(walk, cursor, 0, true);
            return Ok(false);
        };

        // Index parks one past the final entry so it matches the interior
        // convention of "next unprocessed entry".
        {
            let slot = &mut cursor.levels[0];
            slot.hashval = greatest_hashval;
            slot.bno = da_bno;
            slot.index = u32::from(hdr.count);
            slot.dirty = false;
            slot.bad_crc = bad_crc;
            slot.block = Some(block);
        }

        if hdr.back != prev_bno as u32 {
            warn!(
                target: "xrec::repair::dir",
                %ino,
                block = da_bno,
                "bad sibling back pointer for leaf block"
            );
            release_cursor(walk, cursor, 0, true);
            return Ok(false);
        }

        prev_bno = da_bno;
        da_bno = u64::from(hdr.forw);
        if da_bno != 0 && !verify_dir2_path(walk, cursor, 0)? {
            release_cursor(walk, cursor, 0, true);
            return Ok(false);
        }
        current_hashval = greatest_hashval;

        // Done with this leaf; write it back only if something (the
        // checksum) needs refreshing.
        let slot = &mut cursor.levels[0];
        if let Some(mut block) = slot.block.take() {
            let dirty = slot.dirty || (slot.bad_crc && !walk.ctx.no_modify());
            let bno = slot.bno;
            if dirty && !walk.ctx.no_modify() {
                walk.write(bno, &mut block)?;
            }
        }

        if da_bno == 0 {
            break;
        }
    }

    if !verify_final_dir2_path(walk, cursor, 0)? {
        warn!(target: "xrec::repair::dir", %ino, "bad hash path in directory");
        release_cursor(walk, cursor, 0, true);
        return Ok(false);
    }

    release_cursor(walk, cursor, 0, false);
    Ok(true)
}

/// Verify the path from an exhausted descendant block up toward the root,
/// advancing to sibling blocks as interior levels run out of entries.
///
/// The interior btree propagates the *greatest* hash of each child block,
/// so the parent entry for the just-finished child must carry exactly the
/// child's final hash; a mismatch is patched in place.
fn verify_dir2_path(walk: &mut NodeWalk<'_>, cursor: &mut Cursor, p_level: usize) -> Result<bool> {
    let ino = walk.ino;
    let this_level = p_level + 1;
    let Some(mut block) = cursor.levels[this_level].block.take() else {
        return Ok(false);
    };
    let Ok(mut hdr) = parse_da_header(&block) else {
        return Ok(false);
    };
    let mut entry = cursor.levels[this_level].index as usize;

    if entry >= usize::from(hdr.count) {
        if entry == 0 {
            // An interior block with no entries at all cannot be verified.
            return Ok(false);
        }
        // This block is used up: set its final hash, verify the path above
        // it, then move to the forward sibling.
        let last = node_entry_at(&block, hdr.hdr_size(), entry - 1)?;
        cursor.levels[this_level].hashval = last.hashval;
        if cursor.levels[this_level].bno > cursor.greatest_bno {
            cursor.greatest_bno = cursor.levels[this_level].bno;
        }

        cursor.levels[this_level].block = Some(block);
        if !verify_dir2_path(walk, cursor, this_level)? {
            return Ok(false);
        }
        let Some(owned) = cursor.levels[this_level].block.take() else {
            return Ok(false);
        };
        block = owned;

        let dabno = u64::from(hdr.forw);
        debug_assert_ne!(dabno, 0, "exhausted interior block must have a forward sibling");
        if dabno == 0 {
            return Ok(false);
        }
        let Some(new_block) = walk.read(dabno)? else {
            return Ok(false);
        };
        let Ok(new_hdr) = parse_da_header(&new_block) else {
            return Ok(false);
        };

        let mut bad = false;
        if !new_hdr.is_node() {
            warn!(
                target: "xrec::repair::dir",
                %ino,
                block = dabno,
                magic = new_hdr.magic,
                "bad magic number in interior dir block"
            );
            bad = true;
        }
        if u64::from(new_hdr.back) != cursor.levels[this_level].bno {
            warn!(
                target: "xrec::repair::dir",
                %ino,
                block = dabno,
                "bad back pointer in interior dir block"
            );
            bad = true;
        }
        if u32::from(new_hdr.count) > walk.ctx.dir_geo.node_ents {
            warn!(
                target: "xrec::repair::dir",
                %ino,
                block = dabno,
                count = new_hdr.count,
                "entry count too large in interior dir block"
            );
            bad = true;
        }
        if usize::from(new_hdr.fourth) != this_level {
            warn!(
                target: "xrec::repair::dir",
                %ino,
                block = dabno,
                level = new_hdr.fourth,
                "bad level in interior dir block"
            );
            bad = true;
        }
        if bad {
            return Ok(false);
        }

        // Swap buffers: write the used-up block if it carries patches (or
        // a stale checksum), then step the cursor onto the sibling.
        let new_bad_crc =
            da_is_v3_magic(new_hdr.magic) && !verify_block_crc(&new_block, DA_V3_CRC_OFFSET)?;
        let slot_dirty = cursor.levels[this_level].dirty
            || (cursor.levels[this_level].bad_crc && !walk.ctx.no_modify());
        if slot_dirty && !walk.ctx.no_modify() {
            let bno = cursor.levels[this_level].bno;
            walk.write(bno, &mut block)?;
        }
        let first = node_entry_at(&new_block, new_hdr.hdr_size(), 0)?;
        let slot = &mut cursor.levels[this_level];
        slot.dirty = false;
        slot.bad_crc = new_bad_crc;
        slot.bno = dabno;
        slot.hashval = first.hashval;
        slot.index = 0;
        entry = 0;
        hdr = new_hdr;
        block = new_block;
    }

    let ent = node_entry_at(&block, hdr.hdr_size(), entry)?;
    if cursor.levels[p_level].bno != u64::from(ent.before) {
        cursor.levels[this_level].block = Some(block);
        return Ok(false);
    }
    if cursor.levels[p_level].hashval != ent.hashval {
        if walk.ctx.no_modify() {
            warn!(
                target: "xrec::repair::dir",
                %ino,
                level = this_level,
                "would correct bad hashval in interior dir block"
            );
        } else {
            warn!(
                target: "xrec::repair::dir",
                %ino,
                level = this_level,
                "correcting bad hashval in interior dir block"
            );
            put_node_hashval(
                &mut block,
                hdr.hdr_size(),
                entry,
                cursor.levels[p_level].hashval,
            )?;
            cursor.levels[this_level].dirty = true;
        }
    }

    cursor.levels[this_level].index += 1;
    cursor.levels[this_level].block = Some(block);
    Ok(true)
}

/// Verify the right edge of the tree after the last leaf: every level must
/// be exactly on its final entry, hashes must line up, and no forward
/// siblings may remain.
fn verify_final_dir2_path(
    walk: &mut NodeWalk<'_>,
    cursor: &mut Cursor,
    p_level: usize,
) -> Result<bool> {
    let ino = walk.ino;
    let this_level = p_level + 1;
    let Some(mut block) = cursor.levels[this_level].block.take() else {
        return Ok(false);
    };
    let Ok(hdr) = parse_da_header(&block) else {
        return Ok(false);
    };
    let entry = cursor.levels[this_level].index as usize;

    let mut bad = false;
    if entry != usize::from(hdr.count).saturating_sub(1) {
        warn!(
            target: "xrec::repair::dir",
            %ino,
            used = entry,
            count = hdr.count,
            "directory block used/count inconsistency"
        );
        bad = true;
    }
    let last_ent = node_entry_at(&block, hdr.hdr_size(), entry)?;
    if cursor.levels[this_level].hashval >= last_ent.hashval {
        warn!(
            target: "xrec::repair::dir",
            %ino,
            expected_above = cursor.levels[this_level].hashval,
            saw = last_ent.hashval,
            "directory block hashvalue inconsistency"
        );
        bad = true;
    }
    if hdr.forw != 0 {
        warn!(
            target: "xrec::repair::dir",
            %ino,
            forw = hdr.forw,
            "bad directory forward block pointer, expected 0"
        );
        bad = true;
    }
    if bad {
        warn!(target: "xrec::repair::dir", %ino, "bad directory block");
        cursor.levels[this_level].block = Some(block);
        return Ok(false);
    }

    if cursor.levels[this_level].bno > cursor.greatest_bno {
        cursor.greatest_bno = cursor.levels[this_level].bno;
    }

    if cursor.levels[p_level].bno != u64::from(last_ent.before) {
        cursor.levels[this_level].block = Some(block);
        return Ok(false);
    }
    if cursor.levels[p_level].hashval != last_ent.hashval {
        if walk.ctx.no_modify() {
            warn!(
                target: "xrec::repair::dir",
                %ino,
                level = this_level,
                "would correct bad hashval in non-leaf dir block"
            );
        } else {
            warn!(
                target: "xrec::repair::dir",
                %ino,
                level = this_level,
                "correcting bad hashval in non-leaf dir block"
            );
            put_node_hashval(
                &mut block,
                hdr.hdr_size(),
                entry,
                cursor.levels[p_level].hashval,
            )?;
            cursor.levels[this_level].dirty = true;
        }
    }

    // Release this level's buffer, writing patches back.
    let dirty = cursor.levels[this_level].dirty
        || (cursor.levels[this_level].bad_crc && !walk.ctx.no_modify());
    if dirty && !walk.ctx.no_modify() {
        let bno = cursor.levels[this_level].bno;
        walk.write(bno, &mut block)?;
    }
    drop(block);
    cursor.levels[this_level].dirty = false;

    if this_level >= cursor.active {
        return Ok(true);
    }
    cursor.levels[this_level].hashval = last_ent.hashval;
    verify_final_dir2_path(walk, cursor, this_level)
}

/// Drop every buffer still held above `prev_level`. The success path
/// expects all of them already released; the error path tolerates and
/// frees whatever is left without writing it.
fn release_cursor(walk: &NodeWalk<'_>, cursor: &mut Cursor, prev_level: usize, error: bool) {
    for level in prev_level + 1..=cursor.active {
        if cursor.levels[level].block.take().is_some() {
            if !error {
                warn!(
                    target: "xrec::repair::dir",
                    ino = %walk.ino,
                    block = cursor.levels[level].bno,
                    "cursor release found an unexpected held buffer"
                );
            }
            debug_assert!(error, "success path must have released every level");
        }
        cursor.levels[level].dirty = false;
    }
}
