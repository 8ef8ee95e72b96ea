//! The common directory data-block walk.
//!
//! Used by the single-block path and by the leaf/node path for every data
//! block below the hash index. The walk runs twice over a block: a
//! structural pass that can only accept or discard the whole block, then an
//! entry pass that patches individual entries in place. A condemned entry
//! is never spliced here; its first name byte becomes `/`, the tombstone
//! the rebuild phase recognizes.

use crate::context::RepairContext;
use crate::oracle::InodeOracle;
use tracing::warn;
use xrec_error::Result;
use xrec_ondisk::dir::{
    BestFree, DataRecord, data_entsize_raw, data_freescan, data_record_at, entry_mark_removed,
    entry_name, entry_put_ino, entry_put_namelen, read_bestfree, write_bestfree,
};
use xrec_ondisk::geometry::{DATA_ALIGN, DirVersion};
use xrec_types::{DaBlock, Generation, InodeNumber};

/// `.`/`..` state accumulated across all data blocks of one directory.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DirScanState {
    pub dot: bool,
    pub dotdot: bool,
    pub parent: Option<InodeNumber>,
}

/// Verdict of the shared inode-number filter.
pub(crate) enum InoVerdict {
    Ok,
    Clear(&'static str),
    /// Structurally valid but unknown, with discovery on: queue it.
    Uncertain,
}

/// The filter every referenced inode number runs through: structural
/// validity, reserved metadata inodes, then the oracle.
pub(crate) fn classify_ino(
    ctx: &RepairContext,
    oracle: &dyn InodeOracle,
    ino: InodeNumber,
) -> InoVerdict {
    if !oracle.verify_inum(ino) {
        return InoVerdict::Clear("invalid");
    }
    if let Some(kind) = ctx.fs.reserved_metadata_kind(ino) {
        return InoVerdict::Clear(kind);
    }
    let agno = ctx.fs.ino_to_ag(ino);
    let agino = ctx.fs.ino_to_agino(ino);
    match oracle.find_inode_rec(agno, agino) {
        Some(rec) => {
            let Some(offset) = rec.offset_of(agino) else {
                return InoVerdict::Clear("non-existent");
            };
            debug_assert!(
                oracle.is_inode_confirmed(&rec, offset),
                "oracle records hold confirmed inodes only"
            );
            if oracle.is_inode_free(&rec, offset) && !ctx.ino_discovery() {
                InoVerdict::Clear("free")
            } else {
                InoVerdict::Ok
            }
        }
        None if ctx.ino_discovery() => InoVerdict::Uncertain,
        None => InoVerdict::Clear("non-existent"),
    }
}

/// A name is illegal if it contains a path separator or a NUL.
#[must_use]
pub(crate) fn name_is_illegal(name: &[u8]) -> bool {
    name.iter().any(|&c| c == b'/' || c == 0)
}

/// Walk one data block. `first` and `end` bound the record area (`end`
/// excludes the inline leaf tail in single-block directories). Returns
/// `false` when the block is structurally unusable and must be discarded;
/// `dirty` is set when anything was patched.
pub(crate) fn process_data_block(
    ctx: &RepairContext,
    oracle: &dyn InodeOracle,
    ino: InodeNumber,
    block: &mut [u8],
    da_bno: DaBlock,
    version: DirVersion,
    first: usize,
    end: usize,
    state: &mut DirScanState,
    dirty: &mut bool,
) -> Result<bool> {
    let bestfree = read_bestfree(block, version)?;
    let mut badbest = false;
    let mut freeseen = 0_u32;
    for (slot, bf) in bestfree.iter().enumerate() {
        if bf.length == 0 {
            badbest |= bf.offset != 0;
            freeseen |= 1 << slot;
        }
    }
    badbest |= bestfree[0].length < bestfree[1].length;
    badbest |= bestfree[1].length < bestfree[2].length;

    // Structural pass: every record must be self-consistent or the whole
    // block is untrustworthy.
    let mut off = first;
    let mut lastfree = false;
    while off < end {
        match data_record_at(block, off) {
            Ok(DataRecord::Free { length, tag }) => {
                let length = length as usize;
                if off + length > end || length == 0 || length % DATA_ALIGN != 0 {
                    break;
                }
                if usize::from(tag) != off {
                    break;
                }
                badbest |= lastfree;
                match bestfree.iter().position(|bf| usize::from(bf.offset) == off) {
                    Some(slot) => {
                        badbest |= freeseen & (1 << slot) != 0;
                        freeseen |= 1 << slot;
                    }
                    None => badbest |= length > usize::from(bestfree[2].length),
                }
                off += length;
                lastfree = true;
            }
            Ok(DataRecord::Entry { namelen, tag, .. }) => {
                let entsize = data_entsize_raw(namelen as usize);
                if off + entsize > end {
                    break;
                }
                if usize::from(tag) != off {
                    break;
                }
                off += entsize;
                lastfree = false;
            }
            Err(_) => break,
        }
    }
    if off != end {
        warn!(
            target: "xrec::repair::dir",
            %ino,
            block = %da_bno,
            "corrupt block in directory inode, {} block",
            if ctx.no_modify() { "would junk" } else { "will junk" }
        );
        return Ok(false);
    }

    // Entry pass: patch what can be patched.
    let mut off = first;
    while off < end {
        let record = data_record_at(block, off)?;
        let (ent_ino, mut namelen) = match record {
            DataRecord::Free { length, .. } => {
                off += length as usize;
                continue;
            }
            DataRecord::Entry { ino, namelen, .. } => (ino, namelen),
        };

        let mut clear_reason: Option<&'static str> = None;
        let already_tombstoned = entry_name(block, off, namelen.max(1))?[0] == b'/';
        if !ctx.ino_discovery() && already_tombstoned {
            // Found (or placed) during the discovery phase; leave it for
            // the rebuild pass.
        } else {
            match classify_ino(ctx, oracle, ent_ino) {
                InoVerdict::Ok => {}
                InoVerdict::Clear(reason) => clear_reason = Some(reason),
                InoVerdict::Uncertain => {
                    oracle.add_inode_uncertain(ent_ino, Generation(0));
                }
            }
        }

        let name = entry_name(block, off, namelen)?;
        let is_dot = name == b".";
        let is_dotdot = name == b"..";
        if let Some(reason) = clear_reason {
            warn!(
                target: "xrec::repair::dir",
                %ino,
                block = %da_bno,
                offset = off,
                name = %String::from_utf8_lossy(name),
                target_ino = %ent_ino,
                reason,
                "entry references unusable inode"
            );
        }
        // The dot fixer-upper below sorts out the right inode number.
        if is_dot || is_dotdot {
            clear_reason = None;
        }

        if namelen == 0 {
            warn!(
                target: "xrec::repair::dir",
                %ino,
                block = %da_bno,
                offset = off,
                "entry has zero namelength"
            );
            if !ctx.no_modify() {
                entry_put_namelen(block, off, 1)?;
                namelen = 1;
            }
            clear_reason = Some("zero namelength");
        }

        if clear_reason.is_some() {
            if ctx.no_modify() {
                warn!(
                    target: "xrec::repair::dir",
                    %ino,
                    block = %da_bno,
                    offset = off,
                    "would clear inode number in entry"
                );
            } else {
                warn!(
                    target: "xrec::repair::dir",
                    %ino,
                    block = %da_bno,
                    offset = off,
                    "clearing inode number in entry"
                );
                entry_mark_removed(block, off)?;
                *dirty = true;
            }
        }

        let name = entry_name(block, off, namelen.max(1))?;
        let mut junkit = name[0] == b'/';
        if ctx.ino_discovery() && name_is_illegal(name) {
            warn!(
                target: "xrec::repair::dir",
                %ino,
                block = %da_bno,
                offset = off,
                name = %String::from_utf8_lossy(name),
                "entry has illegal name"
            );
            junkit = true;
        }
        // Tombstones must reach disk for the rebuild phase.
        if !ctx.no_modify() && name[0] == b'/' {
            *dirty = true;
            junkit = false;
        }

        if is_dotdot {
            if !state.dotdot {
                state.dotdot = true;
                state.parent = Some(ent_ino);
                if ino == ent_ino && ino != ctx.fs.root_ino {
                    // `..` == `.` is legal only in the root.
                    state.parent = Some(InodeNumber::NULL);
                    warn!(
                        target: "xrec::repair::dir",
                        %ino,
                        block = %da_bno,
                        "bad .. entry in directory inode, points to self"
                    );
                    junkit = true;
                } else if ino != ent_ino && ino == ctx.fs.root_ino {
                    warn!(
                        target: "xrec::repair::dir",
                        %ino,
                        was = %ent_ino,
                        "{} .. entry in root directory inode",
                        ctx.fix_verb()
                    );
                    if !ctx.no_modify() {
                        entry_put_ino(block, off, ino)?;
                        *dirty = true;
                    }
                    state.parent = Some(ino);
                }
            } else {
                // Both look equally valid; keeping either would be a guess.
                warn!(
                    target: "xrec::repair::dir",
                    %ino,
                    block = %da_bno,
                    "multiple .. entries in directory inode"
                );
                junkit = true;
            }
        } else if is_dot {
            if !state.dot {
                state.dot = true;
                if ent_ino != ino {
                    warn!(
                        target: "xrec::repair::dir",
                        %ino,
                        was = %ent_ino,
                        "{} . entry in directory inode",
                        ctx.fix_verb()
                    );
                    if !ctx.no_modify() {
                        entry_put_ino(block, off, ino)?;
                        *dirty = true;
                    }
                }
            } else {
                warn!(
                    target: "xrec::repair::dir",
                    %ino,
                    block = %da_bno,
                    "multiple . entries in directory inode"
                );
                junkit = true;
            }
        } else if ent_ino == ino {
            warn!(
                target: "xrec::repair::dir",
                %ino,
                block = %da_bno,
                name = %String::from_utf8_lossy(name),
                "entry in directory inode points to self"
            );
            junkit = true;
        }

        if junkit {
            if ctx.no_modify() {
                warn!(
                    target: "xrec::repair::dir",
                    %ino,
                    block = %da_bno,
                    offset = off,
                    "would clear entry"
                );
            } else {
                entry_mark_removed(block, off)?;
                *dirty = true;
                warn!(
                    target: "xrec::repair::dir",
                    %ino,
                    block = %da_bno,
                    offset = off,
                    "clearing entry"
                );
            }
        }

        off += data_entsize_raw(namelen as usize);
    }

    // Bestfree: every slot must have been matched exactly once and the
    // table ordered; otherwise rebuild it from the block contents.
    if freeseen != 0b111 || badbest {
        warn!(
            target: "xrec::repair::dir",
            %ino,
            block = %da_bno,
            "bad bestfree table in directory block, {} table",
            if ctx.no_modify() { "would repair" } else { "repairing" }
        );
        if !ctx.no_modify() {
            let rebuilt: [BestFree; 3] = data_freescan(block, first, end)?;
            write_bestfree(block, version, &rebuilt)?;
            *dirty = true;
        }
    }
    Ok(true)
}
