//! Shortform directory repair.
//!
//! Entries live packed in the inode fork, so a condemned entry is spliced
//! out by moving the tail of the fork down over it. After the walk the
//! stored entry count, i8 count, directory size, and offsets are
//! reconciled with what was actually found.

use crate::context::RepairContext;
use crate::data::{InoVerdict, classify_ino, name_is_illegal};
use crate::inode::DirInode;
use crate::oracle::InodeOracle;
use tracing::warn;
use xrec_error::Result;
use xrec_ondisk::dir::{
    LEAF_ENTRY_SIZE, sf_entry_at, sf_entsize, sf_fix_i8, sf_fix_offsets, sf_hdr_size,
    sf_parse_header, sf_put_count, sf_put_i8count, sf_put_parent,
};
use xrec_types::{Generation, InodeNumber};

/// count + stale words of the inline leaf tail.
const BLOCK_TAIL_SIZE: usize = 8;

/// What the shortform walk decided about one entry.
enum EntryFate {
    Keep,
    Junk(&'static str),
    /// Bad namelen or an entry running past the directory size: the walk
    /// cannot trust anything after this point.
    TruncateRest(&'static str),
}

pub(crate) struct SfOutcome {
    pub parent: InodeNumber,
    pub repaired: bool,
}

/// Validate and repair a shortform directory in place.
pub(crate) fn process_sf_dir(
    ctx: &RepairContext,
    oracle: &dyn InodeOracle,
    inode: &mut DirInode,
) -> Result<SfOutcome> {
    let ino = inode.ino;
    let max_size = inode.fork.len();
    let mut dir_size = (inode.di_size as usize).min(max_size);
    let mut repaired = false;

    let hdr = sf_parse_header(&inode.fork)?;
    let i8 = hdr.uses_i8();
    let mut num_entries = u32::from(hdr.count);
    let mut i8_found = u32::from(hdr.parent > InodeNumber::MAX_SHORT);

    // An entry count that cannot possibly fit the fork means the count
    // byte itself is garbage; walk until the fork runs out instead.
    if num_entries == 0
        || num_entries as usize * sf_entsize(i8, 1) + sf_hdr_size(false) > max_size
    {
        num_entries = 0xFF;
    }

    let mut offset = ctx.dir_geo.data_first_offset();
    let mut bad_offset = false;
    let mut next_off = sf_hdr_size(i8);
    let mut i = 0_u32;

    while i < num_entries && next_off < dir_size {
        let Ok(entry) = sf_entry_at(&inode.fork, next_off, i8) else {
            warn!(
                target: "xrec::repair::dir",
                %ino,
                entry = i,
                "shortform entry overruns the fork, junking remaining entries"
            );
            break;
        };
        let name_end = entry.name_off + entry.namelen as usize;
        let fate = {
            let name = &inode.fork[entry.name_off..name_end];
            entry_fate(ctx, oracle, ino, entry.ino, name, next_off, entry.size, dir_size)
        };

        if let EntryFate::TruncateRest(reason) = fate {
            warn!(
                target: "xrec::repair::dir",
                %ino,
                entry = i,
                reason,
                remaining = num_entries - i,
                "bad entry in shortform dir, {} remaining entries",
                if ctx.no_modify() { "would junk" } else { "junking" }
            );
            break;
        }

        if usize::from(entry.offset) < offset {
            warn!(
                target: "xrec::repair::dir",
                %ino,
                "entry contains offset out of order in shortform dir"
            );
            bad_offset = true;
        }
        offset = usize::from(entry.offset) + ctx.dir_geo.data_entsize(entry.namelen as usize);

        match fate {
            EntryFate::Junk(reason) => {
                let name =
                    String::from_utf8_lossy(&inode.fork[entry.name_off..name_end]).into_owned();
                if ctx.no_modify() {
                    warn!(
                        target: "xrec::repair::dir",
                        %ino,
                        name = %name,
                        reason,
                        "would have junked entry in shortform directory"
                    );
                    // Cannot splice; step over it so later entries still get
                    // looked at.
                    next_off += entry.size;
                    i += 1;
                } else {
                    splice_out(inode, next_off, entry.size, max_size);
                    dir_size -= entry.size;
                    num_entries -= 1;
                    repaired = true;
                    warn!(
                        target: "xrec::repair::dir",
                        %ino,
                        name = %name,
                        reason,
                        "junking entry in shortform directory"
                    );
                    // Do not advance: the splice moved the next entry here.
                }
            }
            EntryFate::Keep => {
                if entry.ino > InodeNumber::MAX_SHORT {
                    i8_found += 1;
                }
                next_off += entry.size;
                i += 1;
            }
            EntryFate::TruncateRest(_) => {}
        }
    }

    // Reconcile stored counts and size with what the walk found.
    let hdr = sf_parse_header(&inode.fork)?;
    if u32::from(hdr.count) != i {
        warn!(
            target: "xrec::repair::dir",
            %ino,
            was = hdr.count,
            now = i,
            "{} entry count in directory",
            ctx.fix_verb()
        );
        if !ctx.no_modify() {
            sf_put_count(&mut inode.fork, i as u8)?;
            inode.dirty = true;
            repaired = true;
        }
    }

    let mut end_off = next_off;
    if u32::from(hdr.i8count) != i8_found {
        warn!(
            target: "xrec::repair::dir",
            %ino,
            was = hdr.i8count,
            now = i8_found,
            "{} i8 count in directory",
            ctx.fix_verb()
        );
        if !ctx.no_modify() {
            if i8_found == 0 {
                end_off = sf_fix_i8(&mut inode.fork, end_off)?;
            } else {
                sf_put_i8count(&mut inode.fork, i8_found as u8)?;
            }
            inode.dirty = true;
            repaired = true;
        }
    }

    if end_off as u64 != inode.di_size {
        warn!(
            target: "xrec::repair::dir",
            %ino,
            was = inode.di_size,
            now = end_off,
            "{} directory size",
            ctx.fix_verb()
        );
        if !ctx.no_modify() {
            inode.di_size = end_off as u64;
            inode.dirty = true;
            repaired = true;
        }
    }

    // The virtual data block a shortform dir converts into must also fit
    // its leaf tail; offsets too high mean the offsets are garbage.
    let hdr = sf_parse_header(&inode.fork)?;
    let tail_needed = (usize::from(hdr.count) + 2) * LEAF_ENTRY_SIZE + BLOCK_TAIL_SIZE;
    if offset + tail_needed > ctx.dir_geo.blksize as usize {
        warn!(target: "xrec::repair::dir", %ino, "directory offsets too high");
        bad_offset = true;
    }
    if bad_offset {
        warn!(
            target: "xrec::repair::dir",
            %ino,
            "{} entry offsets in directory",
            ctx.fix_verb()
        );
        if !ctx.no_modify() {
            sf_fix_offsets(&mut inode.fork, end_off, &ctx.dir_geo)?;
            inode.dirty = true;
            repaired = true;
        }
    }

    let parent = fix_parent(ctx, inode, &mut repaired)?;

    Ok(SfOutcome { parent, repaired })
}

#[allow(clippy::too_many_arguments)]
fn entry_fate(
    ctx: &RepairContext,
    oracle: &dyn InodeOracle,
    dir_ino: InodeNumber,
    ent_ino: InodeNumber,
    name: &[u8],
    entry_off: usize,
    entry_size: usize,
    dir_size: usize,
) -> EntryFate {
    // Shortform dirs contain neither `.` nor `..`, so a self reference is
    // always wrong.
    let mut fate = if ent_ino == dir_ino {
        EntryFate::Junk("references own inode")
    } else {
        match classify_ino(ctx, oracle, ent_ino) {
            InoVerdict::Ok => EntryFate::Keep,
            InoVerdict::Clear(reason) => EntryFate::Junk(reason),
            InoVerdict::Uncertain => {
                oracle.add_inode_uncertain(ent_ino, Generation(0));
                EntryFate::Keep
            }
        }
    };

    if name.is_empty() {
        return EntryFate::TruncateRest("zero-length name");
    }
    if entry_off + entry_size > dir_size {
        return EntryFate::TruncateRest("extends past end of dir");
    }

    if matches!(fate, EntryFate::Keep) && name_is_illegal(name) {
        fate = EntryFate::Junk("contains illegal character");
    }
    fate
}

/// Splice the condemned entry out: copy the fork tail down over it, zero
/// the freed space at the end, and drop the stored count and size.
fn splice_out(inode: &mut DirInode, entry_off: usize, entry_size: usize, max_size: usize) {
    inode.fork.copy_within(entry_off + entry_size..max_size, entry_off);
    let zero_from = max_size - entry_size;
    for byte in &mut inode.fork[zero_from..max_size] {
        *byte = 0;
    }
    inode.fork[0] = inode.fork[0].saturating_sub(1);
    inode.di_size -= entry_size as u64;
    inode.dirty = true;
}

/// Validate and repair the shortform parent pointer.
fn fix_parent(
    ctx: &RepairContext,
    inode: &mut DirInode,
    repaired: &mut bool,
) -> Result<InodeNumber> {
    let ino = inode.ino;
    let hdr = sf_parse_header(&inode.fork)?;
    let i8 = hdr.uses_i8();
    let mut parent = hdr.parent;

    if !ctx.fs.inum_is_valid(parent) {
        warn!(
            target: "xrec::repair::dir",
            %ino,
            bad_parent = %parent,
            "bogus .. inode number in directory, {} inode number",
            if ctx.no_modify() { "would clear" } else { "clearing" }
        );
        parent = InodeNumber::NULL;
        if !ctx.no_modify() {
            sf_put_parent(&mut inode.fork, i8, InodeNumber(0))?;
            inode.dirty = true;
            *repaired = true;
        }
    } else if ino == ctx.fs.root_ino && parent != ino {
        // The root's .. must point at itself.
        warn!(
            target: "xrec::repair::dir",
            %ino,
            was = %parent,
            "{} root directory .. entry",
            ctx.fix_verb()
        );
        if !ctx.no_modify() {
            parent = ino;
            sf_put_parent(&mut inode.fork, i8, ino)?;
            inode.dirty = true;
            *repaired = true;
        }
    } else if parent == ino && ino != ctx.fs.root_ino {
        // And nothing else may point at itself.
        warn!(
            target: "xrec::repair::dir",
            %ino,
            "bad .. entry in directory, points to self, {} inode number",
            if ctx.no_modify() { "would clear" } else { "clearing" }
        );
        parent = InodeNumber::NULL;
        if !ctx.no_modify() {
            sf_put_parent(&mut inode.fork, i8, InodeNumber(0))?;
            inode.dirty = true;
            *repaired = true;
        }
    }

    Ok(parent)
}
