//! Directory block codecs.
//!
//! Covers all four directory encodings: the shortform fork layout, data
//! blocks with their bestfree tables, single-block directories with the
//! inline leaf tail, and the leaf/node hash index blocks. Everything here is
//! a pure function over byte slices; policy lives in the repair crate.

use crate::geometry::{DATA_HDR_SIZE_V2, DATA_HDR_SIZE_V3, DirGeometry, DirVersion};
use xrec_types::{
    InodeNumber, ParseError, ensure_slice, read_be_u16, read_be_u32, read_be_u64, write_be_u16,
    write_be_u32, write_be_u64,
};

// ── Magic numbers ───────────────────────────────────────────────────────────

/// Single-block directory, v2 ("XD2B").
pub const BLOCK_MAGIC_V2: u32 = 0x5844_3242;
/// Single-block directory, v3 ("XDB3").
pub const BLOCK_MAGIC_V3: u32 = 0x5844_4233;
/// Directory data block, v2 ("XD2D").
pub const DATA_MAGIC_V2: u32 = 0x5844_3244;
/// Directory data block, v3 ("XDD3").
pub const DATA_MAGIC_V3: u32 = 0x5844_4433;
/// Leaf block of a node directory, v2.
pub const LEAFN_MAGIC_V2: u16 = 0xD2FF;
/// Leaf block of a node directory, v3.
pub const LEAFN_MAGIC_V3: u16 = 0x3DFF;
/// Interior btree node, v2.
pub const NODE_MAGIC_V2: u16 = 0xFEBE;
/// Interior btree node, v3.
pub const NODE_MAGIC_V3: u16 = 0x3EBE;

/// Tag marking an unused data-block record.
pub const DATA_FREE_TAG: u16 = 0xFFFF;
/// Leaf address for a stale (deleted) hash entry.
pub const NULL_DATAPTR: u32 = 0xFFFF_FFFF;

/// Maximum depth of the directory btree.
pub const DA_MAX_DEPTH: usize = 5;

/// Maximum name length in any directory entry.
pub const MAX_NAMELEN: usize = 255;

// ── Name hash ───────────────────────────────────────────────────────────────

/// The rolling directory name hash every hash index is keyed on.
#[must_use]
pub fn namehash(name: &[u8]) -> u32 {
    name.iter()
        .fold(0_u32, |hash, &ch| u32::from(ch) ^ hash.rotate_left(7))
}

// ── Shortform ───────────────────────────────────────────────────────────────

/// Decoded shortform header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SfHeader {
    pub count: u8,
    pub i8count: u8,
    pub parent: InodeNumber,
}

impl SfHeader {
    #[must_use]
    pub fn uses_i8(&self) -> bool {
        self.i8count > 0
    }
}

/// Header size: count + i8count + parent (4 or 8 bytes).
#[must_use]
pub fn sf_hdr_size(i8: bool) -> usize {
    2 + if i8 { 8 } else { 4 }
}

/// On-disk size of a shortform entry: namelen + offset + name + ino.
#[must_use]
pub fn sf_entsize(i8: bool, namelen: usize) -> usize {
    1 + 2 + namelen + if i8 { 8 } else { 4 }
}

pub fn sf_parse_header(fork: &[u8]) -> Result<SfHeader, ParseError> {
    let count = ensure_slice(fork, 0, 1)?[0];
    let i8count = ensure_slice(fork, 1, 1)?[0];
    let parent = if i8count > 0 {
        InodeNumber(read_be_u64(fork, 2)?)
    } else {
        InodeNumber(u64::from(read_be_u32(fork, 2)?))
    };
    Ok(SfHeader {
        count,
        i8count,
        parent,
    })
}

pub fn sf_put_count(fork: &mut [u8], count: u8) -> Result<(), ParseError> {
    ensure_slice(fork, 0, 1)?;
    fork[0] = count;
    Ok(())
}

pub fn sf_put_i8count(fork: &mut [u8], i8count: u8) -> Result<(), ParseError> {
    ensure_slice(fork, 1, 1)?;
    fork[1] = i8count;
    Ok(())
}

/// Store the parent inode in the width the header currently uses.
pub fn sf_put_parent(fork: &mut [u8], i8: bool, parent: InodeNumber) -> Result<(), ParseError> {
    if i8 {
        write_be_u64(fork, 2, parent.0)
    } else {
        write_be_u32(
            fork,
            2,
            u32::try_from(parent.0).map_err(|_| ParseError::IntegerConversion {
                field: "sf_parent",
            })?,
        )
    }
}

/// Decoded shortform entry plus its location within the fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SfEntry {
    pub entry_off: usize,
    pub namelen: u8,
    pub offset: u16,
    pub name_off: usize,
    pub ino: InodeNumber,
    pub size: usize,
}

/// Parse the entry starting at `entry_off`. `i8` is taken from the header.
pub fn sf_entry_at(fork: &[u8], entry_off: usize, i8: bool) -> Result<SfEntry, ParseError> {
    let namelen = ensure_slice(fork, entry_off, 1)?[0];
    let offset = read_be_u16(fork, entry_off + 1)?;
    let name_off = entry_off + 3;
    ensure_slice(fork, name_off, namelen as usize)?;
    let ino_off = name_off + namelen as usize;
    let ino = if i8 {
        InodeNumber(read_be_u64(fork, ino_off)?)
    } else {
        InodeNumber(u64::from(read_be_u32(fork, ino_off)?))
    };
    Ok(SfEntry {
        entry_off,
        namelen,
        offset,
        name_off,
        ino,
        size: sf_entsize(i8, namelen as usize),
    })
}

/// Overwrite an entry's stored offset.
pub fn sf_put_entry_offset(
    fork: &mut [u8],
    entry_off: usize,
    offset: u16,
) -> Result<(), ParseError> {
    write_be_u16(fork, entry_off + 1, offset)
}

/// Rewrite a fork whose entries use 8-byte inode fields into the 4-byte
/// form. Call only when every inode number (parent included) fits 32 bits.
/// Returns the new used length; the freed tail is zeroed.
pub fn sf_fix_i8(fork: &mut [u8], used: usize) -> Result<usize, ParseError> {
    let hdr = sf_parse_header(fork)?;
    if !hdr.uses_i8() {
        return Ok(used);
    }

    let old: Vec<u8> = fork[..used].to_vec();
    sf_put_i8count(fork, 0)?;
    sf_put_parent(fork, false, hdr.parent)?;

    let mut read_off = sf_hdr_size(true);
    let mut write_off = sf_hdr_size(false);
    while read_off < used {
        let entry = sf_entry_at(&old, read_off, true)?;
        let namelen = entry.namelen as usize;
        ensure_slice(fork, write_off, sf_entsize(false, namelen))?;
        fork[write_off] = entry.namelen;
        write_be_u16(fork, write_off + 1, entry.offset)?;
        let name: Vec<u8> = old[entry.name_off..entry.name_off + namelen].to_vec();
        fork[write_off + 3..write_off + 3 + namelen].copy_from_slice(&name);
        write_be_u32(
            fork,
            write_off + 3 + namelen,
            u32::try_from(entry.ino.0).map_err(|_| ParseError::IntegerConversion {
                field: "sf_entry_ino",
            })?,
        )?;
        read_off += entry.size;
        write_off += sf_entsize(false, namelen);
    }
    for byte in &mut fork[write_off..used] {
        *byte = 0;
    }
    Ok(write_off)
}

/// Regenerate minimal monotone offsets for every shortform entry, starting
/// at the data-block first-entry offset and advancing by each entry's full
/// data-block size.
pub fn sf_fix_offsets(fork: &mut [u8], used: usize, geo: &DirGeometry) -> Result<(), ParseError> {
    let hdr = sf_parse_header(fork)?;
    let i8 = hdr.uses_i8();
    let mut offset = geo.data_first_offset();
    let mut entry_off = sf_hdr_size(i8);
    for _ in 0..hdr.count {
        if entry_off >= used {
            break;
        }
        let entry = sf_entry_at(fork, entry_off, i8)?;
        sf_put_entry_offset(
            fork,
            entry_off,
            u16::try_from(offset).map_err(|_| ParseError::IntegerConversion {
                field: "sf_entry_offset",
            })?,
        )?;
        offset += geo.data_entsize(entry.namelen as usize);
        entry_off += entry.size;
    }
    Ok(())
}

// ── Data blocks ─────────────────────────────────────────────────────────────

/// One bestfree slot: offset and length of a free region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BestFree {
    pub offset: u16,
    pub length: u16,
}

/// Classified data-block magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBlockKind {
    /// Standalone data block (`XD2D`/`XDD3`).
    Data(DirVersion),
    /// Single-block directory with the inline leaf tail (`XD2B`/`XDB3`).
    Block(DirVersion),
}

impl DataBlockKind {
    #[must_use]
    pub fn version(self) -> DirVersion {
        match self {
            Self::Data(v) | Self::Block(v) => v,
        }
    }
}

/// Classify a data-area block by its magic.
pub fn data_block_kind(block: &[u8]) -> Result<DataBlockKind, ParseError> {
    let magic = read_be_u32(block, 0)?;
    match magic {
        DATA_MAGIC_V2 => Ok(DataBlockKind::Data(DirVersion::V2)),
        DATA_MAGIC_V3 => Ok(DataBlockKind::Data(DirVersion::V3)),
        BLOCK_MAGIC_V2 => Ok(DataBlockKind::Block(DirVersion::V2)),
        BLOCK_MAGIC_V3 => Ok(DataBlockKind::Block(DirVersion::V3)),
        other => Err(ParseError::InvalidMagic {
            expected: u64::from(DATA_MAGIC_V2),
            actual: u64::from(other),
        }),
    }
}

/// Offset of the bestfree table within a data block.
#[must_use]
pub fn bestfree_offset(version: DirVersion) -> usize {
    match version {
        DirVersion::V2 => 4,
        DirVersion::V3 => 48,
    }
}

/// Offset of the first data record for a version.
#[must_use]
pub fn data_first_offset(version: DirVersion) -> usize {
    match version {
        DirVersion::V2 => DATA_HDR_SIZE_V2,
        DirVersion::V3 => DATA_HDR_SIZE_V3,
    }
}

pub fn read_bestfree(block: &[u8], version: DirVersion) -> Result<[BestFree; 3], ParseError> {
    let base = bestfree_offset(version);
    let mut out = [BestFree::default(); 3];
    for (i, slot) in out.iter_mut().enumerate() {
        slot.offset = read_be_u16(block, base + i * 4)?;
        slot.length = read_be_u16(block, base + i * 4 + 2)?;
    }
    Ok(out)
}

pub fn write_bestfree(
    block: &mut [u8],
    version: DirVersion,
    table: &[BestFree; 3],
) -> Result<(), ParseError> {
    let base = bestfree_offset(version);
    for (i, slot) in table.iter().enumerate() {
        write_be_u16(block, base + i * 4, slot.offset)?;
        write_be_u16(block, base + i * 4 + 2, slot.length)?;
    }
    Ok(())
}

/// Decoded data-block record at some offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRecord {
    /// Unused space: `length` bytes, trailing tag at `offset + length - 2`.
    Free { length: u16, tag: u16 },
    /// A directory entry; `tag` sits at the record end.
    Entry {
        ino: InodeNumber,
        namelen: u8,
        tag: u16,
    },
}

/// Decode the record starting at `off`. The caller bounds the walk; this
/// only requires the record header fields to be in range.
pub fn data_record_at(block: &[u8], off: usize) -> Result<DataRecord, ParseError> {
    if read_be_u16(block, off)? == DATA_FREE_TAG {
        let length = read_be_u16(block, off + 2)?;
        let tag = if length >= 4 {
            read_be_u16(block, off + length as usize - 2)?
        } else {
            0
        };
        return Ok(DataRecord::Free { length, tag });
    }
    let ino = InodeNumber(read_be_u64(block, off)?);
    let namelen = ensure_slice(block, off + 8, 1)?[0];
    let entsize = data_entsize_raw(namelen as usize);
    let tag = read_be_u16(block, off + entsize - 2)?;
    Ok(DataRecord::Entry { ino, namelen, tag })
}

/// Entry size helper shared with `DirGeometry::data_entsize`.
#[must_use]
pub fn data_entsize_raw(namelen: usize) -> usize {
    (8 + 1 + namelen + 2).div_ceil(crate::geometry::DATA_ALIGN) * crate::geometry::DATA_ALIGN
}

/// Name bytes of the entry at `off`.
pub fn entry_name(block: &[u8], off: usize, namelen: u8) -> Result<&[u8], ParseError> {
    ensure_slice(block, off + 9, namelen as usize)
}

/// Overwrite the first name byte of the entry at `off` (the `/` tombstone
/// the rebuild phase recognizes).
pub fn entry_mark_removed(block: &mut [u8], off: usize) -> Result<(), ParseError> {
    ensure_slice(block, off + 9, 1)?;
    block[off + 9] = b'/';
    Ok(())
}

/// Overwrite the inode number of the entry at `off`.
pub fn entry_put_ino(block: &mut [u8], off: usize, ino: InodeNumber) -> Result<(), ParseError> {
    write_be_u64(block, off, ino.0)
}

/// Force the namelen of the entry at `off` (used to make a zero-length
/// entry walkable before condemning it).
pub fn entry_put_namelen(block: &mut [u8], off: usize, namelen: u8) -> Result<(), ParseError> {
    ensure_slice(block, off + 8, 1)?;
    block[off + 8] = namelen;
    Ok(())
}

/// Recompute the bestfree table by a single forward walk of `[first, end)`.
///
/// Keeps the three largest free regions in decreasing length order; equal
/// lengths keep the earliest offset.
pub fn data_freescan(
    block: &[u8],
    first: usize,
    end: usize,
) -> Result<[BestFree; 3], ParseError> {
    let mut best = [BestFree::default(); 3];
    let mut off = first;
    while off < end {
        match data_record_at(block, off)? {
            DataRecord::Free { length, .. } => {
                if length == 0 {
                    return Err(ParseError::InvalidField {
                        field: "free_length",
                        reason: "zero-length free region",
                    });
                }
                let candidate = BestFree {
                    offset: u16::try_from(off).map_err(|_| ParseError::IntegerConversion {
                        field: "free_offset",
                    })?,
                    length,
                };
                // Strict comparison keeps earlier equal-length regions ahead.
                if candidate.length > best[2].length {
                    let mut i = 2;
                    while i > 0 && best[i - 1].length < candidate.length {
                        best[i] = best[i - 1];
                        i -= 1;
                    }
                    best[i] = candidate;
                }
                off += length as usize;
            }
            DataRecord::Entry { namelen, .. } => {
                off += data_entsize_raw(namelen as usize);
            }
        }
    }
    Ok(best)
}

// ── Single-block tail ───────────────────────────────────────────────────────

/// Inline leaf tail of a single-block directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTail {
    pub count: u32,
    pub stale: u32,
}

pub fn read_block_tail(block: &[u8]) -> Result<BlockTail, ParseError> {
    let len = block.len();
    if len < 8 {
        return Err(ParseError::InsufficientData {
            needed: 8,
            offset: 0,
            actual: len,
        });
    }
    Ok(BlockTail {
        count: read_be_u32(block, len - 8)?,
        stale: read_be_u32(block, len - 4)?,
    })
}

pub fn write_block_tail(block: &mut [u8], tail: BlockTail) -> Result<(), ParseError> {
    let len = block.len();
    write_be_u32(block, len - 8, tail.count)?;
    write_be_u32(block, len - 4, tail.stale)
}

/// Byte offset of the inline leaf-entry array (grows down from the tail).
#[must_use]
pub fn block_leaf_base(block_len: usize, count: u32) -> Option<usize> {
    block_len
        .checked_sub(8)?
        .checked_sub(count as usize * LEAF_ENTRY_SIZE)
}

// ── Leaf and node blocks ────────────────────────────────────────────────────

pub const LEAF_ENTRY_SIZE: usize = 8;
pub const NODE_ENTRY_SIZE: usize = 8;

const DA_OFF_FORW: usize = 0;
const DA_OFF_BACK: usize = 4;
const DA_OFF_MAGIC: usize = 8;
const DA_V2_OFF_COUNT: usize = 12;
const DA_V2_OFF_FOURTH: usize = 14;
const DA_V3_OFF_CRC: usize = 12;
const DA_V3_OFF_COUNT: usize = 56;
const DA_V3_OFF_FOURTH: usize = 58;

/// Magic of a leaf/node block (shared header position for v2 and v3).
pub fn da_magic(block: &[u8]) -> Result<u16, ParseError> {
    read_be_u16(block, DA_OFF_MAGIC)
}

#[must_use]
pub fn da_is_v3_magic(magic: u16) -> bool {
    matches!(magic, LEAFN_MAGIC_V3 | NODE_MAGIC_V3)
}

#[must_use]
pub fn da_hdr_size(magic: u16) -> usize {
    if da_is_v3_magic(magic) {
        crate::geometry::NODE_HDR_SIZE_V3
    } else {
        crate::geometry::NODE_HDR_SIZE_V2
    }
}

/// Shared leaf/node block header. `fourth` is `stale` on a leaf and `level`
/// on an interior node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaHeader {
    pub forw: u32,
    pub back: u32,
    pub magic: u16,
    pub count: u16,
    pub fourth: u16,
}

impl DaHeader {
    #[must_use]
    pub fn hdr_size(&self) -> usize {
        da_hdr_size(self.magic)
    }

    #[must_use]
    pub fn is_leafn(&self) -> bool {
        matches!(self.magic, LEAFN_MAGIC_V2 | LEAFN_MAGIC_V3)
    }

    #[must_use]
    pub fn is_node(&self) -> bool {
        matches!(self.magic, NODE_MAGIC_V2 | NODE_MAGIC_V3)
    }
}

pub fn parse_da_header(block: &[u8]) -> Result<DaHeader, ParseError> {
    let magic = da_magic(block)?;
    let (count_off, fourth_off) = if da_is_v3_magic(magic) {
        (DA_V3_OFF_COUNT, DA_V3_OFF_FOURTH)
    } else {
        (DA_V2_OFF_COUNT, DA_V2_OFF_FOURTH)
    };
    Ok(DaHeader {
        forw: read_be_u32(block, DA_OFF_FORW)?,
        back: read_be_u32(block, DA_OFF_BACK)?,
        magic,
        count: read_be_u16(block, count_off)?,
        fourth: read_be_u16(block, fourth_off)?,
    })
}

pub fn encode_da_header(block: &mut [u8], hdr: &DaHeader) -> Result<(), ParseError> {
    write_be_u32(block, DA_OFF_FORW, hdr.forw)?;
    write_be_u32(block, DA_OFF_BACK, hdr.back)?;
    write_be_u16(block, DA_OFF_MAGIC, hdr.magic)?;
    let (count_off, fourth_off) = if da_is_v3_magic(hdr.magic) {
        (DA_V3_OFF_COUNT, DA_V3_OFF_FOURTH)
    } else {
        (DA_V2_OFF_COUNT, DA_V2_OFF_FOURTH)
    };
    write_be_u16(block, count_off, hdr.count)?;
    write_be_u16(block, fourth_off, hdr.fourth)
}

/// One hash-index leaf entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafEntry {
    pub hashval: u32,
    pub address: u32,
}

pub fn leaf_entry_at(block: &[u8], base: usize, index: usize) -> Result<LeafEntry, ParseError> {
    let off = base + index * LEAF_ENTRY_SIZE;
    Ok(LeafEntry {
        hashval: read_be_u32(block, off)?,
        address: read_be_u32(block, off + 4)?,
    })
}

pub fn put_leaf_entry(
    block: &mut [u8],
    base: usize,
    index: usize,
    entry: LeafEntry,
) -> Result<(), ParseError> {
    let off = base + index * LEAF_ENTRY_SIZE;
    write_be_u32(block, off, entry.hashval)?;
    write_be_u32(block, off + 4, entry.address)
}

/// One interior-node entry: greatest hash in the child at `before`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeEntry {
    pub hashval: u32,
    pub before: u32,
}

pub fn node_entry_at(block: &[u8], hdr_size: usize, index: usize) -> Result<NodeEntry, ParseError> {
    let off = hdr_size + index * NODE_ENTRY_SIZE;
    Ok(NodeEntry {
        hashval: read_be_u32(block, off)?,
        before: read_be_u32(block, off + 4)?,
    })
}

pub fn put_node_entry(
    block: &mut [u8],
    hdr_size: usize,
    index: usize,
    entry: NodeEntry,
) -> Result<(), ParseError> {
    let off = hdr_size + index * NODE_ENTRY_SIZE;
    write_be_u32(block, off, entry.hashval)?;
    write_be_u32(block, off + 4, entry.before)
}

/// Patch only the hashval of a node entry (the D1 repair).
pub fn put_node_hashval(
    block: &mut [u8],
    hdr_size: usize,
    index: usize,
    hashval: u32,
) -> Result<(), ParseError> {
    write_be_u32(block, hdr_size + index * NODE_ENTRY_SIZE, hashval)
}

// ── v3 block checksums ──────────────────────────────────────────────────────

/// CRC field offset within a v3 data block.
pub const DATA_V3_CRC_OFFSET: usize = 4;
/// CRC field offset within a v3 leaf/node block.
pub const DA_V3_CRC_OFFSET: usize = DA_V3_OFF_CRC;

/// crc32c of the block with the checksum field itself zeroed.
pub fn compute_block_crc(block: &[u8], crc_offset: usize) -> Result<u32, ParseError> {
    ensure_slice(block, crc_offset, 4)?;
    let mut crc = crc32c::crc32c(&block[..crc_offset]);
    crc = crc32c::crc32c_append(crc, &[0_u8; 4]);
    crc = crc32c::crc32c_append(crc, &block[crc_offset + 4..]);
    Ok(crc)
}

pub fn verify_block_crc(block: &[u8], crc_offset: usize) -> Result<bool, ParseError> {
    let stored = read_be_u32(block, crc_offset)?;
    Ok(stored == compute_block_crc(block, crc_offset)?)
}

pub fn update_block_crc(block: &mut [u8], crc_offset: usize) -> Result<(), ParseError> {
    let crc = compute_block_crc(block, crc_offset)?;
    write_be_u32(block, crc_offset, crc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::DirGeometry;

    fn build_sf(i8: bool, parent: u64, entries: &[(&[u8], u16, u64)]) -> (Vec<u8>, usize) {
        let mut fork = vec![0_u8; 256];
        fork[0] = entries.len() as u8;
        fork[1] = if i8 { entries.len() as u8 } else { 0 };
        sf_put_parent(&mut fork, i8, InodeNumber(parent)).expect("parent");
        let mut off = sf_hdr_size(i8);
        for (name, offset, ino) in entries {
            fork[off] = name.len() as u8;
            write_be_u16(&mut fork, off + 1, *offset).expect("offset");
            fork[off + 3..off + 3 + name.len()].copy_from_slice(name);
            if i8 {
                write_be_u64(&mut fork, off + 3 + name.len(), *ino).expect("ino");
            } else {
                write_be_u32(&mut fork, off + 3 + name.len(), *ino as u32).expect("ino");
            }
            off += sf_entsize(i8, name.len());
        }
        (fork, off)
    }

    #[test]
    fn sf_parse_and_walk() {
        let (fork, used) = build_sf(false, 128, &[(b"alpha", 16, 200), (b"bx", 40, 300)]);
        let hdr = sf_parse_header(&fork).expect("header");
        assert_eq!(hdr.count, 2);
        assert!(!hdr.uses_i8());
        assert_eq!(hdr.parent, InodeNumber(128));

        let e0 = sf_entry_at(&fork, sf_hdr_size(false), false).expect("entry 0");
        assert_eq!(e0.namelen, 5);
        assert_eq!(e0.ino, InodeNumber(200));
        assert_eq!(&fork[e0.name_off..e0.name_off + 5], b"alpha");

        let e1 = sf_entry_at(&fork, e0.entry_off + e0.size, false).expect("entry 1");
        assert_eq!(e1.ino, InodeNumber(300));
        assert_eq!(e1.entry_off + e1.size, used);
    }

    #[test]
    fn sf_fix_i8_narrows_entries() {
        // The wide inode that forced i8 was already junked; every remaining
        // value fits 32 bits, so the fork narrows.
        let (mut fork, used) = build_sf(true, 128, &[(b"a", 16, 200), (b"bb", 32, 300)]);
        let new_used = sf_fix_i8(&mut fork, used).expect("fix");
        assert!(new_used < used);

        let hdr = sf_parse_header(&fork).expect("header");
        assert_eq!(hdr.i8count, 0);
        assert_eq!(hdr.parent, InodeNumber(128));
        let e0 = sf_entry_at(&fork, sf_hdr_size(false), false).expect("entry 0");
        assert_eq!(e0.ino, InodeNumber(200));
        let e1 = sf_entry_at(&fork, e0.entry_off + e0.size, false).expect("entry 1");
        assert_eq!(e1.ino, InodeNumber(300));
        assert_eq!(e1.entry_off + e1.size, new_used);
        // freed tail zeroed
        assert!(fork[new_used..used].iter().all(|b| *b == 0));
    }

    #[test]
    fn sf_fix_offsets_regenerates_monotone_offsets() {
        let geo = DirGeometry::new(4096, DirVersion::V2);
        let (mut fork, used) = build_sf(false, 128, &[(b"a", 900, 200), (b"bb", 16, 300)]);
        sf_fix_offsets(&mut fork, used, &geo).expect("fix");

        let e0 = sf_entry_at(&fork, sf_hdr_size(false), false).expect("entry 0");
        assert_eq!(e0.offset as usize, geo.data_first_offset());
        let e1 = sf_entry_at(&fork, e0.entry_off + e0.size, false).expect("entry 1");
        assert_eq!(e1.offset as usize, geo.data_first_offset() + geo.data_entsize(1));
    }

    fn put_free(block: &mut [u8], off: usize, length: u16) {
        write_be_u16(block, off, DATA_FREE_TAG).expect("freetag");
        write_be_u16(block, off + 2, length).expect("length");
        write_be_u16(block, off + length as usize - 2, off as u16).expect("tag");
    }

    fn put_entry(block: &mut [u8], off: usize, name: &[u8], ino: u64) -> usize {
        write_be_u64(block, off, ino).expect("ino");
        block[off + 8] = name.len() as u8;
        block[off + 9..off + 9 + name.len()].copy_from_slice(name);
        let size = data_entsize_raw(name.len());
        write_be_u16(block, off + size - 2, off as u16).expect("tag");
        size
    }

    #[test]
    fn freescan_keeps_three_largest_with_ties_earliest() {
        let mut block = vec![0_u8; 512];
        write_be_u32(&mut block, 0, DATA_MAGIC_V2).expect("magic");
        let first = data_first_offset(DirVersion::V2);

        let mut off = first;
        off += put_entry(&mut block, off, b"x", 100);
        put_free(&mut block, off, 32);
        let free_a = off;
        off += 32;
        off += put_entry(&mut block, off, b"y", 101);
        put_free(&mut block, off, 48);
        let free_b = off;
        off += 48;
        put_free(&mut block, off, 32);
        let free_c = off;
        off += 32;
        put_free(&mut block, off, (512 - off) as u16);
        let free_d = off;

        let best = data_freescan(&block, first, 512).expect("freescan");
        // Largest is the block-tail run, then 48, then the EARLIER 32.
        assert_eq!(best[0].offset as usize, free_d);
        assert_eq!(best[1].offset as usize, free_b);
        assert_eq!(best[2].offset as usize, free_a);
        assert!(best[0].length >= best[1].length && best[1].length >= best[2].length);
        let _ = free_c;
    }

    #[test]
    fn freescan_rejects_zero_length_free() {
        let mut block = vec![0_u8; 128];
        write_be_u32(&mut block, 0, DATA_MAGIC_V2).expect("magic");
        write_be_u16(&mut block, 16, DATA_FREE_TAG).expect("freetag");
        // length stays 0
        assert!(data_freescan(&block, 16, 128).is_err());
    }

    #[test]
    fn block_tail_and_leaf_base() {
        let mut block = vec![0_u8; 512];
        write_block_tail(
            &mut block,
            BlockTail {
                count: 3,
                stale: 1,
            },
        )
        .expect("tail");
        let tail = read_block_tail(&block).expect("read tail");
        assert_eq!(tail.count, 3);
        assert_eq!(tail.stale, 1);
        assert_eq!(block_leaf_base(512, 3), Some(512 - 8 - 24));
    }

    #[test]
    fn da_header_v2_v3_field_positions() {
        let mut v2 = vec![0_u8; 512];
        encode_da_header(
            &mut v2,
            &DaHeader {
                forw: 9,
                back: 4,
                magic: LEAFN_MAGIC_V2,
                count: 12,
                fourth: 2,
            },
        )
        .expect("encode v2");
        let h2 = parse_da_header(&v2).expect("parse v2");
        assert!(h2.is_leafn());
        assert_eq!(h2.hdr_size(), 16);
        assert_eq!((h2.forw, h2.back, h2.count, h2.fourth), (9, 4, 12, 2));

        let mut v3 = vec![0_u8; 512];
        encode_da_header(
            &mut v3,
            &DaHeader {
                forw: 1,
                back: 0,
                magic: NODE_MAGIC_V3,
                count: 5,
                fourth: 1,
            },
        )
        .expect("encode v3");
        let h3 = parse_da_header(&v3).expect("parse v3");
        assert!(h3.is_node());
        assert_eq!(h3.hdr_size(), 64);
        assert_eq!(h3.count, 5);
    }

    #[test]
    fn node_entry_hashval_patch() {
        let mut block = vec![0_u8; 512];
        encode_da_header(
            &mut block,
            &DaHeader {
                forw: 0,
                back: 0,
                magic: NODE_MAGIC_V2,
                count: 2,
                fourth: 1,
            },
        )
        .expect("encode");
        put_node_entry(
            &mut block,
            16,
            1,
            NodeEntry {
                hashval: 34,
                before: 77,
            },
        )
        .expect("put");
        put_node_hashval(&mut block, 16, 1, 40).expect("patch");
        let entry = node_entry_at(&block, 16, 1).expect("read");
        assert_eq!(entry.hashval, 40);
        assert_eq!(entry.before, 77);
    }

    #[test]
    fn namehash_is_order_sensitive() {
        assert_eq!(namehash(b""), 0);
        assert_ne!(namehash(b"ab"), namehash(b"ba"));
        // one character: hash = ch
        assert_eq!(namehash(b"a"), u32::from(b'a'));
    }

    #[test]
    fn v3_crc_round_trip() {
        let mut block = vec![0_u8; 512];
        write_be_u32(&mut block, 0, DATA_MAGIC_V3).expect("magic");
        block[100] = 0x42;
        update_block_crc(&mut block, DATA_V3_CRC_OFFSET).expect("update");
        assert!(verify_block_crc(&block, DATA_V3_CRC_OFFSET).expect("verify"));
        block[100] = 0x43;
        assert!(!verify_block_crc(&block, DATA_V3_CRC_OFFSET).expect("verify"));
    }
}
