//! Directory repair over synthetic images: shortform splicing, block-format
//! bestfree rebuilds, and node-format hash path patching.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use xrec_block::{BlockIo, LogBuf, MemDevice};
use xrec_ondisk::dir::{
    BLOCK_MAGIC_V2, BestFree, BlockTail, DATA_FREE_TAG, DaHeader, LEAFN_MAGIC_V2, LeafEntry,
    NODE_MAGIC_V2, NodeEntry, data_entsize_raw, encode_da_header, namehash, put_leaf_entry,
    put_node_entry, read_bestfree, sf_entsize, sf_hdr_size, sf_parse_header, write_bestfree,
    write_block_tail,
};
use xrec_ondisk::geometry::{DirGeometry, DirVersion, FsGeometry};
use xrec_repair::{
    BlockMap, BmapExtent, DirInode, InodeFormat, InodeOracle, InodeRec, RepairContext,
    RepairOptions, process_dir,
};
use xrec_types::{
    AgInode, AgNumber, Daddr, Generation, InodeNumber, write_be_u16, write_be_u32, write_be_u64,
};

const ROOT: InodeNumber = InodeNumber(128);

fn fs_geometry() -> FsGeometry {
    FsGeometry {
        uuid: [7; 16],
        block_size: 4096,
        log_bb_len: 64,
        root_ino: ROOT,
        rbm_ino: InodeNumber(129),
        rsum_ino: InodeNumber(130),
        uquot_ino: InodeNumber::NULL,
        gquot_ino: InodeNumber::NULL,
        pquot_ino: InodeNumber::NULL,
        ag_count: 4,
        ag_inode_bits: 32,
    }
}

fn context(no_modify: bool) -> RepairContext {
    RepairContext::new(
        fs_geometry(),
        DirGeometry::new(4096, DirVersion::V2),
        RepairOptions {
            no_modify,
            ino_discovery: false,
        },
    )
}

/// Map-backed oracle: every inode in `known` is confirmed; the bool marks
/// it free.
struct MemOracle {
    fs: FsGeometry,
    known: BTreeMap<u64, bool>,
    uncertain: Mutex<Vec<u64>>,
}

impl MemOracle {
    fn new(known: &[(u64, bool)]) -> Self {
        Self {
            fs: fs_geometry(),
            known: known.iter().copied().collect(),
            uncertain: Mutex::new(Vec::new()),
        }
    }
}

impl InodeOracle for MemOracle {
    fn verify_inum(&self, ino: InodeNumber) -> bool {
        self.fs.inum_is_valid(ino)
    }

    fn find_inode_rec(&self, agno: AgNumber, agino: AgInode) -> Option<InodeRec> {
        let start = agino.0 & !63;
        let base = (u64::from(agno.0) << self.fs.ag_inode_bits) | u64::from(start);
        let mut confirmed = 0_u64;
        let mut free = 0_u64;
        for off in 0..64_u64 {
            if let Some(&is_free) = self.known.get(&(base + off)) {
                confirmed |= 1 << off;
                if is_free {
                    free |= 1 << off;
                }
            }
        }
        (confirmed != 0).then_some(InodeRec {
            start_agino: AgInode(start),
            confirmed,
            free,
        })
    }

    fn add_inode_uncertain(&self, ino: InodeNumber, _generation: Generation) {
        self.uncertain.lock().push(ino.0);
    }
}

// ── Shortform builders ──────────────────────────────────────────────────────

fn build_sf_fork(capacity: usize, parent: u64, entries: &[(&[u8], u16, u64)]) -> (Vec<u8>, usize) {
    let mut fork = vec![0_u8; capacity];
    fork[0] = entries.len() as u8;
    fork[1] = 0;
    write_be_u32(&mut fork, 2, parent as u32).expect("parent");
    let mut off = sf_hdr_size(false);
    for (name, offset, ino) in entries {
        fork[off] = name.len() as u8;
        write_be_u16(&mut fork, off + 1, *offset).expect("offset");
        fork[off + 3..off + 3 + name.len()].copy_from_slice(name);
        write_be_u32(&mut fork, off + 3 + name.len(), *ino as u32).expect("ino");
        off += sf_entsize(false, name.len());
    }
    (fork, off)
}

fn sf_inode(ino: u64, fork: Vec<u8>, di_size: usize) -> DirInode {
    DirInode::new(InodeNumber(ino), di_size as u64, InodeFormat::Local, fork)
}

#[test]
fn shortform_entry_with_slash_is_spliced_out() {
    let ctx = context(false);
    let oracle = MemOracle::new(&[(99, false), (88, false)]);
    let (fork, used) = build_sf_fork(256, ROOT.0, &[(b"ok", 16, 99), (b"ba/d", 32, 88)]);
    let mut inode = sf_inode(300, fork, used);
    let dev = MemDevice::new(8);

    let report = process_dir(&ctx, &oracle, &dev, &mut inode, &BlockMap::default())
        .expect("process_dir");

    assert!(!report.discard);
    assert!(report.repaired);
    assert!(inode.dirty);
    let hdr = sf_parse_header(&inode.fork).expect("header");
    assert_eq!(hdr.count, 1);
    let expected_size = sf_hdr_size(false) + sf_entsize(false, 2);
    assert_eq!(inode.di_size, expected_size as u64);
    // The spliced tail is zeroed.
    assert!(inode.fork[expected_size..].iter().all(|b| *b == 0));
    assert_eq!(report.parent, ROOT);
}

#[test]
fn shortform_duplicate_names_are_legal_and_truncation_fixes_counts() {
    let ctx = context(false);
    let oracle = MemOracle::new(&[(99, false), (88, false), (77, false)]);

    // All three entries intact: duplicates stay.
    let (fork, used) = build_sf_fork(
        256,
        ROOT.0,
        &[(b"a", 16, 99), (b"b", 32, 88), (b"b", 48, 77)],
    );
    let mut inode = sf_inode(300, fork, used);
    let dev = MemDevice::new(8);
    let report = process_dir(&ctx, &oracle, &dev, &mut inode, &BlockMap::default())
        .expect("process_dir");
    assert!(!report.discard);
    assert_eq!(sf_parse_header(&inode.fork).expect("header").count, 3);
    assert!(!inode.dirty);

    // Declared size ends mid-entry-3: everything from there on is junked
    // and the stored count and size corrected.
    let (fork, used) = build_sf_fork(
        256,
        ROOT.0,
        &[(b"a", 16, 99), (b"b", 32, 88), (b"b", 48, 77)],
    );
    let truncated = used - 3;
    let mut inode = sf_inode(300, fork, truncated);
    let report = process_dir(&ctx, &oracle, &dev, &mut inode, &BlockMap::default())
        .expect("process_dir");
    assert!(!report.discard);
    assert!(report.repaired);
    let hdr = sf_parse_header(&inode.fork).expect("header");
    assert_eq!(hdr.count, 2);
    let two_entries = sf_hdr_size(false) + 2 * sf_entsize(false, 1);
    assert_eq!(inode.di_size, two_entries as u64);
}

#[test]
fn shortform_parent_rules() {
    let dev = MemDevice::new(8);
    let oracle = MemOracle::new(&[(99, false)]);

    // Root with a parent that is not itself gets patched back to itself.
    let ctx = context(false);
    let (fork, used) = build_sf_fork(256, 300, &[(b"a", 16, 99)]);
    let mut inode = sf_inode(ROOT.0, fork, used);
    let report = process_dir(&ctx, &oracle, &dev, &mut inode, &BlockMap::default())
        .expect("process_dir");
    assert_eq!(report.parent, ROOT);
    assert_eq!(sf_parse_header(&inode.fork).expect("header").parent, ROOT);

    // A non-root directory pointing .. at itself loses its parent.
    let (fork, used) = build_sf_fork(256, 300, &[(b"a", 16, 99)]);
    let mut inode = sf_inode(300, fork, used);
    let report = process_dir(&ctx, &oracle, &dev, &mut inode, &BlockMap::default())
        .expect("process_dir");
    assert_eq!(report.parent, InodeNumber::NULL);
    assert_eq!(
        sf_parse_header(&inode.fork).expect("header").parent,
        InodeNumber(0)
    );
}

#[test]
fn shortform_no_modify_leaves_fork_untouched() {
    let ctx = context(true);
    let oracle = MemOracle::new(&[(99, false), (88, false)]);
    let (fork, used) = build_sf_fork(256, 300, &[(b"ok", 16, 99), (b"ba/d", 32, 88)]);
    let snapshot = fork.clone();
    let mut inode = sf_inode(300, fork, used);
    let dev = MemDevice::new(8);

    let report = process_dir(&ctx, &oracle, &dev, &mut inode, &BlockMap::default())
        .expect("process_dir");

    assert!(!report.discard);
    assert!(!report.repaired);
    assert!(!inode.dirty);
    assert_eq!(inode.fork, snapshot);
    assert_eq!(inode.di_size, used as u64);
}

// ── Block-format builders ───────────────────────────────────────────────────

struct BlockDirBuilder {
    block: Vec<u8>,
    off: usize,
    entries: Vec<(u32, u16)>,
}

impl BlockDirBuilder {
    fn new(blksize: usize) -> Self {
        let mut block = vec![0_u8; blksize];
        write_be_u32(&mut block, 0, BLOCK_MAGIC_V2).expect("magic");
        Self {
            block,
            off: 16,
            entries: Vec::new(),
        }
    }

    fn entry(&mut self, name: &[u8], ino: u64) -> &mut Self {
        let off = self.off;
        write_be_u64(&mut self.block, off, ino).expect("ino");
        self.block[off + 8] = name.len() as u8;
        self.block[off + 9..off + 9 + name.len()].copy_from_slice(name);
        let size = data_entsize_raw(name.len());
        write_be_u16(&mut self.block, off + size - 2, off as u16).expect("tag");
        self.entries.push((namehash(name), (off >> 3) as u16));
        self.off += size;
        self
    }

    /// Lay the block out as a standalone data block: no inline leaf tail,
    /// one free region running to the end of the block.
    fn finish_data(mut self) -> Vec<u8> {
        let blksize = self.block.len();
        write_be_u32(&mut self.block, 0, xrec_ondisk::dir::DATA_MAGIC_V2).expect("magic");
        let free_off = self.off;
        let free_len = blksize - free_off;
        write_be_u16(&mut self.block, free_off, DATA_FREE_TAG).expect("freetag");
        write_be_u16(&mut self.block, free_off + 2, free_len as u16).expect("freelen");
        write_be_u16(&mut self.block, free_off + free_len - 2, free_off as u16).expect("tag");
        write_bestfree(
            &mut self.block,
            DirVersion::V2,
            &[
                BestFree {
                    offset: free_off as u16,
                    length: free_len as u16,
                },
                BestFree::default(),
                BestFree::default(),
            ],
        )
        .expect("bestfree");
        self.block
    }

    /// Fill to the leaf array with one free region, write the tail, the
    /// hash-sorted leaf entries, and the bestfree table.
    fn finish(mut self) -> Vec<u8> {
        let blksize = self.block.len();
        let leaf_base = blksize - 8 - self.entries.len() * 8;
        let free_off = self.off;
        let free_len = leaf_base - free_off;
        write_be_u16(&mut self.block, free_off, DATA_FREE_TAG).expect("freetag");
        write_be_u16(&mut self.block, free_off + 2, free_len as u16).expect("freelen");
        write_be_u16(&mut self.block, free_off + free_len - 2, free_off as u16).expect("tag");

        write_block_tail(
            &mut self.block,
            BlockTail {
                count: self.entries.len() as u32,
                stale: 0,
            },
        )
        .expect("tail");
        self.entries.sort_by_key(|(hash, _)| *hash);
        for (i, (hash, addr)) in self.entries.iter().enumerate() {
            put_leaf_entry(
                &mut self.block,
                leaf_base,
                i,
                LeafEntry {
                    hashval: *hash,
                    address: u32::from(*addr),
                },
            )
            .expect("leaf entry");
        }

        write_bestfree(
            &mut self.block,
            DirVersion::V2,
            &[
                BestFree {
                    offset: free_off as u16,
                    length: free_len as u16,
                },
                BestFree::default(),
                BestFree::default(),
            ],
        )
        .expect("bestfree");
        self.block
    }
}

fn write_fs_block(dev: &MemDevice, daddr: u64, block: &[u8]) {
    let nbbs = (block.len() / 512) as u32;
    let mut buf = LogBuf::zeroed(nbbs);
    buf.as_mut_slice().copy_from_slice(block);
    dev.write_bbs(Daddr(daddr), nbbs, &buf).expect("write fs block");
}

fn read_fs_block(dev: &MemDevice, daddr: u64, blksize: usize) -> Vec<u8> {
    let nbbs = (blksize / 512) as u32;
    let mut buf = LogBuf::zeroed(nbbs);
    dev.read_bbs(Daddr(daddr), nbbs, &mut buf).expect("read fs block");
    buf.into_vec()
}

#[test]
fn block_dir_bad_bestfree_is_rebuilt_and_written() {
    let ctx = context(false);
    let dir_ino = 500_u64;
    let oracle = MemOracle::new(&[(500, false), (99, false), (88, false)]);

    let mut builder = BlockDirBuilder::new(4096);
    builder
        .entry(b".", dir_ino)
        .entry(b"..", ROOT.0)
        .entry(b"alpha", 99)
        .entry(b"beta", 88);
    let mut block = builder.finish();
    // Break monotonicity: bestfree[0] shorter than bestfree[1].
    let good = read_bestfree(&block, DirVersion::V2).expect("bestfree");
    write_bestfree(
        &mut block,
        DirVersion::V2,
        &[
            BestFree {
                offset: good[0].offset,
                length: 8,
            },
            BestFree {
                offset: 0,
                length: 24,
            },
            BestFree::default(),
        ],
    )
    .expect("corrupt bestfree");

    let dev = MemDevice::new(16);
    write_fs_block(&dev, 0, &block);
    let blkmap = BlockMap::new(vec![BmapExtent {
        file_off: 0,
        daddr: Daddr(0),
        count: 1,
    }]);
    let mut inode = DirInode::new(InodeNumber(dir_ino), 4096, InodeFormat::Extents, Vec::new());

    let report = process_dir(&ctx, &oracle, &dev, &mut inode, &blkmap).expect("process_dir");

    assert!(!report.discard);
    assert!(report.repaired);
    assert!(report.saw_dot);
    assert!(report.saw_dotdot);
    assert_eq!(report.parent, ROOT);

    let written = read_fs_block(&dev, 0, 4096);
    let rebuilt = read_bestfree(&written, DirVersion::V2).expect("bestfree");
    assert_eq!(rebuilt[0], good[0]);
    assert_eq!(rebuilt[1], BestFree::default());
    assert_eq!(rebuilt[2], BestFree::default());
}

#[test]
fn block_dir_entry_pointing_at_free_inode_is_tombstoned() {
    let ctx = context(false);
    let dir_ino = 500_u64;
    // 88 is a freed inode.
    let oracle = MemOracle::new(&[(500, false), (99, false), (88, true)]);

    let mut builder = BlockDirBuilder::new(4096);
    builder
        .entry(b".", dir_ino)
        .entry(b"..", ROOT.0)
        .entry(b"alpha", 99)
        .entry(b"gone", 88);
    let block = builder.finish();
    let gone_off = 16
        + data_entsize_raw(1) * 2
        + data_entsize_raw(5);

    let dev = MemDevice::new(16);
    write_fs_block(&dev, 0, &block);
    let blkmap = BlockMap::new(vec![BmapExtent {
        file_off: 0,
        daddr: Daddr(0),
        count: 1,
    }]);
    let mut inode = DirInode::new(InodeNumber(dir_ino), 4096, InodeFormat::Extents, Vec::new());

    let report = process_dir(&ctx, &oracle, &dev, &mut inode, &blkmap).expect("process_dir");
    assert!(!report.discard);
    assert!(report.repaired);

    let written = read_fs_block(&dev, 0, 4096);
    // First name byte replaced by the removal sentinel, nothing spliced.
    assert_eq!(written[gone_off + 9], b'/');
    assert_eq!(&written[gone_off + 10..gone_off + 13], b"one");
}

#[test]
fn block_dir_dot_fixups() {
    let ctx = context(false);
    let dir_ino = 500_u64;
    let oracle = MemOracle::new(&[(500, false), (99, false), (77, false)]);

    // `.` pointing at the wrong inode and a duplicate `..`.
    let mut builder = BlockDirBuilder::new(4096);
    builder
        .entry(b".", 99)
        .entry(b"..", ROOT.0)
        .entry(b"..", 77)
        .entry(b"alpha", 99);
    let block = builder.finish();
    let dup_dotdot_off = 16 + data_entsize_raw(1) + data_entsize_raw(2);

    let dev = MemDevice::new(16);
    write_fs_block(&dev, 0, &block);
    let blkmap = BlockMap::new(vec![BmapExtent {
        file_off: 0,
        daddr: Daddr(0),
        count: 1,
    }]);
    let mut inode = DirInode::new(InodeNumber(dir_ino), 4096, InodeFormat::Extents, Vec::new());

    let report = process_dir(&ctx, &oracle, &dev, &mut inode, &blkmap).expect("process_dir");
    assert!(!report.discard);
    assert_eq!(report.parent, ROOT);

    let written = read_fs_block(&dev, 0, 4096);
    // `.` patched to the directory's own inode.
    assert_eq!(
        u64::from_be_bytes(written[16..24].try_into().expect("8 bytes")),
        dir_ino
    );
    // The second `..` was tombstoned.
    assert_eq!(written[dup_dotdot_off + 9], b'/');
}

#[test]
fn block_dir_corrupt_walk_discards_without_write() {
    let ctx = context(false);
    let dir_ino = 500_u64;
    let oracle = MemOracle::new(&[(500, false), (99, false)]);

    let mut builder = BlockDirBuilder::new(4096);
    builder.entry(b".", dir_ino).entry(b"..", ROOT.0).entry(b"x", 99);
    let mut block = builder.finish();
    // Smash the tag of the third entry so the structural walk fails.
    let x_off = 16 + data_entsize_raw(1) + data_entsize_raw(2);
    let x_size = data_entsize_raw(1);
    write_be_u16(&mut block, x_off + x_size - 2, 0xBEEF).expect("bad tag");

    let dev = MemDevice::new(16);
    write_fs_block(&dev, 0, &block);
    let before = dev.snapshot();
    let blkmap = BlockMap::new(vec![BmapExtent {
        file_off: 0,
        daddr: Daddr(0),
        count: 1,
    }]);
    let mut inode = DirInode::new(InodeNumber(dir_ino), 4096, InodeFormat::Extents, Vec::new());

    let report = process_dir(&ctx, &oracle, &dev, &mut inode, &blkmap).expect("process_dir");
    assert!(report.discard);
    // Discarded blocks are never written back, even partially.
    assert_eq!(dev.snapshot(), before);
}

// ── Node-format builders ────────────────────────────────────────────────────

fn build_leaf_block(
    blksize: usize,
    forw: u32,
    back: u32,
    hashes: &[u32],
) -> Vec<u8> {
    let mut block = vec![0_u8; blksize];
    encode_da_header(
        &mut block,
        &DaHeader {
            forw,
            back,
            magic: LEAFN_MAGIC_V2,
            count: hashes.len() as u16,
            fourth: 0,
        },
    )
    .expect("leaf header");
    for (i, hash) in hashes.iter().enumerate() {
        put_leaf_entry(
            &mut block,
            16,
            i,
            LeafEntry {
                hashval: *hash,
                address: 0x40 + i as u32,
            },
        )
        .expect("leaf entry");
    }
    block
}

fn build_node_block(blksize: usize, level: u16, entries: &[(u32, u32)]) -> Vec<u8> {
    let mut block = vec![0_u8; blksize];
    encode_da_header(
        &mut block,
        &DaHeader {
            forw: 0,
            back: 0,
            magic: NODE_MAGIC_V2,
            count: entries.len() as u16,
            fourth: level,
        },
    )
    .expect("node header");
    for (i, (hash, before)) in entries.iter().enumerate() {
        put_node_entry(
            &mut block,
            16,
            i,
            NodeEntry {
                hashval: *hash,
                before: *before,
            },
        )
        .expect("node entry");
    }
    block
}

/// One data block, a root node at the leaf offset, and two chained leaves.
struct NodeDirImage {
    dev: MemDevice,
    blkmap: BlockMap,
    root_node_daddr: u64,
}

fn build_node_dir(ctx: &RepairContext, dir_ino: u64, second_root_hash: u32) -> NodeDirImage {
    let leafblk = u64::from(ctx.dir_geo.leafblk.0);
    let l1 = leafblk + 1;
    let l2 = leafblk + 2;

    let mut data = BlockDirBuilder::new(4096);
    data.entry(b".", dir_ino).entry(b"..", ROOT.0).entry(b"alpha", 99);
    let data_block = data.finish_data();

    let leaf1 = build_leaf_block(4096, l2 as u32, 0, &[10, 12, 20]);
    let leaf2 = build_leaf_block(4096, 0, l1 as u32, &[30, 33, 40]);
    let root = build_node_block(4096, 1, &[(20, l1 as u32), (second_root_hash, l2 as u32)]);

    let dev = MemDevice::new(64);
    write_fs_block(&dev, 0, &data_block);
    write_fs_block(&dev, 8, &root);
    write_fs_block(&dev, 16, &leaf1);
    write_fs_block(&dev, 24, &leaf2);

    let blkmap = BlockMap::new(vec![
        BmapExtent {
            file_off: 0,
            daddr: Daddr(0),
            count: 1,
        },
        BmapExtent {
            file_off: leafblk,
            daddr: Daddr(8),
            count: 3,
        },
    ]);
    NodeDirImage {
        dev,
        blkmap,
        root_node_daddr: 8,
    }
}

#[test]
fn node_dir_bad_parent_hashval_is_patched_to_child_maximum() {
    let ctx = context(false);
    let dir_ino = 500_u64;
    let oracle = MemOracle::new(&[(500, false), (99, false)]);
    // Parent claims 34 for the second leaf whose greatest hash is 40.
    let image = build_node_dir(&ctx, dir_ino, 34);
    let mut inode = DirInode::new(InodeNumber(dir_ino), 1 << 20, InodeFormat::Btree, Vec::new());

    let report =
        process_dir(&ctx, &oracle, &image.dev, &mut inode, &image.blkmap).expect("process_dir");

    assert!(!report.discard);
    assert!(report.repaired);
    assert!(!ctx.is_bad_dir(InodeNumber(dir_ino)));

    let root = read_fs_block(&image.dev, image.root_node_daddr, 4096);
    let patched = xrec_ondisk::dir::node_entry_at(&root, 16, 1).expect("entry");
    assert_eq!(patched.hashval, 40);
}

#[test]
fn node_dir_with_consistent_tree_is_clean() {
    let ctx = context(false);
    let dir_ino = 500_u64;
    let oracle = MemOracle::new(&[(500, false), (99, false)]);
    let image = build_node_dir(&ctx, dir_ino, 40);
    let before = image.dev.snapshot();
    let mut inode = DirInode::new(InodeNumber(dir_ino), 1 << 20, InodeFormat::Btree, Vec::new());

    let report =
        process_dir(&ctx, &oracle, &image.dev, &mut inode, &image.blkmap).expect("process_dir");

    assert!(!report.discard);
    assert!(!report.repaired);
    assert!(!ctx.is_bad_dir(InodeNumber(dir_ino)));
    assert_eq!(image.dev.snapshot(), before);
}

#[test]
fn node_dir_broken_sibling_chain_lands_on_bad_list() {
    let ctx = context(false);
    let dir_ino = 500_u64;
    let oracle = MemOracle::new(&[(500, false), (99, false)]);
    let image = build_node_dir(&ctx, dir_ino, 40);
    // Break the second leaf's back pointer.
    let broken = build_leaf_block(4096, 0, 0xDEAD, &[30, 33, 40]);
    write_fs_block(&image.dev, 24, &broken);
    let mut inode = DirInode::new(InodeNumber(dir_ino), 1 << 20, InodeFormat::Btree, Vec::new());

    let report =
        process_dir(&ctx, &oracle, &image.dev, &mut inode, &image.blkmap).expect("process_dir");

    // Data blocks were fine, so the directory is not discarded; the tree
    // failure routes it to the rebuild list instead.
    assert!(!report.discard);
    assert!(ctx.is_bad_dir(InodeNumber(dir_ino)));
}

#[test]
fn node_dir_hash_patch_respects_no_modify() {
    let ctx = context(true);
    let dir_ino = 500_u64;
    let oracle = MemOracle::new(&[(500, false), (99, false)]);
    let image = build_node_dir(&ctx, dir_ino, 34);
    let before = image.dev.snapshot();
    let mut inode = DirInode::new(InodeNumber(dir_ino), 1 << 20, InodeFormat::Btree, Vec::new());

    let report =
        process_dir(&ctx, &oracle, &image.dev, &mut inode, &image.blkmap).expect("process_dir");

    assert!(!report.discard);
    assert!(!report.repaired);
    assert_eq!(image.dev.snapshot(), before);
}
