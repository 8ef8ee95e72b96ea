//! File-offset block map for one directory inode.
//!
//! Maps directory block space (file offsets, in filesystem blocks) to
//! device extents. The map is produced by the inode fork scan of an earlier
//! phase; repair only reads it.

use xrec_block::ExtentMap;
use xrec_types::Daddr;

/// One mapped extent: `count` filesystem blocks of directory space starting
/// at file offset `file_off`, stored contiguously at `daddr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BmapExtent {
    pub file_off: u64,
    pub daddr: Daddr,
    pub count: u64,
}

/// Sorted, non-overlapping extent list for one directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockMap {
    extents: Vec<BmapExtent>,
}

impl BlockMap {
    #[must_use]
    pub fn new(mut extents: Vec<BmapExtent>) -> Self {
        extents.sort_by_key(|e| e.file_off);
        Self { extents }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// One past the last mapped file offset (the directory's length in
    /// filesystem blocks).
    #[must_use]
    pub fn last_off(&self) -> u64 {
        self.extents
            .last()
            .map_or(0, |e| e.file_off + e.count)
    }

    /// First mapped file offset at or after `from`.
    #[must_use]
    pub fn next_off(&self, from: u64) -> Option<u64> {
        for ext in &self.extents {
            if ext.file_off + ext.count <= from {
                continue;
            }
            return Some(ext.file_off.max(from));
        }
        None
    }

    /// Device extents covering `nblocks` filesystem blocks at `file_off`,
    /// with `bb_per_fsb` basic blocks per filesystem block. `None` when any
    /// part of the range is unmapped.
    #[must_use]
    pub fn getn(&self, file_off: u64, nblocks: u32, bb_per_fsb: u32) -> Option<Vec<ExtentMap>> {
        let mut maps = Vec::new();
        let mut want = file_off;
        let end = file_off + u64::from(nblocks);
        while want < end {
            let ext = self
                .extents
                .iter()
                .find(|e| e.file_off <= want && want < e.file_off + e.count)?;
            let take = (ext.file_off + ext.count - want).min(end - want);
            let daddr = ext
                .daddr
                .checked_add((want - ext.file_off) * u64::from(bb_per_fsb))?;
            maps.push(ExtentMap {
                daddr,
                nbbs: u32::try_from(take * u64::from(bb_per_fsb)).ok()?,
            });
            want += take;
        }
        Some(maps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> BlockMap {
        BlockMap::new(vec![
            BmapExtent {
                file_off: 2,
                daddr: Daddr(800),
                count: 1,
            },
            BmapExtent {
                file_off: 0,
                daddr: Daddr(100),
                count: 2,
            },
        ])
    }

    #[test]
    fn last_and_next_offsets() {
        let map = map();
        assert_eq!(map.last_off(), 3);
        assert_eq!(map.next_off(0), Some(0));
        assert_eq!(map.next_off(1), Some(1));
        assert_eq!(map.next_off(3), None);

        let sparse = BlockMap::new(vec![BmapExtent {
            file_off: 5,
            daddr: Daddr(0),
            count: 2,
        }]);
        assert_eq!(sparse.next_off(0), Some(5));
        assert_eq!(sparse.next_off(6), Some(6));
        assert_eq!(sparse.next_off(7), None);
    }

    #[test]
    fn getn_crosses_extent_boundaries() {
        let map = map();
        let maps = map.getn(1, 2, 8).expect("mapped");
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[0].daddr, Daddr(108));
        assert_eq!(maps[0].nbbs, 8);
        assert_eq!(maps[1].daddr, Daddr(800));
        assert_eq!(maps[1].nbbs, 8);
    }

    #[test]
    fn getn_reports_holes() {
        let map = map();
        assert!(map.getn(2, 2, 8).is_none());
        assert!(map.getn(9, 1, 8).is_none());
    }
}
