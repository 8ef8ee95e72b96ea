//! Two-pass transaction replay.
//!
//! Walks the active log range record by record, reassembles the operations
//! of each transaction (including regions split across records by the
//! continuation flags), and hands every transaction whose COMMIT lies
//! before the head to a dispatcher — once per pass, in commit order.
//! Pass 1 is for buffer (metadata) items so pass 2 replays inode, extent-
//! free, and unlink items against corrected metadata; the split itself is
//! the dispatcher's business.

use crate::Log;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{trace, warn};
use xrec_block::LogBuf;
use xrec_error::{RecoveryError, Result};
use xrec_ondisk::log::{
    CYCLE_DATA_WORDS, ClientId, OP_HEADER_SIZE, OpFlags, OpHeader, RecordHeader, TRANS_HEADER_MAGIC,
    TRANS_HEADER_SIZE, unpack_record,
};
use xrec_types::{LogBlock, Lsn, TransactionId, read_be_u32};

/// Number of chains in the in-flight transaction table.
const RHASH_SIZE: usize = 64;

/// Which replay pass is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayPass {
    /// Buffer (metadata) items.
    Pass1,
    /// Inode, extent-free, and unlink items.
    Pass2,
}

/// One logical item of a transaction: a description region followed by its
/// data regions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecoveredItem {
    /// Declared region count from the description region's low 16 bits;
    /// zero until the first region arrives.
    pub total_regions: u16,
    pub regions: Vec<Vec<u8>>,
}

impl RecoveredItem {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.total_regions != 0 && self.regions.len() == self.total_regions as usize
    }
}

/// An in-flight transaction being reassembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub tid: TransactionId,
    /// LSN of the record that carried the START.
    pub lsn: Lsn,
    /// Raw transaction header copied from the first region.
    pub header: Vec<u8>,
    pub items: Vec<RecoveredItem>,
}

impl Transaction {
    fn new(tid: TransactionId, lsn: Lsn) -> Self {
        Self {
            tid,
            lsn,
            header: Vec::new(),
            items: Vec::new(),
        }
    }
}

/// Receives each committed transaction exactly once per pass, in the order
/// the COMMIT records appear on disk.
pub trait TransactionDispatcher {
    fn deliver(&mut self, pass: ReplayPass, txn: &Transaction) -> Result<()>;
}

/// Replay counters, per pass.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplayStats {
    pub records: u64,
    pub ops: u64,
    pub started: u64,
    pub committed: u64,
    pub unmount_discards: u64,
    /// Ops for a tid whose START lies before the tail; their transaction
    /// already reached disk, so the bodies are skipped.
    pub skipped_ops: u64,
    /// Transactions still open when the head was reached.
    pub incomplete: u64,
}

/// Fixed-size open-chained table of in-flight transactions, keyed by
/// `tid & 63`. Collisions chain deterministically in arrival order.
struct TransTable {
    slots: Vec<VecDeque<Transaction>>,
}

impl TransTable {
    fn new() -> Self {
        Self {
            slots: (0..RHASH_SIZE).map(|_| VecDeque::new()).collect(),
        }
    }

    fn slot_of(tid: TransactionId) -> usize {
        tid.0 as usize & (RHASH_SIZE - 1)
    }

    fn find_mut(&mut self, tid: TransactionId) -> Option<&mut Transaction> {
        self.slots[Self::slot_of(tid)]
            .iter_mut()
            .find(|t| t.tid == tid)
    }

    fn contains(&self, tid: TransactionId) -> bool {
        self.slots[Self::slot_of(tid)].iter().any(|t| t.tid == tid)
    }

    fn insert(&mut self, txn: Transaction) {
        self.slots[Self::slot_of(txn.tid)].push_front(txn);
    }

    fn remove(&mut self, tid: TransactionId) -> Option<Transaction> {
        let slot = &mut self.slots[Self::slot_of(tid)];
        let pos = slot.iter().position(|t| t.tid == tid)?;
        slot.remove(pos)
    }

    fn len(&self) -> usize {
        self.slots.iter().map(VecDeque::len).sum()
    }
}

/// Append a fresh region to the transaction, opening a new item when the
/// previous one is complete. The very first region is the transaction
/// header itself.
fn add_to_trans(txn: &mut Transaction, payload: &[u8]) -> Result<()> {
    if payload.is_empty() {
        return Ok(());
    }
    if txn.items.is_empty() {
        let magic = read_be_u32(payload, 0)?;
        if magic != TRANS_HEADER_MAGIC {
            return Err(RecoveryError::Protocol(format!(
                "transaction {} first region lacks the header magic",
                txn.tid
            )));
        }
        txn.header = payload.to_vec();
        if payload.len() == TRANS_HEADER_SIZE {
            txn.items.push(RecoveredItem::default());
        }
        return Ok(());
    }

    if txn
        .items
        .last()
        .is_some_and(|item| item.total_regions != 0 && item.is_complete())
    {
        txn.items.push(RecoveredItem::default());
    }
    let Some(item) = txn.items.last_mut() else {
        return Err(RecoveryError::Protocol(format!(
            "transaction {} has no open item to add a region to",
            txn.tid
        )));
    };
    if item.total_regions == 0 {
        // Description region: type in the high 16 bits, region count in the
        // low 16.
        let first_word = read_be_u32(payload, 0)?;
        let total = (first_word & 0xFFFF) as u16;
        if total == 0 {
            return Err(RecoveryError::Protocol(format!(
                "transaction {} item declares zero regions",
                txn.tid
            )));
        }
        item.total_regions = total;
    }
    if item.regions.len() >= item.total_regions as usize {
        return Err(RecoveryError::Protocol(format!(
            "transaction {} item has more regions than declared",
            txn.tid
        )));
    }
    item.regions.push(payload.to_vec());
    Ok(())
}

/// Append continuation bytes to the most recent region (WAS_CONT): the two
/// halves concatenate to the original region byte-for-byte.
fn add_to_cont_trans(txn: &mut Transaction, payload: &[u8]) -> Result<()> {
    if txn.items.is_empty() {
        // Still finishing the split transaction header.
        txn.header.extend_from_slice(payload);
        txn.items.push(RecoveredItem::default());
        return Ok(());
    }
    let Some(item) = txn.items.last_mut() else {
        return Err(RecoveryError::Protocol(format!(
            "transaction {} continuation with no open item",
            txn.tid
        )));
    };
    let Some(region) = item.regions.last_mut() else {
        return Err(RecoveryError::Protocol(format!(
            "transaction {} continuation with no region to continue",
            txn.tid
        )));
    };
    region.extend_from_slice(payload);
    Ok(())
}

impl Log<'_> {
    /// One replay pass over `[tail, head)` modulo the log length.
    pub fn replay(
        &self,
        tail: LogBlock,
        head: LogBlock,
        pass: ReplayPass,
        dispatcher: &mut dyn TransactionDispatcher,
    ) -> Result<ReplayStats> {
        let mut table = TransTable::new();
        let mut stats = ReplayStats::default();
        let mut hbuf = LogBuf::zeroed(1);
        let mut dbuf = LogBuf::zeroed(CYCLE_DATA_WORDS as u32);

        if tail == head {
            return Ok(stats);
        }

        if tail < head {
            let mut blk = tail;
            while blk < head {
                let header = self.read_record_header(blk, &mut hbuf)?;
                let bblks = header.data_bbs();
                if bblks > 0 {
                    self.read_bbs(LogBlock(blk.0 + 1), bblks, &mut dbuf)?;
                    self.replay_record(&header, &mut dbuf, pass, &mut table, dispatcher, &mut stats)?;
                }
                stats.records += 1;
                blk = LogBlock(blk.0 + bblks + 1);
            }
        } else {
            // Active range wraps the physical end of the log.
            let mut blk = tail;
            while blk.0 < self.bb_len() {
                let header = self.read_record_header(blk, &mut hbuf)?;
                let bblks = header.data_bbs();
                let data_start = blk.0 + 1;
                if bblks > 0 {
                    if data_start + bblks <= self.bb_len() {
                        self.read_bbs(LogBlock(data_start), bblks, &mut dbuf)?;
                    } else {
                        // Record body is split across the physical end.
                        let split_bblks = self.bb_len().saturating_sub(data_start);
                        if split_bblks > 0 {
                            self.read_bbs(LogBlock(data_start), split_bblks, &mut dbuf)?;
                        }
                        let mut rest = LogBuf::zeroed(bblks - split_bblks);
                        self.read_bbs(LogBlock(0), bblks - split_bblks, &mut rest)?;
                        let at = split_bblks as usize * xrec_types::BBSIZE;
                        let len = rest.as_slice().len();
                        dbuf.as_mut_slice()[at..at + len].copy_from_slice(rest.as_slice());
                    }
                    self.replay_record(&header, &mut dbuf, pass, &mut table, dispatcher, &mut stats)?;
                }
                stats.records += 1;
                blk = LogBlock(data_start + bblks);
            }

            let mut blk = LogBlock(blk.0 - self.bb_len());
            while blk < head {
                let header = self.read_record_header(blk, &mut hbuf)?;
                let bblks = header.data_bbs();
                if bblks > 0 {
                    self.read_bbs(LogBlock(blk.0 + 1), bblks, &mut dbuf)?;
                    self.replay_record(&header, &mut dbuf, pass, &mut table, dispatcher, &mut stats)?;
                }
                stats.records += 1;
                blk = LogBlock(blk.0 + bblks + 1);
            }
        }

        stats.incomplete = table.len() as u64;
        if stats.incomplete > 0 {
            warn!(
                target: "xrec::log::replay",
                incomplete = stats.incomplete,
                "transactions without a commit before the head were dropped"
            );
        }
        Ok(stats)
    }

    /// Both passes in order. Each pass rebuilds its own in-flight table.
    pub fn run_recovery(
        &self,
        tail: LogBlock,
        head: LogBlock,
        dispatcher: &mut dyn TransactionDispatcher,
    ) -> Result<(ReplayStats, ReplayStats)> {
        let pass1 = self.replay(tail, head, ReplayPass::Pass1, dispatcher)?;
        let pass2 = self.replay(tail, head, ReplayPass::Pass2, dispatcher)?;
        Ok((pass1, pass2))
    }

    fn read_record_header(&self, blk: LogBlock, hbuf: &mut LogBuf) -> Result<RecordHeader> {
        self.read_bb(blk, hbuf)?;
        let header = RecordHeader::parse(hbuf.bb(0)).map_err(|err| RecoveryError::Corruption {
            block: u64::from(blk.0),
            detail: format!("bad record header in active range: {err}"),
        })?;
        if header.fs_uuid != self.fs_uuid {
            return Err(RecoveryError::Corruption {
                block: u64::from(blk.0),
                detail: "log record UUID does not match mount UUID".to_owned(),
            });
        }
        Ok(header)
    }

    fn replay_record(
        &self,
        header: &RecordHeader,
        dbuf: &mut LogBuf,
        pass: ReplayPass,
        table: &mut TransTable,
        dispatcher: &mut dyn TransactionDispatcher,
        stats: &mut ReplayStats,
    ) -> Result<()> {
        unpack_record(header, dbuf.as_mut_slice())?;
        let data = &dbuf.as_slice()[..header.len as usize];

        let mut off = 0_usize;
        while off < data.len() {
            let op = OpHeader::parse(data, off)?;
            off += OP_HEADER_SIZE;
            if ClientId::from_raw(op.clientid).is_none() {
                return Err(RecoveryError::Protocol(format!(
                    "bad clientid {:#04x} in op for transaction {}",
                    op.clientid, op.tid
                )));
            }
            if !op.flags.is_known() {
                return Err(RecoveryError::Protocol(format!(
                    "unknown op flags {:#04x} for transaction {}",
                    op.flags.0, op.tid
                )));
            }
            let payload_end = off + op.len as usize;
            if payload_end > data.len() {
                return Err(RecoveryError::Protocol(format!(
                    "op payload for transaction {} overruns its record",
                    op.tid
                )));
            }
            let payload = &data[off..payload_end];
            stats.ops += 1;

            if !table.contains(op.tid) {
                if op.flags.has(OpFlags::START) {
                    table.insert(Transaction::new(op.tid, header.lsn));
                    stats.started += 1;
                } else {
                    // Body of a transaction that started before the tail;
                    // already on disk, nothing to do.
                    stats.skipped_ops += 1;
                }
            } else {
                match op.flags.dispatch_state() {
                    OpFlags::COMMIT => {
                        if let Some(txn) = table.remove(op.tid) {
                            trace!(
                                target: "xrec::log::replay",
                                tid = %txn.tid,
                                items = txn.items.len(),
                                ?pass,
                                "delivering committed transaction"
                            );
                            dispatcher.deliver(pass, &txn)?;
                            stats.committed += 1;
                        }
                    }
                    OpFlags::UNMOUNT => {
                        table.remove(op.tid);
                        stats.unmount_discards += 1;
                    }
                    OpFlags::WAS_CONT => {
                        if let Some(txn) = table.find_mut(op.tid) {
                            add_to_cont_trans(txn, payload)?;
                        }
                    }
                    OpFlags::START => {
                        return Err(RecoveryError::Protocol(format!(
                            "start for already-active transaction {}",
                            op.tid
                        )));
                    }
                    0 | OpFlags::CONTINUE => {
                        if let Some(txn) = table.find_mut(op.tid) {
                            add_to_trans(txn, payload)?;
                        }
                    }
                    _ => {
                        return Err(RecoveryError::Protocol(format!(
                            "bad op flag combination {:#04x} for transaction {}",
                            op.flags.0, op.tid
                        )));
                    }
                }
            }
            off = payload_end;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xrec_types::Cycle;

    fn txn_with_lsn() -> Transaction {
        Transaction::new(TransactionId(7), Lsn::new(Cycle(1), LogBlock(0)))
    }

    fn header_region() -> Vec<u8> {
        let mut region = vec![0_u8; TRANS_HEADER_SIZE];
        region[..4].copy_from_slice(&TRANS_HEADER_MAGIC.to_be_bytes());
        region
    }

    fn desc_region(total: u16, fill: u8) -> Vec<u8> {
        let mut region = vec![fill; 16];
        region[..4].copy_from_slice(&(0x1234_0000_u32 | u32::from(total)).to_be_bytes());
        region
    }

    #[test]
    fn first_region_must_carry_header_magic() {
        let mut txn = txn_with_lsn();
        let err = add_to_trans(&mut txn, &[0_u8; 16]).expect_err("bad magic");
        assert!(matches!(err, RecoveryError::Protocol(_)));

        add_to_trans(&mut txn, &header_region()).expect("header accepted");
        assert_eq!(txn.items.len(), 1);
        assert!(txn.items[0].regions.is_empty());
    }

    #[test]
    fn items_open_and_close_by_declared_region_count() {
        let mut txn = txn_with_lsn();
        add_to_trans(&mut txn, &header_region()).expect("header");

        add_to_trans(&mut txn, &desc_region(2, 0xAA)).expect("item 1 desc");
        add_to_trans(&mut txn, &[0xBB; 8]).expect("item 1 data");
        assert!(txn.items[0].is_complete());

        add_to_trans(&mut txn, &desc_region(1, 0xCC)).expect("item 2 desc");
        assert_eq!(txn.items.len(), 2);
        assert!(txn.items[1].is_complete());
    }

    #[test]
    fn continuation_appends_to_last_region() {
        let mut txn = txn_with_lsn();
        add_to_trans(&mut txn, &header_region()).expect("header");
        add_to_trans(&mut txn, &desc_region(2, 0)).expect("desc");
        add_to_trans(&mut txn, &[1, 2, 3]).expect("data first half");
        add_to_cont_trans(&mut txn, &[4, 5]).expect("data second half");

        let item = &txn.items[0];
        assert_eq!(item.regions[1], vec![1, 2, 3, 4, 5]);
        assert!(item.is_complete());
    }

    #[test]
    fn continuation_finishes_split_transaction_header() {
        let mut txn = txn_with_lsn();
        let header = header_region();
        add_to_trans(&mut txn, &header[..8]).expect("header front half");
        assert!(txn.items.is_empty());
        add_to_cont_trans(&mut txn, &header[8..]).expect("header back half");
        assert_eq!(txn.header, header);
        assert_eq!(txn.items.len(), 1);
    }

    #[test]
    fn zero_declared_regions_is_a_protocol_error() {
        let mut txn = txn_with_lsn();
        add_to_trans(&mut txn, &header_region()).expect("header");
        let err = add_to_trans(&mut txn, &desc_region(0, 0)).expect_err("zero regions");
        assert!(matches!(err, RecoveryError::Protocol(_)));
    }

    #[test]
    fn table_chains_colliding_tids() {
        let mut table = TransTable::new();
        let lsn = Lsn::new(Cycle(1), LogBlock(0));
        // 5 and 69 collide in a 64-slot table.
        table.insert(Transaction::new(TransactionId(5), lsn));
        table.insert(Transaction::new(TransactionId(69), lsn));
        assert_eq!(table.len(), 2);
        assert!(table.contains(TransactionId(5)));
        assert!(table.contains(TransactionId(69)));
        assert_eq!(
            table.remove(TransactionId(5)).expect("present").tid,
            TransactionId(5)
        );
        assert!(table.contains(TransactionId(69)));
        assert!(!table.contains(TransactionId(5)));
    }
}
