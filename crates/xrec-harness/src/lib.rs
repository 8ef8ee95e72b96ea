#![forbid(unsafe_code)]
//! Synthetic log images and test dispatchers for end-to-end checks.
//!
//! The builder writes records the way the real log writer does (packed
//! first words, cycle stamps, wrap handling), so discovery and replay are
//! exercised against byte-faithful images.

use parking_lot::Mutex;
use xrec_block::{BlockIo, LogBuf, MemDevice};
use xrec_error::Result;
use xrec_log::{ReplayPass, Transaction, TransactionDispatcher};
use xrec_ondisk::log::{
    CYCLE_DATA_WORDS, ClientId, OP_HEADER_SIZE, OpFlags, OpHeader, RecordHeader,
    TRANS_HEADER_MAGIC, TRANS_HEADER_SIZE, pack_record,
};
use xrec_types::{
    BBSIZE, Cycle, Daddr, LogBlock, Lsn, TransactionId, read_be_u64, write_be_u32,
};

/// One log operation to place in a record.
#[derive(Debug, Clone)]
pub struct Op {
    pub tid: u32,
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl Op {
    #[must_use]
    pub fn start(tid: u32) -> Self {
        Self {
            tid,
            flags: OpFlags::START,
            payload: Vec::new(),
        }
    }

    #[must_use]
    pub fn commit(tid: u32) -> Self {
        Self {
            tid,
            flags: OpFlags::COMMIT,
            payload: Vec::new(),
        }
    }

    #[must_use]
    pub fn unmount(tid: u32) -> Self {
        Self {
            tid,
            flags: OpFlags::UNMOUNT,
            payload: Vec::new(),
        }
    }

    /// The transaction-header region that must follow the start op.
    #[must_use]
    pub fn trans_header(tid: u32) -> Self {
        let mut payload = vec![0_u8; TRANS_HEADER_SIZE];
        payload[..4].copy_from_slice(&TRANS_HEADER_MAGIC.to_be_bytes());
        Self {
            tid,
            flags: 0,
            payload,
        }
    }

    /// A plain add-region op.
    #[must_use]
    pub fn region(tid: u32, payload: Vec<u8>) -> Self {
        Self {
            tid,
            flags: 0,
            payload,
        }
    }
}

/// Item type tags understood by [`ApplyDispatcher`].
pub const ITEM_TYPE_BUF: u16 = 1;
pub const ITEM_TYPE_INODE: u16 = 2;

/// Description region of a test item: `(type << 16) | total_regions`, pad,
/// then the target device address.
#[must_use]
pub fn item_desc(item_type: u16, total_regions: u16, daddr: u64) -> Vec<u8> {
    let mut desc = vec![0_u8; 16];
    desc[..4].copy_from_slice(
        &((u32::from(item_type) << 16) | u32::from(total_regions)).to_be_bytes(),
    );
    desc[8..16].copy_from_slice(&daddr.to_be_bytes());
    desc
}

/// Grows a log image record by record, wrapping like the real writer.
pub struct LogImageBuilder {
    dev: MemDevice,
    log_len: u32,
    uuid: [u8; 16],
    head: u32,
    cycle: u32,
    tail_lsn: Lsn,
}

impl LogImageBuilder {
    #[must_use]
    pub fn new(log_len: u32, uuid: [u8; 16]) -> Self {
        Self {
            dev: MemDevice::new(u64::from(log_len)),
            log_len,
            uuid,
            head: 0,
            cycle: 1,
            tail_lsn: Lsn::new(Cycle(1), LogBlock(0)),
        }
    }

    #[must_use]
    pub fn device(&self) -> &MemDevice {
        &self.dev
    }

    #[must_use]
    pub fn into_device(self) -> MemDevice {
        self.dev
    }

    #[must_use]
    pub fn head(&self) -> LogBlock {
        LogBlock(self.head)
    }

    #[must_use]
    pub fn cycle(&self) -> Cycle {
        Cycle(self.cycle)
    }

    pub fn set_tail_lsn(&mut self, lsn: Lsn) {
        self.tail_lsn = lsn;
    }

    /// Stamp a raw cycle number into one block (no record content).
    pub fn stamp(&mut self, blk: u32, cycle: u32) -> Result<()> {
        let mut buf = LogBuf::zeroed(1);
        write_be_u32(buf.as_mut_slice(), 0, cycle)?;
        self.dev.write_bbs(Daddr(u64::from(blk)), 1, &buf)
    }

    /// Append one record at the current head, wrapping and bumping the
    /// cycle as the writer would. Returns the record's LSN.
    pub fn append_record(&mut self, ops: &[Op]) -> Result<Lsn> {
        let at = self.head;
        let lsn = self.write_record_at(at, self.cycle, ops)?;
        let bblks = 1 + bytes_to_data_bbs(ops);
        let next = at + bblks;
        if next >= self.log_len {
            self.cycle += 1;
        }
        self.head = next % self.log_len;
        Ok(lsn)
    }

    /// Write a record at an explicit block and cycle, without moving the
    /// builder's own head.
    pub fn write_record_at(&mut self, at: u32, cycle: u32, ops: &[Op]) -> Result<Lsn> {
        let mut data = Vec::new();
        for op in ops {
            let mut op_bytes = vec![0_u8; OP_HEADER_SIZE];
            OpHeader {
                tid: TransactionId(op.tid),
                len: op.payload.len() as u32,
                clientid: ClientId::TRANSACTION,
                flags: OpFlags(op.flags),
            }
            .encode_into(&mut op_bytes, 0)?;
            data.extend_from_slice(&op_bytes);
            data.extend_from_slice(&op.payload);
        }
        let h_len = data.len() as u32;
        let bblks = h_len.div_ceil(BBSIZE as u32);
        data.resize(bblks as usize * BBSIZE, 0);

        let lsn = Lsn::new(Cycle(cycle), LogBlock(at));
        let mut header = RecordHeader {
            cycle: Cycle(cycle),
            version: 2,
            len: h_len,
            lsn,
            tail_lsn: self.tail_lsn,
            chksum: 0,
            prev_block: 0,
            num_logops: ops.len() as u32,
            fs_uuid: self.uuid,
            cycle_data: [0; CYCLE_DATA_WORDS],
        };
        pack_record(&mut header, &mut data)?;

        let mut hbuf = LogBuf::zeroed(1);
        header.encode_into(hbuf.as_mut_slice())?;
        self.dev.write_bbs(Daddr(u64::from(at)), 1, &hbuf)?;

        for (i, bb) in data.chunks(BBSIZE).enumerate() {
            let pos = at + 1 + i as u32;
            let blk = pos % self.log_len;
            let mut dbuf = LogBuf::zeroed(1);
            dbuf.as_mut_slice().copy_from_slice(bb);
            // The wrapped part of a split write continues on the next
            // cycle; its blocks are stamped accordingly.
            if pos >= self.log_len {
                write_be_u32(dbuf.as_mut_slice(), 0, cycle + 1)?;
            }
            self.dev.write_bbs(Daddr(u64::from(blk)), 1, &dbuf)?;
        }
        Ok(lsn)
    }

    /// Append a clean unmount record (one op, one data block).
    pub fn append_unmount(&mut self, tid: u32) -> Result<Lsn> {
        let at = self.head;
        self.set_tail_lsn(Lsn::new(Cycle(self.cycle), LogBlock(at)));
        self.append_record(&[Op::unmount(tid)])
    }
}

fn bytes_to_data_bbs(ops: &[Op]) -> u32 {
    let total: usize = ops.iter().map(|op| OP_HEADER_SIZE + op.payload.len()).sum();
    (total as u32).div_ceil(BBSIZE as u32)
}

/// Dispatcher that applies test items to a device: buffer items on pass 1,
/// inode items on pass 2, recording everything it saw.
pub struct ApplyDispatcher<'a> {
    dev: &'a dyn BlockIo,
    pub seen: Mutex<Vec<(ReplayPass, u16, u64)>>,
}

impl<'a> ApplyDispatcher<'a> {
    #[must_use]
    pub fn new(dev: &'a dyn BlockIo) -> Self {
        Self {
            dev,
            seen: Mutex::new(Vec::new()),
        }
    }
}

impl TransactionDispatcher for ApplyDispatcher<'_> {
    fn deliver(&mut self, pass: ReplayPass, txn: &Transaction) -> Result<()> {
        for item in &txn.items {
            let Some(desc) = item.regions.first() else {
                continue;
            };
            if desc.len() < 16 {
                continue;
            }
            let word = xrec_types::read_be_u32(desc, 0)?;
            let item_type = (word >> 16) as u16;
            let daddr = read_be_u64(desc, 8)?;
            self.seen.lock().push((pass, item_type, daddr));

            let apply = matches!(
                (pass, item_type),
                (ReplayPass::Pass1, ITEM_TYPE_BUF) | (ReplayPass::Pass2, ITEM_TYPE_INODE)
            );
            if !apply {
                continue;
            }
            for payload in &item.regions[1..] {
                let mut buf = LogBuf::zeroed(1);
                let len = payload.len().min(BBSIZE);
                buf.as_mut_slice()[..len].copy_from_slice(&payload[..len]);
                self.dev.write_bbs(Daddr(daddr), 1, &buf)?;
            }
        }
        Ok(())
    }
}
