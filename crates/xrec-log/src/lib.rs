#![forbid(unsafe_code)]
//! Circular-log recovery: head/tail discovery and two-pass replay.
//!
//! The log is a circular array of basic blocks whose first words carry a
//! monotonically increasing cycle number. [`Log::find_head`] locates the
//! point the next write would have gone, [`Log::find_tail`] the oldest
//! record still needed, and [`Log::run_recovery`] walks the active range
//! twice, reassembling transactions and handing committed ones to a
//! dispatcher.

pub mod replay;
pub mod scan;

pub use replay::{
    RecoveredItem, ReplayPass, ReplayStats, Transaction, TransactionDispatcher,
};
pub use scan::{TailReport, ZeroedCheck};

use xrec_block::{BlockIo, BufAllocator, LogBuf};
use xrec_error::{RecoveryError, Result};
use xrec_types::{Daddr, LogBlock};

/// Handle to one physical log on a device.
pub struct Log<'a> {
    dev: &'a dyn BlockIo,
    /// Device address of log block 0.
    start: Daddr,
    /// Log length in basic blocks.
    bb_len: u32,
    /// Mount UUID every record header must carry.
    fs_uuid: [u8; 16],
    alloc: BufAllocator,
}

impl<'a> Log<'a> {
    pub fn new(dev: &'a dyn BlockIo, start: Daddr, bb_len: u32, fs_uuid: [u8; 16]) -> Result<Self> {
        if bb_len < 2 {
            return Err(RecoveryError::Format(format!(
                "log too short: {bb_len} basic blocks"
            )));
        }
        let end = start
            .checked_add(u64::from(bb_len))
            .ok_or_else(|| RecoveryError::Format("log range overflows u64".to_owned()))?;
        if end.0 > dev.bb_count() {
            return Err(RecoveryError::Format(format!(
                "log [{start}, {end}) exceeds device of {} BBs",
                dev.bb_count()
            )));
        }
        Ok(Self {
            dev,
            start,
            bb_len,
            fs_uuid,
            alloc: BufAllocator::new(),
        })
    }

    /// Replace the buffer allocator (tests inject capped allocators to
    /// exercise the degradation path).
    pub fn with_allocator(mut self, alloc: BufAllocator) -> Self {
        self.alloc = alloc;
        self
    }

    #[must_use]
    pub fn bb_len(&self) -> u32 {
        self.bb_len
    }

    fn daddr_of(&self, blk: LogBlock) -> Result<Daddr> {
        if blk.0 > self.bb_len {
            return Err(RecoveryError::Format(format!(
                "log block {blk} beyond log of {} BBs",
                self.bb_len
            )));
        }
        self.start
            .checked_add(u64::from(blk.0))
            .ok_or_else(|| RecoveryError::Format("log block address overflows u64".to_owned()))
    }

    pub(crate) fn read_bbs(&self, blk: LogBlock, nbbs: u32, buf: &mut LogBuf) -> Result<()> {
        self.dev.read_bbs(self.daddr_of(blk)?, nbbs, buf)
    }

    pub(crate) fn read_bb(&self, blk: LogBlock, buf: &mut LogBuf) -> Result<()> {
        self.read_bbs(blk, 1, buf)
    }
}
