//! Head, tail, and zeroed-log discovery.
//!
//! The head is where the next log write would have gone; torn writes at the
//! end of the log are eliminated by scanning a window of the maximum
//! possible outstanding write size behind every candidate. The tail comes
//! from the tail LSN of the last record header before the head.

use crate::Log;
use tracing::warn;
use xrec_block::LogBuf;
use xrec_error::{RecoveryError, Result};
use xrec_ondisk::log::{
    MAX_ICLOGS, MAX_RECORD_BSHIFT, MAX_RECORD_BSIZE, OpFlags, OpHeader, RecordHeader, bb_cycle,
    is_record_header,
};
use xrec_types::{Cycle, LogBlock, Lsn, bytes_to_bbs};

/// Classification of a log that may never have been fully written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroedCheck {
    /// Every block has been written at least once.
    Written,
    /// The log is zeroed from `first_blk` on (`first_blk == 0`: never
    /// written at all). The head belongs at `first_blk`.
    Zeroed { first_blk: LogBlock },
}

/// Everything `find_tail` learns about the end state of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailReport {
    pub head: LogBlock,
    pub tail: LogBlock,
    /// Cycle the next write would use.
    pub head_cycle: Cycle,
    /// LSN of the last record synced to disk.
    pub last_sync_lsn: Lsn,
    /// Tail LSN before any unmount-record adjustment; a stale-block clear
    /// pass must not erase the unmount record itself.
    pub pre_unmount_tail_lsn: Lsn,
    /// True when a clean unmount record sits directly below the head.
    pub clean_unmount: bool,
}

/// Window (in BBs) that can hold every possibly-outstanding record write.
fn max_outstanding_bbs() -> u32 {
    bytes_to_bbs(MAX_ICLOGS << MAX_RECORD_BSHIFT)
}

impl Log<'_> {
    fn cycle_at(&self, blk: LogBlock, buf: &mut LogBuf) -> Result<Cycle> {
        self.read_bb(blk, buf)?;
        Ok(bb_cycle(buf.bb(0))?)
    }

    /// Binary-search the lowest block in `(first, last]` whose cycle is
    /// `cycle`. The region must be cycle-sorted: `cycle` at `last`, an older
    /// cycle at `first`.
    pub fn find_cycle_start(
        &self,
        first: LogBlock,
        last: LogBlock,
        cycle: Cycle,
    ) -> Result<LogBlock> {
        let mut buf = LogBuf::zeroed(1);
        let mut first = first;
        let mut last = last;
        let mut mid = first.avg(last);
        while mid != first && mid != last {
            if self.cycle_at(mid, &mut buf)? == cycle {
                last = mid;
            } else {
                first = mid;
            }
            mid = first.avg(last);
        }
        debug_assert!(
            (mid == first && mid.0 + 1 == last.0) || (mid == last && first.0 + 1 == mid.0),
            "binary search must end on adjacent blocks"
        );
        Ok(last)
    }

    /// Scan `nbbs` blocks forward from `start` for the first block whose
    /// cycle equals `stop_cycle`. `None` means the range is clean.
    pub fn find_verify_cycle(
        &self,
        start: LogBlock,
        nbbs: u32,
        stop_cycle: Cycle,
    ) -> Result<Option<LogBlock>> {
        let mut buf = self.alloc.alloc_degrading(nbbs)?;
        let bufblks = buf.nbbs();

        let mut i = start.0;
        let end = start.0 + nbbs;
        while i < end {
            let bcount = bufblks.min(end - i);
            self.read_bbs(LogBlock(i), bcount, &mut buf)?;
            for j in 0..bcount {
                if bb_cycle(buf.bb(j))? == stop_cycle {
                    return Ok(Some(LogBlock(i + j)));
                }
            }
            i += bcount;
        }
        Ok(None)
    }

    /// Potentially back `last` up over a partial record write.
    ///
    /// Scans backwards from `last - 1` toward `start` for a record header.
    /// On a hit the header's UUID must match the mount; `last` moves back to
    /// the header only if the distance shows it pointed mid-record
    /// (`extra_bblks` accounts for blocks verified by a previous, wrapped
    /// call). Returns `false` when the scan fell off the start of the
    /// physical log, which the caller handles by retrying at the log's end.
    pub fn find_verify_log_record(
        &self,
        start: LogBlock,
        last: &mut LogBlock,
        extra_bblks: u32,
    ) -> Result<bool> {
        let mut buf = LogBuf::zeroed(1);
        for i in (0..last.0).rev() {
            if i < start.0 {
                return Err(RecoveryError::Corruption {
                    block: u64::from(i),
                    detail: "log inconsistent: no record header before candidate head".to_owned(),
                });
            }
            self.read_bb(LogBlock(i), &mut buf)?;
            if !is_record_header(buf.bb(0)) {
                continue;
            }
            let header = RecordHeader::parse(buf.bb(0))?;
            self.check_uuid(&header, LogBlock(i))?;
            // A header this close can legitimately start a complete record
            // that ends exactly at `last`; only a mid-record hit moves it.
            if last.0 - i + extra_bblks != header.data_bbs() + 1 {
                *last = LogBlock(i);
            }
            return Ok(true);
        }
        Ok(false)
    }

    fn check_uuid(&self, header: &RecordHeader, blk: LogBlock) -> Result<()> {
        if header.fs_uuid != self.fs_uuid {
            return Err(RecoveryError::Corruption {
                block: u64::from(blk.0),
                detail: "log record UUID does not match mount UUID".to_owned(),
            });
        }
        Ok(())
    }

    /// Classify a possibly never-filled log.
    ///
    /// A fresh log is all zero cycles; a log abandoned during its first
    /// cycle is cycle 1 up to some block and zero after it. Anything else
    /// with a zero last block is not a log.
    pub fn find_zeroed(&self) -> Result<ZeroedCheck> {
        let mut buf = LogBuf::zeroed(1);
        let first_cycle = self.cycle_at(LogBlock(0), &mut buf)?;
        if first_cycle == Cycle::ZERO {
            return Ok(ZeroedCheck::Zeroed {
                first_blk: LogBlock(0),
            });
        }

        let last_cycle = self.cycle_at(LogBlock(self.bb_len - 1), &mut buf)?;
        if last_cycle != Cycle::ZERO {
            return Ok(ZeroedCheck::Written);
        }
        if first_cycle != Cycle(1) {
            return Err(RecoveryError::Corruption {
                block: 0,
                detail: format!(
                    "log inconsistent: last block zeroed but first cycle is {first_cycle}, not 1"
                ),
            });
        }

        // Partially zeroed. Find the first zero-cycle block, then distrust
        // the neighborhood: scan a maximum-write window before it for stray
        // zero cycles and back over a possible partial record.
        let mut last_blk =
            self.find_cycle_start(LogBlock(0), LogBlock(self.bb_len - 1), Cycle::ZERO)?;

        let num_scan = max_outstanding_bbs().min(last_blk.0);
        let start_blk = LogBlock(last_blk.0 - num_scan);
        if let Some(new_blk) = self.find_verify_cycle(start_blk, num_scan, Cycle::ZERO)? {
            last_blk = new_blk;
        }
        // The end of the log is known zero, so a missing earlier header
        // leaves the candidate where it is.
        self.find_verify_log_record(start_blk, &mut last_blk, 0)?;

        Ok(ZeroedCheck::Zeroed {
            first_blk: last_blk,
        })
    }

    /// Find the head: the block where the next record write would go.
    pub fn find_head(&self) -> Result<LogBlock> {
        match self.find_zeroed()? {
            ZeroedCheck::Zeroed { first_blk } => {
                if first_blk.0 == 0 {
                    warn!(target: "xrec::log::scan", "totally zeroed log");
                }
                return Ok(first_blk);
            }
            ZeroedCheck::Written => {}
        }

        let log_bbnum = self.bb_len;
        let mut buf = LogBuf::zeroed(1);
        let first_half_cycle = self.cycle_at(LogBlock(0), &mut buf)?;
        let last_half_cycle = self.cycle_at(LogBlock(log_bbnum - 1), &mut buf)?;
        debug_assert_ne!(last_half_cycle, Cycle::ZERO);

        let stop_on_cycle;
        let mut head_blk;
        if first_half_cycle == last_half_cycle {
            // The whole log carries cycle x. The head is wherever a hole of
            // cycle x-1 still starts near the end; `log_bbnum` stands in for
            // block 0 so the window math below stays correct, and is
            // normalized at the very end.
            head_blk = LogBlock(log_bbnum);
            stop_on_cycle = last_half_cycle.prev();
        } else {
            // x+1 ... | x ... : the head is the first block of cycle x.
            stop_on_cycle = last_half_cycle;
            head_blk = self.find_cycle_start(
                LogBlock(0),
                LogBlock(log_bbnum - 1),
                last_half_cycle,
            )?;
        }

        // Validate against every torn-write pattern a crashed writer can
        // leave: scan the maximum outstanding-write window behind the
        // candidate (wrapping if it crosses block 0) for blocks that break
        // the cycle sequence.
        let num_scan = max_outstanding_bbs().min(log_bbnum);
        if head_blk.0 >= num_scan {
            let start_blk = LogBlock(head_blk.0 - num_scan);
            if let Some(new_blk) = self.find_verify_cycle(start_blk, num_scan, stop_on_cycle)? {
                head_blk = new_blk;
            }
            self.align_head_to_record(&mut head_blk)?;
        } else {
            // Window wraps: check the tail end of the log for cycle x-1
            // holes first (x+1..|x..|x-1|x and the 256k-log x+1..|x..|x+1|x
            // pattern), then the start for cycle x.
            let start_blk = LogBlock(log_bbnum - num_scan + head_blk.0);
            if let Some(new_blk) = self.find_verify_cycle(
                start_blk,
                num_scan - head_blk.0,
                stop_on_cycle.prev(),
            )? {
                head_blk = new_blk;
            } else {
                if let Some(new_blk) =
                    self.find_verify_cycle(LogBlock(0), head_blk.0, stop_on_cycle)?
                {
                    head_blk = new_blk;
                }
            }
            self.align_head_to_record(&mut head_blk)?;
        }

        if head_blk.0 == log_bbnum {
            Ok(LogBlock(0))
        } else {
            Ok(head_blk)
        }
    }

    /// Make sure the head does not point into the middle of a record.
    fn align_head_to_record(&self, head_blk: &mut LogBlock) -> Result<()> {
        let num_scan = bytes_to_bbs(MAX_RECORD_BSIZE).min(self.bb_len);
        if head_blk.0 >= num_scan {
            let start_blk = LogBlock(head_blk.0 - num_scan);
            if !self.find_verify_log_record(start_blk, head_blk, 0)? {
                return Err(RecoveryError::Corruption {
                    block: u64::from(head_blk.0),
                    detail: "no record header within a maximum record of the head".to_owned(),
                });
            }
        } else {
            let found = self.find_verify_log_record(LogBlock(0), head_blk, 0)?;
            if !found {
                // Fell off the start; the record must wrap the physical end.
                let start_blk = LogBlock(self.bb_len - num_scan + head_blk.0);
                let mut new_blk = LogBlock(self.bb_len);
                if !self.find_verify_log_record(start_blk, &mut new_blk, head_blk.0)? {
                    return Err(RecoveryError::Corruption {
                        block: u64::from(head_blk.0),
                        detail: "no record header within a maximum record of the head".to_owned(),
                    });
                }
                if new_blk.0 != self.bb_len {
                    *head_blk = new_blk;
                }
            }
        }
        Ok(())
    }

    /// Find the tail: the first block still needed by recovery, taken from
    /// the tail LSN of the last record header written before the head.
    ///
    /// The backward scan retries once from the physical end of the log when
    /// nothing is found below the head (the last record may have wrapped);
    /// a second miss is fatal.
    pub fn find_tail(&self, head_blk: LogBlock) -> Result<TailReport> {
        let mut buf = LogBuf::zeroed(1);

        if head_blk.0 == 0 {
            self.read_bb(LogBlock(0), &mut buf)?;
            if bb_cycle(buf.bb(0))? == Cycle::ZERO {
                // Never-written log: everything starts at zero.
                return Ok(TailReport {
                    head: head_blk,
                    tail: LogBlock(0),
                    head_cycle: Cycle(1),
                    last_sync_lsn: Lsn::new(Cycle(1), LogBlock(0)),
                    pre_unmount_tail_lsn: Lsn::new(Cycle(1), LogBlock(0)),
                    clean_unmount: false,
                });
            }
        }

        let mut found_at = None;
        let mut wrapped = false;
        for i in (0..head_blk.0).rev() {
            self.read_bb(LogBlock(i), &mut buf)?;
            if is_record_header(buf.bb(0)) {
                found_at = Some(LogBlock(i));
                break;
            }
        }
        if found_at.is_none() {
            for i in (head_blk.0..self.bb_len).rev() {
                self.read_bb(LogBlock(i), &mut buf)?;
                if is_record_header(buf.bb(0)) {
                    found_at = Some(LogBlock(i));
                    wrapped = true;
                    break;
                }
            }
        }
        let Some(found_at) = found_at else {
            return Err(RecoveryError::Corruption {
                block: u64::from(head_blk.0),
                detail: "could not find a sync record before the head".to_owned(),
            });
        };

        let header = RecordHeader::parse(buf.bb(0))?;
        self.check_uuid(&header, found_at)?;

        let mut tail_blk = header.tail_lsn.block();
        // A head at block 0 means the next write starts a fresh cycle.
        let head_cycle = if wrapped {
            Cycle(header.cycle.0 + 1)
        } else {
            header.cycle
        };
        let pre_unmount_tail_lsn = header.tail_lsn;
        let mut last_sync_lsn = header.lsn;
        let mut clean_unmount = false;

        // Clean-unmount detection: the unmount record is one header plus one
        // data BB directly below the head. Nothing on disk guarantees that
        // shape, so only trust it when the header says exactly one op.
        let after_umount_blk = LogBlock((found_at.0 + 2) % self.bb_len);
        if head_blk == after_umount_blk && header.num_logops == 1 {
            let umount_data_blk = LogBlock((found_at.0 + 1) % self.bb_len);
            self.read_bb(umount_data_blk, &mut buf)?;
            let op = OpHeader::parse(buf.bb(0), 0)?;
            if op.flags.has(OpFlags::UNMOUNT) {
                tail_blk = after_umount_blk;
                last_sync_lsn = Lsn::new(head_cycle, after_umount_blk);
                clean_unmount = true;
            }
        }

        Ok(TailReport {
            head: head_blk,
            tail: tail_blk,
            head_cycle,
            last_sync_lsn,
            pre_unmount_tail_lsn,
            clean_unmount,
        })
    }
}
