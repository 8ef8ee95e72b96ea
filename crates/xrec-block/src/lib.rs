#![forbid(unsafe_code)]
//! Block I/O facade for the recovery core.
//!
//! Provides [`LogBuf`] (a buffer sized in 512-byte basic blocks that can
//! carry a verifier verdict), the [`BlockIo`] device trait with file-backed
//! and in-memory implementations, degrading allocation for the scan paths,
//! and scattered reads that project several device extents into one logical
//! buffer.

use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;
use xrec_error::{RecoveryError, Result};
use xrec_types::{BBSIZE, Daddr};

/// Verdict recorded on a buffer by a verifier callback.
///
/// A failed verification does not fail the read; repair code decides what a
/// bad buffer means in context (recompute the checksum, discard the block).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufVerifyError {
    BadChecksum,
    Corrupted,
}

/// Content verifier run over a freshly read buffer.
pub type BufVerifier = dyn Fn(&[u8]) -> Option<BufVerifyError>;

/// Owned buffer sized in basic blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBuf {
    bytes: Vec<u8>,
    nbbs: u32,
    verify_error: Option<BufVerifyError>,
}

impl LogBuf {
    /// Allocate a zeroed buffer of `nbbs` basic blocks.
    #[must_use]
    pub fn zeroed(nbbs: u32) -> Self {
        Self {
            bytes: vec![0_u8; nbbs as usize * BBSIZE],
            nbbs,
            verify_error: None,
        }
    }

    #[must_use]
    pub fn nbbs(&self) -> u32 {
        self.nbbs
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// One basic block of the buffer.
    ///
    /// # Panics
    /// Panics if `index >= nbbs`; callers index within the sizes they
    /// allocated.
    #[must_use]
    pub fn bb(&self, index: u32) -> &[u8] {
        let start = index as usize * BBSIZE;
        &self.bytes[start..start + BBSIZE]
    }

    #[must_use]
    pub fn verify_error(&self) -> Option<BufVerifyError> {
        self.verify_error
    }

    pub fn set_verify_error(&mut self, err: Option<BufVerifyError>) {
        self.verify_error = err;
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }
}

/// Buffer allocator with an injectable size cap.
///
/// Real `Vec` allocation aborts rather than failing, so the halving retry
/// mandated for the scan paths is expressed against this cap: a request
/// larger than the cap "fails" and is retried at half the size, down to a
/// single basic block.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufAllocator {
    max_bbs: Option<u32>,
}

impl BufAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator that refuses requests above `max_bbs` blocks.
    #[must_use]
    pub fn capped(max_bbs: u32) -> Self {
        Self {
            max_bbs: Some(max_bbs),
        }
    }

    /// Try to allocate exactly `nbbs` blocks.
    #[must_use]
    pub fn alloc(&self, nbbs: u32) -> Option<LogBuf> {
        if nbbs == 0 {
            return None;
        }
        if let Some(cap) = self.max_bbs {
            if nbbs > cap {
                return None;
            }
        }
        Some(LogBuf::zeroed(nbbs))
    }

    /// Allocate at most `nbbs` blocks, geometrically halving the request on
    /// failure. Only a request that degrades to zero yields `OutOfMemory`.
    pub fn alloc_degrading(&self, nbbs: u32) -> Result<LogBuf> {
        let mut want = nbbs;
        while want > 0 {
            if let Some(buf) = self.alloc(want) {
                if want != nbbs {
                    trace!(
                        target: "xrec::block",
                        requested = nbbs,
                        granted = want,
                        "degraded buffer allocation"
                    );
                }
                return Ok(buf);
            }
            want >>= 1;
        }
        Err(RecoveryError::OutOfMemory)
    }
}

/// Basic-block addressed device.
pub trait BlockIo: Send + Sync {
    /// Total device length in basic blocks.
    fn bb_count(&self) -> u64;

    /// Read `nbbs` blocks starting at `daddr` into the front of `buf`.
    fn read_bbs(&self, daddr: Daddr, nbbs: u32, buf: &mut LogBuf) -> Result<()>;

    /// Write the first `nbbs` blocks of `buf` at `daddr`.
    fn write_bbs(&self, daddr: Daddr, nbbs: u32, buf: &LogBuf) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_range(dev_bbs: u64, daddr: Daddr, nbbs: u32) -> Result<()> {
    let end = daddr
        .checked_add(u64::from(nbbs))
        .ok_or_else(|| RecoveryError::Format("block range overflows u64".to_owned()))?;
    if end.0 > dev_bbs {
        return Err(RecoveryError::Format(format!(
            "block range out of bounds: daddr={daddr} nbbs={nbbs} device_bbs={dev_bbs}"
        )));
    }
    Ok(())
}

fn check_buf(buf_bbs: u32, nbbs: u32) -> Result<()> {
    if nbbs > buf_bbs {
        return Err(RecoveryError::Format(format!(
            "buffer too small: need {nbbs} BBs, have {buf_bbs}"
        )));
    }
    Ok(())
}

/// File-backed device using `pread`/`pwrite` style I/O.
///
/// Opens read-write, falling back to read-only; writes through a read-only
/// handle fail cleanly rather than at open time so `no_modify` runs work on
/// read-only images.
#[derive(Debug, Clone)]
pub struct FileDevice {
    file: Arc<File>,
    bb_count: u64,
    writable: bool,
}

impl FileDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            bb_count: len / BBSIZE as u64,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl BlockIo for FileDevice {
    fn bb_count(&self) -> u64 {
        self.bb_count
    }

    fn read_bbs(&self, daddr: Daddr, nbbs: u32, buf: &mut LogBuf) -> Result<()> {
        check_range(self.bb_count, daddr, nbbs)?;
        check_buf(buf.nbbs(), nbbs)?;
        let offset = daddr
            .to_byte_offset()
            .ok_or_else(|| RecoveryError::Format("device offset overflows u64".to_owned()))?;
        let len = nbbs as usize * BBSIZE;
        self.file.read_exact_at(&mut buf.as_mut_slice()[..len], offset)?;
        buf.set_verify_error(None);
        Ok(())
    }

    fn write_bbs(&self, daddr: Daddr, nbbs: u32, buf: &LogBuf) -> Result<()> {
        if !self.writable {
            return Err(RecoveryError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "device opened read-only",
            )));
        }
        check_range(self.bb_count, daddr, nbbs)?;
        check_buf(buf.nbbs(), nbbs)?;
        let offset = daddr
            .to_byte_offset()
            .ok_or_else(|| RecoveryError::Format("device offset overflows u64".to_owned()))?;
        let len = nbbs as usize * BBSIZE;
        self.file.write_all_at(&buf.as_slice()[..len], offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory device. Used by tests and by the harness image builders.
#[derive(Debug)]
pub struct MemDevice {
    bytes: RwLock<Vec<u8>>,
    bb_count: u64,
}

impl MemDevice {
    #[must_use]
    pub fn new(bb_count: u64) -> Self {
        Self {
            bytes: RwLock::new(vec![0_u8; bb_count as usize * BBSIZE]),
            bb_count,
        }
    }

    /// Build a device over an existing image; the trailing partial block, if
    /// any, is dropped.
    #[must_use]
    pub fn from_image(mut image: Vec<u8>) -> Self {
        let bb_count = (image.len() / BBSIZE) as u64;
        image.truncate(bb_count as usize * BBSIZE);
        Self {
            bytes: RwLock::new(image),
            bb_count,
        }
    }

    /// Full image copy, for byte-identity assertions.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }
}

impl BlockIo for MemDevice {
    fn bb_count(&self) -> u64 {
        self.bb_count
    }

    fn read_bbs(&self, daddr: Daddr, nbbs: u32, buf: &mut LogBuf) -> Result<()> {
        check_range(self.bb_count, daddr, nbbs)?;
        check_buf(buf.nbbs(), nbbs)?;
        let start = daddr.0 as usize * BBSIZE;
        let len = nbbs as usize * BBSIZE;
        buf.as_mut_slice()[..len].copy_from_slice(&self.bytes.read()[start..start + len]);
        buf.set_verify_error(None);
        Ok(())
    }

    fn write_bbs(&self, daddr: Daddr, nbbs: u32, buf: &LogBuf) -> Result<()> {
        check_range(self.bb_count, daddr, nbbs)?;
        check_buf(buf.nbbs(), nbbs)?;
        let start = daddr.0 as usize * BBSIZE;
        let len = nbbs as usize * BBSIZE;
        self.bytes.write()[start..start + len].copy_from_slice(&buf.as_slice()[..len]);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// One contiguous device extent of a logically contiguous range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentMap {
    pub daddr: Daddr,
    pub nbbs: u32,
}

/// Read several contiguous device extents into one logical buffer, then run
/// the verifier and record its verdict on the buffer.
///
/// A verifier failure is not a read failure; the buffer is returned with its
/// `verify_error` set so the caller can decide between recompute and
/// discard.
pub fn read_scattered(
    dev: &dyn BlockIo,
    maps: &[ExtentMap],
    verify: Option<&BufVerifier>,
) -> Result<LogBuf> {
    let total: u32 = maps.iter().map(|m| m.nbbs).sum();
    if total == 0 {
        return Err(RecoveryError::Format(
            "scattered read over an empty extent list".to_owned(),
        ));
    }
    let mut out = LogBuf::zeroed(total);
    let mut filled = 0_u32;
    for map in maps {
        let mut part = LogBuf::zeroed(map.nbbs);
        dev.read_bbs(map.daddr, map.nbbs, &mut part)?;
        let start = filled as usize * BBSIZE;
        let len = map.nbbs as usize * BBSIZE;
        out.as_mut_slice()[start..start + len].copy_from_slice(part.as_slice());
        filled += map.nbbs;
    }
    if let Some(verify) = verify {
        let verdict = verify(out.as_slice());
        out.set_verify_error(verdict);
        if verdict.is_some() {
            trace!(
                target: "xrec::block",
                extents = maps.len(),
                nbbs = total,
                ?verdict,
                "scattered read failed verification"
            );
        }
    }
    Ok(out)
}
