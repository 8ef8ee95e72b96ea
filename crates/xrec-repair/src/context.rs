//! Shared repair state.
//!
//! What the original kept in globals travels here explicitly: the
//! `no_modify` / `ino_discovery` switches, the root-needs-dotdot latch, and
//! the process-wide set of directories that failed their btree walk and
//! must be rebuilt instead of patched.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use xrec_ondisk::geometry::{DirGeometry, FsGeometry};
use xrec_types::InodeNumber;

/// Behavior switches supplied by the phase driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairOptions {
    /// Report every fix as "would have ..." and write nothing.
    pub no_modify: bool,
    /// Unknown-but-valid inode numbers are queued for a later pass instead
    /// of being treated as dangling.
    pub ino_discovery: bool,
}

/// Context threaded through every repair entry point.
pub struct RepairContext {
    pub fs: FsGeometry,
    pub dir_geo: DirGeometry,
    opts: RepairOptions,
    need_root_dotdot: AtomicBool,
    bad_dirs: Mutex<BTreeSet<InodeNumber>>,
}

impl RepairContext {
    #[must_use]
    pub fn new(fs: FsGeometry, dir_geo: DirGeometry, opts: RepairOptions) -> Self {
        Self {
            fs,
            dir_geo,
            opts,
            need_root_dotdot: AtomicBool::new(false),
            bad_dirs: Mutex::new(BTreeSet::new()),
        }
    }

    #[must_use]
    pub fn no_modify(&self) -> bool {
        self.opts.no_modify
    }

    #[must_use]
    pub fn ino_discovery(&self) -> bool {
        self.opts.ino_discovery
    }

    /// "corrected" / "would have corrected" selector for diagnostics.
    #[must_use]
    pub fn fix_verb(&self) -> &'static str {
        if self.opts.no_modify {
            "would have corrected"
        } else {
            "corrected"
        }
    }

    pub fn set_need_root_dotdot(&self) {
        self.need_root_dotdot.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn needs_root_dotdot(&self) -> bool {
        self.need_root_dotdot.load(Ordering::Relaxed)
    }

    /// Record a directory whose hash btree is beyond in-place repair.
    pub fn add_bad_dir(&self, ino: InodeNumber) {
        self.bad_dirs.lock().insert(ino);
    }

    #[must_use]
    pub fn is_bad_dir(&self, ino: InodeNumber) -> bool {
        self.bad_dirs.lock().contains(&ino)
    }

    /// Snapshot of the bad-directory set for the rebuild phase.
    #[must_use]
    pub fn bad_dirs(&self) -> Vec<InodeNumber> {
        self.bad_dirs.lock().iter().copied().collect()
    }
}
