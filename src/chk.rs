//! Volume consistency check.
//!
//! Walks every directory reachable from the root with an explicit stack,
//! validates each entry's cluster chain, and then sweeps the FAT to
//! classify every cluster. The check is read-only; it reports, it does not
//! repair. After any completed top-level operation a healthy volume
//! satisfies:
//!
//! - no valid data cluster carries the BAD mark inside a chain;
//! - every reachable entry's first cluster is 0 or starts a chain that
//!   terminates at EOC;
//! - no two entries share a cluster (no cross-links);
//! - FREE count = data clusters - used - bad;
//! - with two FATs, both copies are byte-identical;
//! - the journal is empty or begins with its enter mark.

use alloc::vec;
use alloc::vec::Vec;

use crate::codec::get_u16;
use crate::device::SecType;
use crate::dir::DirPos;
use crate::entry::{self, LongDirEntry, ShortDirEntry};
use crate::fs::FileSystem;
use crate::journal::MARK_ENTER;
use crate::{ClusNbr, Error, Result, SecNbr, FREE_CLUSTER};

/// Nesting cap for the directory walk; deeper trees report a fault rather
/// than recursing forever over a cyclic on-disk structure.
const CHK_MAX_DEPTH: usize = 64;

/// Findings of one [`FileSystem::vol_chk`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChkReport {
    /// Reachable non-dot entries (files and directories).
    pub entries: u32,
    pub dirs: u32,
    pub files: u32,
    /// Clusters reachable through some entry's chain.
    pub used_clus: u32,
    /// FREE entries in the FAT.
    pub free_clus: u32,
    /// BAD-marked clusters.
    pub bad_clus: u32,
    /// Allocated but unreachable clusters.
    pub lost_clus: u32,
    /// Clusters claimed by more than one chain.
    pub cross_links: u32,
    /// Chains that end on an invalid entry, or size/chain mismatches.
    pub chain_faults: u32,
    /// `.`/`..` entries pointing at the wrong cluster.
    pub dot_faults: u32,
    /// Long-name slot sequences with no matching 8.3 slot.
    pub orphan_lfn: u32,
    /// FAT copies differ (two-FAT volumes only).
    pub mirror_fault: bool,
    /// Journal is neither empty nor a valid log head.
    pub journal_fault: bool,
}

impl ChkReport {
    /// No corruption of any kind found. Lost clusters are corruption: the
    /// free count no longer matches the FAT.
    pub fn is_clean(&self) -> bool {
        self.lost_clus == 0
            && self.cross_links == 0
            && self.chain_faults == 0
            && self.dot_faults == 0
            && self.orphan_lfn == 0
            && !self.mirror_fault
            && !self.journal_fault
    }
}

struct DirFrame {
    sec: SecNbr,
    /// First cluster as `..` entries record it (0 for the root).
    clus: ClusNbr,
    parent_clus: ClusNbr,
}

impl FileSystem {
    /// Audit the volume against the invariants above.
    pub fn vol_chk(&self) -> Result<ChkReport> {
        let mut report = ChkReport::default();
        let total = self.max_clus_nbr as usize;
        let mut seen = vec![false; total];

        // The FAT32 root is itself a chain and must be accounted for.
        if self.root_clus != 0 {
            self.chk_mark_chain(self.root_clus, &mut seen, &mut report);
        }

        let mut stack: Vec<DirFrame> = Vec::new();
        stack.push(DirFrame {
            sec: self.root_dir_first_sec(),
            clus: 0,
            parent_clus: 0,
        });

        while let Some(frame) = stack.pop() {
            if stack.len() >= CHK_MAX_DEPTH {
                report.chain_faults += 1;
                continue;
            }
            self.chk_dir(&frame, &mut stack, &mut seen, &mut report)?;
        }

        // FAT sweep: everything allocated must have been reached.
        for clus in 2..self.max_clus_nbr {
            let val = self.clus_val_rd(clus)?;
            if val == FREE_CLUSTER {
                report.free_clus += 1;
            } else if self.is_bad(val) {
                report.bad_clus += 1;
            } else if !seen[clus as usize] {
                report.lost_clus += 1;
            }
        }

        if self.num_fats == 2 {
            let mut primary = vec![0u8; self.sec_size];
            for s in 0..self.fat_size {
                self.sec_read(self.fat_start + s, SecType::Mgmt, |b| {
                    primary.copy_from_slice(b)
                })?;
                let same = self.sec_read(self.fat_start + self.fat_size + s, SecType::Mgmt, |b| {
                    b == &primary[..]
                })?;
                if !same {
                    report.mirror_fault = true;
                    break;
                }
            }
        }

        if self.journal_is_open() {
            let mut buf = vec![0u8; self.sec_size];
            self.device
                .sec_rd(&mut buf, self.journal.secs[0], 1, SecType::Mgmt)?;
            let head = get_u16(&buf, 0);
            if head != 0 && head != MARK_ENTER {
                report.journal_fault = true;
            }
        }
        Ok(report)
    }

    /// Mark a chain's clusters, reporting cross-links and a bad ending.
    /// Returns the number of clusters in the walked prefix.
    fn chk_mark_chain(&self, first: ClusNbr, seen: &mut [bool], report: &mut ChkReport) -> u32 {
        let mut clus = first;
        let mut cnt = 0u32;
        loop {
            if !self.clus_is_valid(clus) {
                report.chain_faults += 1;
                return cnt;
            }
            if seen[clus as usize] {
                report.cross_links += 1;
                return cnt;
            }
            seen[clus as usize] = true;
            report.used_clus += 1;
            cnt += 1;
            let val = match self.clus_val_rd(clus) {
                Ok(v) => v,
                Err(_) => {
                    report.chain_faults += 1;
                    return cnt;
                }
            };
            if self.is_eoc(val) {
                return cnt;
            }
            if !self.clus_is_valid(val) {
                report.chain_faults += 1;
                return cnt;
            }
            clus = val;
        }
    }

    fn chk_dir(
        &self,
        frame: &DirFrame,
        stack: &mut Vec<DirFrame>,
        seen: &mut [bool],
        report: &mut ChkReport,
    ) -> Result<()> {
        let mut pos = DirPos {
            sec: frame.sec,
            off: 0,
        };
        // Pending long-name state: set while a started sequence has not yet
        // met its 8.3 slot.
        let mut lfn_open = false;
        let mut lfn_chksum = 0u8;
        let mut lfn_left = 0u8;
        loop {
            let raw = self.dir_slot_rd(pos)?;
            if entry::slot_is_end(&raw) {
                break;
            }
            if entry::slot_is_deleted(&raw) {
                if lfn_open {
                    report.orphan_lfn += 1;
                    lfn_open = false;
                }
            } else if entry::slot_is_long(&raw) {
                let lde = LongDirEntry::load(&raw);
                if lde.is_last() {
                    if lfn_open {
                        report.orphan_lfn += 1;
                    }
                    lfn_open = true;
                    lfn_chksum = lde.chksum;
                    lfn_left = lde.ord_index();
                } else if lfn_open {
                    if lde.ord_index() + 1 != lfn_left || lde.chksum != lfn_chksum {
                        report.orphan_lfn += 1;
                        lfn_open = false;
                    } else {
                        lfn_left = lde.ord_index();
                    }
                } else {
                    report.orphan_lfn += 1;
                }
            } else {
                let sde = ShortDirEntry::load(&raw);
                if lfn_open {
                    if lfn_left != 1 || sde.checksum() != lfn_chksum {
                        report.orphan_lfn += 1;
                    }
                    lfn_open = false;
                }
                if !sde.is_volume_id() {
                    let fc = sde.first_clus(self.fat_type);
                    if sde.name == crate::dir::DOT_NAME {
                        if fc != frame.clus && frame.clus != 0 {
                            report.dot_faults += 1;
                        }
                    } else if sde.name == crate::dir::DOTDOT_NAME {
                        if fc != frame.parent_clus {
                            report.dot_faults += 1;
                        }
                    } else if sde.is_dir() {
                        report.entries += 1;
                        report.dirs += 1;
                        if !self.clus_is_valid(fc) {
                            report.chain_faults += 1;
                        } else {
                            self.chk_mark_chain(fc, seen, report);
                            stack.push(DirFrame {
                                sec: self.clus_to_sec(fc),
                                clus: fc,
                                parent_clus: frame.clus,
                            });
                        }
                    } else {
                        report.entries += 1;
                        report.files += 1;
                        if fc == FREE_CLUSTER {
                            if sde.file_size != 0 {
                                report.chain_faults += 1;
                            }
                        } else if !self.clus_is_valid(fc) {
                            report.chain_faults += 1;
                        } else {
                            let cnt = self.chk_mark_chain(fc, seen, report);
                            let need = self.clus_cnt_of_len(sde.file_size);
                            if cnt < need {
                                report.chain_faults += 1;
                            }
                        }
                    }
                }
            }
            pos = match self.dir_pos_next(pos) {
                Ok(p) => p,
                Err(Error::DirFull) | Err(Error::ClusChainEnd) => break,
                Err(e) => return Err(e),
            };
        }
        if lfn_open {
            report.orphan_lfn += 1;
        }
        Ok(())
    }
}
