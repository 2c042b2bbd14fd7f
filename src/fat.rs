//! FAT table access and the cluster chain manager.
//!
//! The FAT is an array of next-pointers, one entry per cluster, at a width
//! of 12, 16 or 32 bits. Entry 0 holds the media byte, entry 1 an EOC
//! mark; data clusters start at 2. An entry is FREE (0), a link to the
//! next cluster, BAD, or at/above the EOC threshold, terminating the
//! chain. FAT32 entries are really 28-bit: the top 4 bits are ignored on
//! read and preserved on write.
//!
//! FAT12 packs two entries into three bytes; the entry for cluster `n`
//! starts at byte `n + n/2` and the nibble layout depends on the parity of
//! `n`. Because the sector size is always even, a FAT16/32 entry never
//! spans a sector boundary; a FAT12 entry can. Atomic update of such a
//! straddling entry is not guaranteed, so while journaling is armed the
//! free-cluster search refuses to hand those clusters out. This is a
//! correctness interlock, not an optimization.
//!
//! When the volume carries two FATs, every write lands in both copies;
//! reads go to FAT #1.

use crate::bpb::FatType;
use crate::device::SecType;
use crate::fs::FileSystem;
use crate::{ClusNbr, Error, Result, FREE_CLUSTER};

/// How a chain walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChainEnd {
    /// The requested number of links was followed.
    Complete,
    /// An EOC mark was reached; the returned cluster is the chain's last.
    Eoc,
    /// A FREE/BAD/reserved entry was found mid-chain; the returned cluster
    /// is the last one whose entry was a valid link.
    Invalid,
}

impl FileSystem {
    /// EOC value written when terminating a chain.
    pub(crate) fn eoc(&self) -> u32 {
        self.fat_type.eoc()
    }

    pub(crate) fn is_eoc(&self, val: u32) -> bool {
        val >= self.fat_type.eoc_min()
    }

    pub(crate) fn is_bad(&self, val: u32) -> bool {
        val == self.fat_type.bad()
    }

    /// Valid data cluster numbers lie in `[2, max_clus_nbr)`.
    pub(crate) fn clus_is_valid(&self, clus: ClusNbr) -> bool {
        clus >= 2 && clus < self.max_clus_nbr
    }

    /// Whether the FAT12 entry for `clus` spans a sector boundary.
    pub(crate) fn fat12_entry_straddles(&self, clus: ClusNbr) -> bool {
        let off = clus as usize + (clus as usize >> 1);
        off % self.sec_size == self.sec_size - 1
    }

    /// Read one FAT entry, masked to the FAT width.
    pub(crate) fn clus_val_rd(&self, clus: ClusNbr) -> Result<u32> {
        if clus >= self.max_clus_nbr {
            return Err(Error::ClusInvalid);
        }
        let sec_size = self.sec_size;
        match self.fat_type {
            FatType::Fat12 => {
                let off = clus as usize + (clus as usize >> 1);
                let sec = self.fat_start + (off / sec_size) as u32;
                let off_in_sec = off % sec_size;
                let b0 = self.sec_read(sec, SecType::Mgmt, |b| b[off_in_sec])?;
                let b1 = if off_in_sec + 1 < sec_size {
                    self.sec_read(sec, SecType::Mgmt, |b| b[off_in_sec + 1])?
                } else {
                    self.sec_read(sec + 1, SecType::Mgmt, |b| b[0])?
                };
                let raw = u16::from_le_bytes([b0, b1]);
                let val = if clus & 1 == 0 { raw & 0x0FFF } else { raw >> 4 };
                Ok(val as u32)
            }
            FatType::Fat16 => {
                let off = clus as usize * 2;
                let sec = self.fat_start + (off / sec_size) as u32;
                let off_in_sec = off % sec_size;
                let val =
                    self.sec_read(sec, SecType::Mgmt, |b| crate::codec::get_u16(b, off_in_sec))?;
                Ok(val as u32)
            }
            FatType::Fat32 => {
                let off = clus as usize * 4;
                let sec = self.fat_start + (off / sec_size) as u32;
                let off_in_sec = off % sec_size;
                let val =
                    self.sec_read(sec, SecType::Mgmt, |b| crate::codec::get_u32(b, off_in_sec))?;
                Ok(val & 0x0FFF_FFFF)
            }
        }
    }

    /// Write one FAT entry into every FAT copy.
    pub(crate) fn clus_val_wr(&self, clus: ClusNbr, val: u32) -> Result<()> {
        if clus >= self.max_clus_nbr {
            return Err(Error::ClusInvalid);
        }
        let sec_size = self.sec_size;
        for fat_idx in 0..self.num_fats {
            let base = self.fat_start + fat_idx * self.fat_size;
            match self.fat_type {
                FatType::Fat12 => {
                    let off = clus as usize + (clus as usize >> 1);
                    let sec = base + (off / sec_size) as u32;
                    let off_in_sec = off % sec_size;
                    let even = clus & 1 == 0;
                    self.sec_modify(sec, SecType::Mgmt, |b| {
                        if even {
                            b[off_in_sec] = (val & 0xFF) as u8;
                        } else {
                            b[off_in_sec] =
                                (b[off_in_sec] & 0x0F) | (((val & 0x0F) as u8) << 4);
                        }
                    })?;
                    let (sec1, off1) = if off_in_sec + 1 < sec_size {
                        (sec, off_in_sec + 1)
                    } else {
                        (sec + 1, 0)
                    };
                    self.sec_modify(sec1, SecType::Mgmt, |b| {
                        if even {
                            b[off1] = (b[off1] & 0xF0) | (((val >> 8) & 0x0F) as u8);
                        } else {
                            b[off1] = ((val >> 4) & 0xFF) as u8;
                        }
                    })?;
                }
                FatType::Fat16 => {
                    let off = clus as usize * 2;
                    let sec = base + (off / sec_size) as u32;
                    let off_in_sec = off % sec_size;
                    self.sec_modify(sec, SecType::Mgmt, |b| {
                        crate::codec::set_u16(b, off_in_sec, val as u16)
                    })?;
                }
                FatType::Fat32 => {
                    let off = clus as usize * 4;
                    let sec = base + (off / sec_size) as u32;
                    let off_in_sec = off % sec_size;
                    self.sec_modify(sec, SecType::Mgmt, |b| {
                        // The top 4 bits are reserved and must survive.
                        let old = crate::codec::get_u32(b, off_in_sec);
                        let new = (old & 0xF000_0000) | (val & 0x0FFF_FFFF);
                        crate::codec::set_u32(b, off_in_sec, new);
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Find a free cluster, scanning from the hint and wrapping at
    /// `max_clus_nbr` back to cluster 2. A full revolution without a hit
    /// is `DevFull`. On success the hint advances past the found cluster.
    pub(crate) fn clus_free_find(&mut self) -> Result<ClusNbr> {
        let total = self.max_clus_nbr - 2;
        let mut clus = self.next_clus_nbr;
        if !self.clus_is_valid(clus) {
            clus = 2;
        }
        for _ in 0..total {
            let skip = self.fat_type == FatType::Fat12
                && self.journal_logging()
                && self.fat12_entry_straddles(clus);
            if !skip && self.clus_val_rd(clus)? == FREE_CLUSTER {
                self.next_clus_nbr = clus + 1;
                return Ok(clus);
            }
            clus += 1;
            if clus >= self.max_clus_nbr {
                clus = 2;
            }
        }
        Err(Error::DevFull)
    }

    /// Follow up to `len` links from `start_clus`. Returns the reached
    /// cluster (per [`ChainEnd`]), the number of links followed, and how
    /// the walk ended.
    pub(crate) fn clus_chain_follow(
        &self,
        start_clus: ClusNbr,
        len: u32,
    ) -> Result<(ClusNbr, u32, ChainEnd)> {
        if !self.clus_is_valid(start_clus) {
            return Err(Error::ClusInvalid);
        }
        let mut prev = 0;
        let mut cur = start_clus;
        let mut cnt = 0u32;
        while cnt < len {
            let next = self.clus_val_rd(cur)?;
            if !self.clus_is_valid(next) {
                if next >= self.fat_type.eoc_min() {
                    return Ok((cur, cnt, ChainEnd::Eoc));
                }
                return Ok((prev, cnt, ChainEnd::Invalid));
            }
            cnt += 1;
            prev = cur;
            cur = next;
        }
        Ok((cur, cnt, ChainEnd::Complete))
    }

    /// Follow a chain to its end. With an intact chain the result is
    /// `(last cluster, links followed, Eoc)`; the chain length is the link
    /// count plus one.
    pub(crate) fn clus_chain_end_find(&self, start_clus: ClusNbr) -> Result<(ClusNbr, u32, ChainEnd)> {
        self.clus_chain_follow(start_clus, u32::MAX)
    }

    /// Walk the FAT backward looking for the predecessor of `start_clus`,
    /// repeating until `stop_clus` or the chain head is reached. The scan
    /// runs from `target - 1` downward with wraparound; a full revolution
    /// without a predecessor means the target is its chain's first
    /// cluster. This reaches the predecessor of a cluster without storing
    /// back-pointers.
    pub(crate) fn clus_chain_reverse_follow(
        &self,
        start_clus: ClusNbr,
        stop_clus: ClusNbr,
    ) -> Result<ClusNbr> {
        if !self.clus_is_valid(start_clus) || !self.clus_is_valid(stop_clus) {
            return Err(Error::ClusInvalid);
        }
        let total = self.max_clus_nbr - 2;
        let mut target = start_clus;
        'outer: loop {
            if target == stop_clus {
                return Ok(target);
            }
            let mut clus = if target > 2 {
                target - 1
            } else {
                self.max_clus_nbr - 1
            };
            for _ in 0..total {
                if self.clus_val_rd(clus)? == target {
                    target = clus;
                    continue 'outer;
                }
                clus = if clus > 2 { clus - 1 } else { self.max_clus_nbr - 1 };
            }
            return Ok(target);
        }
    }

    /// Allocate `nbr_clus` clusters: start a new chain when `start_clus`
    /// is 0, else extend the chain ending at `start_clus`. Returns the
    /// first cluster of the new segment and the number actually allocated
    /// (0 when `start_clus` already had a successor). On exhaustion
    /// mid-allocation every cluster written so far is rewound and the call
    /// fails with `DevFull`.
    pub(crate) fn clus_chain_alloc(
        &mut self,
        start_clus: ClusNbr,
        nbr_clus: u32,
    ) -> Result<(ClusNbr, u32)> {
        if nbr_clus == 0 {
            return Ok((start_clus, 0));
        }
        let is_new = start_clus == FREE_CLUSTER;
        let first;
        if is_new {
            first = self.clus_free_find()?;
        } else {
            if !self.clus_is_valid(start_clus) {
                return Err(Error::ClusInvalid);
            }
            let next = self.clus_val_rd(start_clus)?;
            if self.clus_is_valid(next) {
                // Already linked onward; nothing to do.
                return Ok((next, 0));
            }
            if self.is_bad(next) {
                return Err(Error::ClusChainEnd);
            }
            if !self.is_eoc(next) {
                return Err(Error::ClusInvalid);
            }
            first = start_clus;
        }

        let log_start = first;
        self.journal_enter_clus_chain_alloc(log_start, is_new)?;

        let mut cur = first;
        let mut remaining = nbr_clus;
        let mut first_new = 0;
        if is_new {
            self.clus_val_wr(first, self.eoc())?;
            if let Some(q) = self.query_cache.as_mut() {
                q.free_cnt -= 1;
            }
            first_new = first;
            remaining -= 1;
        }
        while remaining > 0 {
            let next = match self.clus_free_find() {
                Ok(n) => n,
                Err(Error::DevFull) => {
                    // Rewind the partial allocation, then report full.
                    self.clus_chain_reverse_del(log_start, is_new)?;
                    return Err(Error::DevFull);
                }
                Err(e) => return Err(e),
            };
            // The new tail is EOC-terminated before it is linked in, so
            // the chain stays well formed at every step.
            self.clus_val_wr(next, self.eoc())?;
            self.clus_val_wr(cur, next)?;
            if let Some(q) = self.query_cache.as_mut() {
                q.free_cnt -= 1;
            }
            if first_new == 0 {
                first_new = next;
            }
            remaining -= 1;
            cur = next;
        }
        Ok((first_new, nbr_clus))
    }

    /// Delete a chain walking forward from `start_clus`. With
    /// `del_first == false` the start cluster is kept and terminated EOC.
    /// Stops without error at an EOC or at the first invalid next-pointer,
    /// so a partially corrupt chain still frees its reachable prefix.
    /// Returns the number of clusters freed.
    pub(crate) fn clus_chain_del(&mut self, start_clus: ClusNbr, del_first: bool) -> Result<u32> {
        if !self.clus_is_valid(start_clus) {
            return Err(Error::ClusInvalid);
        }
        if self.journal_logging() {
            let (_, cnt, end) = self.clus_chain_end_find(start_clus)?;
            let len = match end {
                ChainEnd::Eoc => cnt + 1,
                _ => cnt,
            };
            self.journal_enter_clus_chain_del(start_clus, len.max(1), del_first)?;
        }
        let mut cur = start_clus;
        let mut del = del_first;
        let mut freed = 0u32;
        loop {
            let next = self.clus_val_rd(cur)?;
            let new_val = if !del {
                del = true;
                self.eoc()
            } else {
                self.clus_release(cur)?;
                if let Some(q) = self.query_cache.as_mut() {
                    q.free_cnt += 1;
                }
                freed += 1;
                FREE_CLUSTER
            };
            self.clus_val_wr(cur, new_val)?;
            if !self.clus_is_valid(next) {
                break;
            }
            cur = next;
        }
        Ok(freed)
    }

    /// Delete a chain backward: repeatedly find the last reachable cluster
    /// and free it, until `start_clus` itself is handled. Used to rewind a
    /// failed allocation; a crash mid-rewind leaves a well-formed, shorter
    /// chain.
    pub(crate) fn clus_chain_reverse_del(
        &mut self,
        start_clus: ClusNbr,
        del_first: bool,
    ) -> Result<u32> {
        if !self.clus_is_valid(start_clus) {
            return Err(Error::ClusInvalid);
        }
        let mut freed = 0u32;
        loop {
            let (found, _, end) = self.clus_chain_end_find(start_clus)?;
            let mut cur = found;
            if matches!(end, ChainEnd::Invalid) && cur == 0 {
                // The start entry itself is no valid link; make sure it
                // still ends up free or EOC below.
                cur = start_clus;
            }
            if cur == start_clus && !del_first {
                self.clus_val_wr(cur, self.eoc())?;
            } else {
                self.clus_release(cur)?;
                if let Some(q) = self.query_cache.as_mut() {
                    q.free_cnt += 1;
                }
                freed += 1;
                self.clus_val_wr(cur, FREE_CLUSTER)?;
            }
            if cur == start_clus {
                break;
            }
        }
        Ok(freed)
    }

    /// Tell the device and the buffer cache that a cluster's sectors are
    /// going away.
    pub(crate) fn clus_release(&self, clus: ClusNbr) -> Result<()> {
        let first = self.clus_to_sec(clus);
        self.device.sec_release(first, self.clus_size_sec)?;
        for i in 0..self.clus_size_sec {
            crate::cache::sec_cache_discard(self.vol_id, first + i);
        }
        Ok(())
    }

    /// Zero every sector of a cluster (directory growth).
    pub(crate) fn clus_clear(&self, clus: ClusNbr) -> Result<()> {
        let first = self.clus_to_sec(clus);
        for i in 0..self.clus_size_sec {
            self.sec_zero(first + i, SecType::Dir)?;
        }
        Ok(())
    }

}
