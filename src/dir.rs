//! Directory entry engine: locate, create, delete and enumerate entries.
//!
//! On disk a directory is a run of 32-byte slots. An entry with a long
//! name occupies its long-name slots immediately followed by one 8.3
//! slot; the long slots appear in reverse filename order, so the slot
//! holding the final characters comes first and is OR'd with 0x40.
//!
//! ```text
//! low address                                   high address
//! fileA_lfn[n] .. fileA_lfn[1] fileA_8.3 fileB_lfn[m] .. fileB_8.3 ...
//! ```
//!
//! Every operation here shares one cursor type, `(sector, byte offset)`,
//! and advances one raw slot at a time, crossing sector and cluster
//! boundaries through the sector walker. A first byte of 0x00 is the
//! logical directory end: nothing after it is ever in use, which both
//! search loops and the free-run scan exploit. Creation looks for a
//! contiguous run of free slots (deleted or never used) long enough for
//! the whole entry, growing the directory by one zeroed cluster when the
//! run would extend past the last allocated sector.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::clock;
use crate::device::SecType;
use crate::entry::{self, LongDirEntry, ShortDirEntry};
use crate::fs::FileSystem;
use crate::name;
use crate::{
    ClusNbr, Error, Result, SecNbr, ATTR_DIRECTORY, DIRENT_SIZE, DIR_ENTRY_FREE,
    LAST_LONG_ENTRY, LONG_NAME_PIECE_LEN,
};

pub const DOT_NAME: [u8; 11] = *b".          ";
pub const DOTDOT_NAME: [u8; 11] = *b"..         ";

/// Longest long-name slot run (255 characters in 13-unit pieces).
const MAX_LFN_SLOTS: usize = 20;

/// Position of one directory slot: sector number and byte offset inside
/// the sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirPos {
    pub sec: SecNbr,
    pub off: u32,
}

/// A located entry: the slot range `[start, end]` covering the leading
/// long-name slot through the terminal 8.3 slot, and the decoded short
/// entry.
#[derive(Debug, Clone)]
pub(crate) struct FoundEntry {
    pub start: DirPos,
    pub end: DirPos,
    pub sde: ShortDirEntry,
    pub name: String,
}

/// One enumerated directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirItem {
    pub name: String,
    pub attr: u8,
    pub size: u32,
    pub first_clus: ClusNbr,
}

/// Long-name reconstruction state while scanning a directory. Slots must
/// count down contiguously from the 0x40-marked slot and agree on the
/// checksum; any violation orphans the sequence and it is dropped.
struct LfnAccum {
    start: DirPos,
    chksum: u8,
    total: u8,
    next_ord: u8,
    units: [u16; MAX_LFN_SLOTS * LONG_NAME_PIECE_LEN],
}

impl LfnAccum {
    fn begin(pos: DirPos, lde: &LongDirEntry) -> Option<Self> {
        let total = lde.ord_index();
        if total == 0 || total as usize > MAX_LFN_SLOTS {
            return None;
        }
        let mut accum = Self {
            start: pos,
            chksum: lde.chksum,
            total,
            next_ord: total,
            units: [0xFFFF; MAX_LFN_SLOTS * LONG_NAME_PIECE_LEN],
        };
        accum.put(lde);
        accum.next_ord = total - 1;
        Some(accum)
    }

    fn put(&mut self, lde: &LongDirEntry) {
        let base = (lde.ord_index() - 1) as usize * LONG_NAME_PIECE_LEN;
        self.units[base..base + LONG_NAME_PIECE_LEN].copy_from_slice(&lde.units);
    }

    fn add(&mut self, lde: &LongDirEntry) -> bool {
        if lde.is_last()
            || self.next_ord == 0
            || lde.ord_index() != self.next_ord
            || lde.chksum != self.chksum
        {
            return false;
        }
        self.put(lde);
        self.next_ord -= 1;
        true
    }

    fn complete(&self) -> bool {
        self.next_ord == 0
    }

    fn name(&self) -> String {
        name::lfn_units_to_string(&self.units[..self.total as usize * LONG_NAME_PIECE_LEN])
    }
}

impl FileSystem {
    /// The slot after `pos`, crossing sectors through the walker.
    pub(crate) fn dir_pos_next(&self, pos: DirPos) -> Result<DirPos> {
        let off = pos.off + DIRENT_SIZE as u32;
        if (off as usize) < self.sec_size {
            Ok(DirPos { sec: pos.sec, off })
        } else {
            Ok(DirPos {
                sec: self.sec_next_get(pos.sec)?,
                off: 0,
            })
        }
    }

    /// The slot after `pos`, growing the directory by a zeroed cluster at
    /// the chain end.
    fn dir_pos_next_alloc(&mut self, pos: DirPos) -> Result<DirPos> {
        let off = pos.off + DIRENT_SIZE as u32;
        if (off as usize) < self.sec_size {
            Ok(DirPos { sec: pos.sec, off })
        } else {
            Ok(DirPos {
                sec: self.sec_next_get_alloc(pos.sec, true)?,
                off: 0,
            })
        }
    }

    pub(crate) fn dir_slot_rd(&self, pos: DirPos) -> Result<[u8; DIRENT_SIZE]> {
        self.sec_read(pos.sec, SecType::Dir, |b| {
            let off = pos.off as usize;
            let mut raw = [0u8; DIRENT_SIZE];
            raw.copy_from_slice(&b[off..off + DIRENT_SIZE]);
            raw
        })
    }

    pub(crate) fn dir_slot_wr(&self, pos: DirPos, raw: &[u8; DIRENT_SIZE]) -> Result<()> {
        self.sec_modify(pos.sec, SecType::Dir, |b| {
            let off = pos.off as usize;
            b[off..off + DIRENT_SIZE].copy_from_slice(raw);
        })
    }

    /// Search a directory for `name_entry`, matching the reconstructed
    /// long name case-insensitively, or failing that the 8.3 name.
    pub(crate) fn dir_entry_find(
        &self,
        parent_sec: SecNbr,
        name_entry: &str,
    ) -> Result<Option<FoundEntry>> {
        if name_entry.is_empty() {
            return Err(Error::NameNull);
        }
        let target_sfn = match name_entry {
            "." => Some(DOT_NAME),
            ".." => Some(DOTDOT_NAME),
            _ => name::sfn_format(name_entry),
        };
        let mut pos = DirPos {
            sec: parent_sec,
            off: 0,
        };
        let mut accum: Option<LfnAccum> = None;
        loop {
            let raw = self.dir_slot_rd(pos)?;
            if entry::slot_is_end(&raw) {
                return Ok(None);
            }
            if entry::slot_is_deleted(&raw) {
                accum = None;
            } else if entry::slot_is_long(&raw) {
                let lde = LongDirEntry::load(&raw);
                if lde.is_last() {
                    accum = LfnAccum::begin(pos, &lde);
                } else {
                    let ok = match accum.as_mut() {
                        Some(a) => a.add(&lde),
                        None => false,
                    };
                    if !ok {
                        accum = None;
                    }
                }
            } else {
                let sde = ShortDirEntry::load(&raw);
                if !sde.is_volume_id() {
                    let lfn = accum
                        .as_ref()
                        .filter(|a| a.complete() && a.chksum == sde.checksum());
                    if let Some(a) = lfn {
                        let lname = a.name();
                        if name::name_eq_ci(&lname, name_entry) {
                            return Ok(Some(FoundEntry {
                                start: a.start,
                                end: pos,
                                sde,
                                name: lname,
                            }));
                        }
                    }
                    if let Some(t) = target_sfn {
                        if t == sde.name {
                            // A valid long-name set still belongs to this
                            // entry; a delete must take its slots along.
                            let start = lfn.map(|a| a.start).unwrap_or(pos);
                            let found_name =
                                lfn.map(|a| a.name()).unwrap_or_else(|| sde.name_string());
                            return Ok(Some(FoundEntry {
                                start,
                                end: pos,
                                sde,
                                name: found_name,
                            }));
                        }
                    }
                }
                accum = None;
            }
            pos = match self.dir_pos_next(pos) {
                Ok(p) => p,
                Err(Error::DirFull) | Err(Error::ClusChainEnd) => return Ok(None),
                Err(e) => return Err(e),
            };
        }
    }

    /// Whether a non-deleted 8.3 slot with exactly this name exists.
    /// Deleted slots do not count as collisions.
    fn dir_sfn_exists(&self, parent_sec: SecNbr, name11: &[u8; 11]) -> Result<bool> {
        let mut pos = DirPos {
            sec: parent_sec,
            off: 0,
        };
        loop {
            let raw = self.dir_slot_rd(pos)?;
            if entry::slot_is_end(&raw) {
                return Ok(false);
            }
            if !entry::slot_is_deleted(&raw) && !entry::slot_is_long(&raw) {
                let sde = ShortDirEntry::load(&raw);
                if sde.name == *name11 {
                    return Ok(true);
                }
            }
            pos = match self.dir_pos_next(pos) {
                Ok(p) => p,
                Err(Error::DirFull) | Err(Error::ClusChainEnd) => return Ok(false),
                Err(e) => return Err(e),
            };
        }
    }

    /// Find a contiguous run of `slots` free slots, reclaiming deleted
    /// ones and growing the directory when the run pushes past the last
    /// allocated sector. Returns the run's first and last slot positions.
    pub(crate) fn dir_free_run_find(
        &mut self,
        parent_sec: SecNbr,
        slots: u32,
    ) -> Result<(DirPos, DirPos)> {
        let mut pos = DirPos {
            sec: parent_sec,
            off: 0,
        };
        let mut run_start: Option<DirPos> = None;
        let mut run_len = 0u32;
        loop {
            let raw = self.dir_slot_rd(pos)?;
            if entry::slot_is_end(&raw) || entry::slot_is_deleted(&raw) {
                if run_start.is_none() {
                    run_start = Some(pos);
                }
                run_len += 1;
                if run_len == slots {
                    return Ok((run_start.unwrap_or(pos), pos));
                }
            } else {
                run_start = None;
                run_len = 0;
            }
            pos = self.dir_pos_next_alloc(pos)?;
        }
    }

    /// Create a directory entry. For a long name the required long-name
    /// slots are written first (reverse order), then the 8.3 slot carrying
    /// `attr`, `first_clus` and `size`. A directory entry with no cluster
    /// yet gets one allocated, zeroed, and seeded with its `.` and `..`
    /// entries; `..` records `parent_first_clus` (0 when the parent is the
    /// root directory).
    pub(crate) fn dir_entry_create(
        &mut self,
        parent_sec: SecNbr,
        parent_first_clus: ClusNbr,
        name_entry: &str,
        attr: u8,
        first_clus: ClusNbr,
        size: u32,
    ) -> Result<FoundEntry> {
        if name_entry.is_empty() {
            return Err(Error::NameNull);
        }
        let is_dir = attr & ATTR_DIRECTORY != 0;
        let (sfn_bytes, lfn_pieces) = if !name::needs_lfn(name_entry) {
            (name::sfn_format(name_entry).ok_or(Error::NameInvalid)?, None)
        } else {
            if !self.cfg.lfn {
                return Err(Error::InvalidAccessMode);
            }
            let pieces = name::lfn_split(name_entry).ok_or(Error::NameInvalid)?;
            let mut n = 1u32;
            let alias = loop {
                let candidate = name::sfn_alias(name_entry, n);
                if !self.dir_sfn_exists(parent_sec, &candidate)? {
                    break candidate;
                }
                n += 1;
                if n > 999_999 {
                    return Err(Error::NameInvalid);
                }
            };
            (alias, Some(pieces))
        };

        let slot_cnt = 1 + lfn_pieces.as_ref().map_or(0, |p| p.len());
        let (start, end) = self.dir_free_run_find(parent_sec, slot_cnt as u32)?;

        let (date, time, tenth) = clock::now_fields(self.cfg.clock.as_ref());

        // A brand-new directory gets its cluster and dot entries before
        // its slots are committed; a crash in between is rewound by the
        // allocation record alone.
        let mut first_clus = first_clus;
        if is_dir && first_clus == 0 {
            let (clus, _) = self.clus_chain_alloc(0, 1)?;
            self.clus_clear(clus)?;
            first_clus = clus;
            let dir_sec = self.clus_to_sec(clus);
            let mut dot = ShortDirEntry::new(DOT_NAME, ATTR_DIRECTORY, clus, 0, self.fat_type);
            dot.set_times(date, time, tenth);
            let mut dotdot =
                ShortDirEntry::new(DOTDOT_NAME, ATTR_DIRECTORY, parent_first_clus, 0, self.fat_type);
            dotdot.set_times(date, time, tenth);
            self.sec_modify(dir_sec, SecType::Dir, |b| {
                dot.store(&mut b[0..DIRENT_SIZE]);
                dotdot.store(&mut b[DIRENT_SIZE..2 * DIRENT_SIZE]);
            })?;
        }

        self.journal_enter_entry_create(start, end)?;

        let mut sde = ShortDirEntry::new(
            sfn_bytes,
            attr,
            first_clus,
            if is_dir { 0 } else { size },
            self.fat_type,
        );
        sde.set_times(date, time, tenth);

        let mut pos = start;
        if let Some(pieces) = &lfn_pieces {
            let total = pieces.len();
            let chksum = sde.checksum();
            for i in 0..total {
                let piece_idx = total - 1 - i;
                let mut ord = (piece_idx + 1) as u8;
                if i == 0 {
                    ord |= LAST_LONG_ENTRY;
                }
                let lde = LongDirEntry::new(ord, chksum, pieces[piece_idx]);
                let mut raw = [0u8; DIRENT_SIZE];
                lde.store(&mut raw);
                self.dir_slot_wr(pos, &raw)?;
                pos = self.dir_pos_next(pos)?;
            }
        }
        let mut raw = [0u8; DIRENT_SIZE];
        sde.store(&mut raw);
        self.dir_slot_wr(pos, &raw)?;

        Ok(FoundEntry {
            start,
            end,
            sde,
            name: name_entry.to_string(),
        })
    }

    /// Delete the slots in `[start, end]`: the pre-images are journalled,
    /// then each slot's first byte becomes 0xE5. Nothing else in the slots
    /// is touched.
    pub(crate) fn dir_entry_del(&mut self, start: DirPos, end: DirPos) -> Result<()> {
        self.journal_enter_entry_update(start, end)?;
        let mut pos = start;
        loop {
            self.sec_modify(pos.sec, SecType::Dir, |b| {
                b[pos.off as usize] = DIR_ENTRY_FREE;
            })?;
            if pos == end {
                break;
            }
            pos = self.dir_pos_next(pos)?;
        }
        Ok(())
    }

    /// A directory is empty when it holds at most its `.` and `..` slots
    /// before the logical end.
    pub(crate) fn dir_is_empty(&self, dir_first_sec: SecNbr) -> Result<bool> {
        let mut pos = DirPos {
            sec: dir_first_sec,
            off: 0,
        };
        let mut used = 0u32;
        loop {
            let raw = self.dir_slot_rd(pos)?;
            if entry::slot_is_end(&raw) {
                return Ok(true);
            }
            if !entry::slot_is_deleted(&raw) {
                used += 1;
                if used > 2 {
                    return Ok(false);
                }
            }
            pos = match self.dir_pos_next(pos) {
                Ok(p) => p,
                Err(Error::DirFull) | Err(Error::ClusChainEnd) => return Ok(true),
                Err(e) => return Err(e),
            };
        }
    }

    /// Enumerate a directory. Orphan long-name slots are skipped; names
    /// come from the long name when a valid set precedes the 8.3 slot.
    pub(crate) fn dir_list(&self, parent_sec: SecNbr) -> Result<Vec<DirItem>> {
        let mut items = Vec::new();
        let mut pos = DirPos {
            sec: parent_sec,
            off: 0,
        };
        let mut accum: Option<LfnAccum> = None;
        loop {
            let raw = self.dir_slot_rd(pos)?;
            if entry::slot_is_end(&raw) {
                return Ok(items);
            }
            if entry::slot_is_deleted(&raw) {
                accum = None;
            } else if entry::slot_is_long(&raw) {
                let lde = LongDirEntry::load(&raw);
                if lde.is_last() {
                    accum = LfnAccum::begin(pos, &lde);
                } else {
                    let ok = match accum.as_mut() {
                        Some(a) => a.add(&lde),
                        None => false,
                    };
                    if !ok {
                        accum = None;
                    }
                }
            } else {
                let sde = ShortDirEntry::load(&raw);
                if !sde.is_volume_id() {
                    let lname = accum
                        .as_ref()
                        .filter(|a| a.complete() && a.chksum == sde.checksum())
                        .map(|a| a.name());
                    items.push(DirItem {
                        name: lname.unwrap_or_else(|| sde.name_string()),
                        attr: sde.attr,
                        size: sde.file_size,
                        first_clus: sde.first_clus(self.fat_type),
                    });
                }
                accum = None;
            }
            pos = match self.dir_pos_next(pos) {
                Ok(p) => p,
                Err(Error::DirFull) | Err(Error::ClusChainEnd) => return Ok(items),
                Err(e) => return Err(e),
            };
        }
    }
}
