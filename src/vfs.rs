//! High-level entry operations.
//!
//! [`FileSystem::entry_find`] is the single entry point for open, create
//! and delete; truncate and rename build on the same machinery. Paths use
//! `\` as separator and resolve component by component from the root
//! directory; every non-final component must name a directory.
//!
//! An open entry is described by an [`EntryData`] descriptor holding the
//! entry's directory position (terminal 8.3 slot and leading long-name
//! slot), first cluster, size, attributes and the current logical file
//! position. Mutating operations read the descriptor at start and write
//! it back before returning.
//!
//! Ordering rule shared by every mutating operation: a cluster-chain
//! delete is the last low-level write. Replay completes a chain delete
//! forward and keeps everything logged before it, so the slot updates in
//! front of the delete must already be final.

use alloc::string::String;
use alloc::vec::Vec;

use crate::clock;
use crate::device::SecType;
use crate::dir::{DirItem, DirPos, FoundEntry, DOTDOT_NAME};
use crate::entry::ShortDirEntry;
use crate::fat::ChainEnd;
use crate::fs::FileSystem;
use crate::{
    ClusNbr, Error, Mode, Result, SecNbr, ATTR_ARCHIVE, ATTR_DIRECTORY, DIRENT_SIZE,
    FREE_CLUSTER, MODE_APPEND, MODE_CREATE, MODE_DEL, MODE_DIR, MODE_FILE, MODE_MUST_CREATE,
    MODE_RD, MODE_TRUNCATE, MODE_WR, PATH_MAX, PATH_SEP,
};

/// Descriptor of an open entry.
#[derive(Debug, Clone)]
pub struct EntryData {
    name: String,
    /// Position of the terminal 8.3 slot.
    pub(crate) sde_pos: DirPos,
    /// Position of the leading long-name slot, when the entry has one.
    pub(crate) lde_start: Option<DirPos>,
    pub(crate) parent_first_sec: SecNbr,
    pub(crate) attr: u8,
    pub(crate) first_clus: ClusNbr,
    pub(crate) size: u32,
    /// Current logical position; files only.
    pub(crate) pos: u32,
    pub(crate) mode: Mode,
    pub(crate) is_root: bool,
    pub(crate) wrt_date: u16,
    pub(crate) wrt_time: u16,
}

impl EntryData {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attr(&self) -> u8 {
        self.attr
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn pos(&self) -> u32 {
        self.pos
    }

    pub fn first_clus(&self) -> ClusNbr {
        self.first_clus
    }

    pub fn is_dir(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    /// Last-write timestamp, as packed FAT date/time words.
    pub fn write_time(&self) -> (u16, u16) {
        (self.wrt_date, self.wrt_time)
    }

    /// Directory positions of the entry's slots: the leading long-name
    /// slot (when the entry has one) and the terminal 8.3 slot.
    pub fn slot_range(&self) -> (Option<DirPos>, DirPos) {
        (self.lde_start, self.sde_pos)
    }

    /// First sector of the directory holding this entry.
    pub fn parent_first_sec(&self) -> SecNbr {
        self.parent_first_sec
    }

    /// Move the logical position; must stay within the file.
    pub fn pos_set(&mut self, pos: u32) -> Result<()> {
        if pos > self.size {
            return Err(Error::InvalidAccessMode);
        }
        self.pos = pos;
        Ok(())
    }
}

fn mode_validate(mode: Mode) -> Result<()> {
    if mode & (MODE_RD | MODE_WR) == 0 {
        return Err(Error::InvalidAccessMode);
    }
    if mode & (MODE_DIR | MODE_FILE) == 0 {
        return Err(Error::InvalidAccessMode);
    }
    if mode & MODE_TRUNCATE != 0 && (mode & MODE_WR == 0 || mode & MODE_DIR != 0) {
        return Err(Error::InvalidAccessMode);
    }
    if mode & MODE_DEL != 0 && mode & MODE_WR == 0 {
        return Err(Error::InvalidAccessMode);
    }
    // Creation must pick exactly one entry type.
    if mode & (MODE_CREATE | MODE_MUST_CREATE) != 0
        && (mode & MODE_DIR != 0) == (mode & MODE_FILE != 0)
    {
        return Err(Error::InvalidAccessMode);
    }
    Ok(())
}

fn mode_mutates(mode: Mode) -> bool {
    mode & (MODE_WR | MODE_CREATE | MODE_MUST_CREATE | MODE_TRUNCATE | MODE_DEL) != 0
}

fn path_components(path: &str) -> Result<Vec<&str>> {
    if path.is_empty() {
        return Err(Error::NameNull);
    }
    if path.len() > PATH_MAX {
        return Err(Error::PathTooLong);
    }
    Ok(path.split(PATH_SEP).filter(|c| !c.is_empty()).collect())
}

impl FileSystem {
    /// Open, create or delete the entry at `path` according to `mode`.
    ///
    /// - miss + `MODE_CREATE`: the entry is created (`MODE_DIR` or
    ///   `MODE_FILE` picks the type);
    /// - hit + `MODE_MUST_CREATE`: `EntryExists`;
    /// - hit + `MODE_DEL`: the slots are freed and the entry's chain is
    ///   deleted (directories must be empty);
    /// - hit + `MODE_TRUNCATE`: the file shrinks to zero length.
    pub fn entry_find(&mut self, path: &str, mode: Mode) -> Result<EntryData> {
        mode_validate(mode)?;
        if self.cfg.read_only && mode_mutates(mode) {
            return Err(Error::ReadOnlyVol);
        }
        let comps = path_components(path)?;
        if comps.is_empty() {
            if mode & MODE_MUST_CREATE != 0 {
                return Err(Error::EntryExists);
            }
            if mode & (MODE_DEL | MODE_TRUNCATE) != 0 {
                return Err(Error::InvalidAccessMode);
            }
            if mode & MODE_DIR == 0 {
                return Err(Error::EntryNotFile);
            }
            return Ok(self.root_entry_data(mode));
        }
        let name_entry = *comps.last().unwrap_or(&"");
        if matches!(name_entry, "." | "..")
            && mode & (MODE_CREATE | MODE_MUST_CREATE | MODE_DEL | MODE_TRUNCATE) != 0
        {
            return Err(Error::InvalidAccessMode);
        }

        let (parent_sec, parent_clus) = self.resolve_parent(&comps)?;
        match self.dir_entry_find(parent_sec, name_entry)? {
            None => {
                if mode & MODE_CREATE == 0 {
                    return Err(Error::EntryNotFound);
                }
                let attr = if mode & MODE_DIR != 0 {
                    ATTR_DIRECTORY
                } else {
                    ATTR_ARCHIVE
                };
                let f = self.dir_entry_create(parent_sec, parent_clus, name_entry, attr, 0, 0)?;
                let e = self.entry_data_from(&f, parent_sec, mode);
                self.op_commit()?;
                Ok(e)
            }
            Some(f) => {
                if mode & MODE_MUST_CREATE != 0 {
                    return Err(Error::EntryExists);
                }
                let is_dir = f.sde.is_dir();
                if is_dir && mode & MODE_DIR == 0 {
                    return Err(Error::EntryNotFile);
                }
                if !is_dir && mode & MODE_FILE == 0 {
                    return Err(Error::EntryNotDir);
                }
                if f.sde.is_read_only() && mode & (MODE_WR | MODE_DEL | MODE_TRUNCATE) != 0 {
                    return Err(Error::ReadOnlyEntry);
                }
                // The journal's body goes through its own write-through
                // buffer; mutating it through the file path would alias
                // the two. Reads are fine.
                if self.journal_is_open()
                    && parent_sec == self.root_dir_first_sec()
                    && f.sde.name == crate::journal::JOURNAL_SFN_BYTES
                    && mode & (MODE_WR | MODE_DEL | MODE_TRUNCATE) != 0
                {
                    return Err(Error::ReadOnlyEntry);
                }
                let fc = f.sde.first_clus(self.fat_type);
                if fc != FREE_CLUSTER && !self.clus_is_valid(fc) && mode & MODE_DEL == 0 {
                    return Err(Error::EntryCorrupt);
                }

                if mode & MODE_DEL != 0 {
                    if is_dir
                        && fc != FREE_CLUSTER
                        && self.clus_is_valid(fc)
                        && !self.dir_is_empty(self.clus_to_sec(fc))?
                    {
                        return Err(Error::DirNotEmpty);
                    }
                    let e = self.entry_data_from(&f, parent_sec, mode);
                    self.dir_entry_del(f.start, f.end)?;
                    if fc != FREE_CLUSTER && self.clus_is_valid(fc) {
                        self.clus_chain_del(fc, true)?;
                    }
                    self.op_commit()?;
                    return Ok(e);
                }

                let mut e = self.entry_data_from(&f, parent_sec, mode);
                if mode & MODE_TRUNCATE != 0 {
                    self.entry_truncate(&mut e, 0)?;
                }
                if mode & MODE_APPEND != 0 {
                    e.pos = e.size;
                }
                Ok(e)
            }
        }
    }

    /// Shrink an open file to `new_len` bytes, freeing the clusters past
    /// the new end. Truncating to zero frees the whole chain, head
    /// cluster included.
    pub fn entry_truncate(&mut self, e: &mut EntryData, new_len: u32) -> Result<()> {
        if self.cfg.read_only {
            return Err(Error::ReadOnlyVol);
        }
        if e.is_root || e.is_dir() {
            return Err(Error::InvalidAccessMode);
        }
        if e.mode & MODE_WR == 0 {
            return Err(Error::InvalidAccessMode);
        }
        if new_len >= e.size && !(new_len == 0 && e.first_clus != FREE_CLUSTER) {
            return Ok(());
        }
        let ft = self.fat_type;
        let (date, time, _) = clock::now_fields(self.cfg.clock.as_ref());
        self.journal_enter_entry_update(e.sde_pos, e.sde_pos)?;
        if new_len == 0 {
            let old = e.first_clus;
            self.sde_update(e.sde_pos, |sde| {
                sde.file_size = 0;
                sde.set_first_clus(FREE_CLUSTER, ft);
                sde.set_write_time(date, time);
            })?;
            e.first_clus = FREE_CLUSTER;
            e.size = 0;
            e.pos = 0;
            if self.clus_is_valid(old) {
                self.clus_chain_del(old, true)?;
            }
        } else {
            self.sde_update(e.sde_pos, |sde| {
                sde.file_size = new_len;
                sde.set_write_time(date, time);
            })?;
            e.size = new_len;
            if e.pos > new_len {
                e.pos = new_len;
            }
            if self.clus_is_valid(e.first_clus) {
                let keep = self.clus_cnt_of_len(new_len);
                let (last, _, end) = self.clus_chain_follow(e.first_clus, keep - 1)?;
                if matches!(end, ChainEnd::Complete) {
                    self.clus_chain_del(last, false)?;
                }
            }
        }
        self.op_commit()
    }

    /// Rename `old_path` to `new_path`, possibly across directories. When
    /// the target exists it is displaced: its slots take over the source's
    /// attributes, first cluster and size, and its old chain is freed as
    /// the very last write. At every crash point at least one name still
    /// reaches the data.
    pub fn entry_rename(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        if self.cfg.read_only {
            return Err(Error::ReadOnlyVol);
        }
        let old_comps = path_components(old_path)?;
        let new_comps = path_components(new_path)?;
        if old_comps.is_empty() {
            return Err(Error::InvalidAccessMode);
        }
        if new_comps.is_empty() {
            return Err(Error::EntryExists);
        }
        let old_name = *old_comps.last().unwrap_or(&"");
        let new_name = *new_comps.last().unwrap_or(&"");
        if matches!(old_name, "." | "..") || matches!(new_name, "." | "..") {
            return Err(Error::NameInvalid);
        }

        let (old_parent_sec, old_parent_clus) = self.resolve_parent(&old_comps)?;
        let old_f = self
            .dir_entry_find(old_parent_sec, old_name)?
            .ok_or(Error::EntryNotFound)?;
        if old_f.sde.is_read_only() {
            return Err(Error::ReadOnlyEntry);
        }
        if self.journal_is_open()
            && (old_parent_sec == self.root_dir_first_sec()
                && old_f.sde.name == crate::journal::JOURNAL_SFN_BYTES)
        {
            return Err(Error::ReadOnlyEntry);
        }
        let is_dir = old_f.sde.is_dir();
        let old_fc = old_f.sde.first_clus(self.fat_type);
        let old_attr = old_f.sde.attr;
        let old_size = old_f.sde.file_size;

        // A directory cannot move into its own subtree.
        if is_dir
            && new_comps.len() > old_comps.len()
            && old_comps
                .iter()
                .zip(new_comps.iter())
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
        {
            return Err(Error::InvalidAccessMode);
        }

        let (new_parent_sec, new_parent_clus) = self.resolve_parent(&new_comps)?;
        let target = self.dir_entry_find(new_parent_sec, new_name)?;
        let same_entry = target.as_ref().map_or(false, |t| t.end == old_f.end);

        match target.filter(|_| !same_entry) {
            Some(t) => {
                if self.journal_is_open()
                    && new_parent_sec == self.root_dir_first_sec()
                    && t.sde.name == crate::journal::JOURNAL_SFN_BYTES
                {
                    return Err(Error::ReadOnlyEntry);
                }
                if t.sde.is_dir() != is_dir {
                    return Err(if is_dir {
                        Error::EntryNotDir
                    } else {
                        Error::EntryNotFile
                    });
                }
                let t_fc = t.sde.first_clus(self.fat_type);
                if t.sde.is_dir()
                    && self.clus_is_valid(t_fc)
                    && !self.dir_is_empty(self.clus_to_sec(t_fc))?
                {
                    return Err(Error::DirNotEmpty);
                }
                let ft = self.fat_type;
                let (date, time, _) = clock::now_fields(self.cfg.clock.as_ref());
                self.journal_enter_entry_update(t.end, t.end)?;
                self.sde_update(t.end, |sde| {
                    sde.attr = old_attr;
                    sde.set_first_clus(old_fc, ft);
                    sde.file_size = old_size;
                    sde.set_write_time(date, time);
                })?;
                self.dir_entry_del(old_f.start, old_f.end)?;
                if is_dir && old_parent_clus != new_parent_clus && self.clus_is_valid(old_fc) {
                    self.dotdot_update(old_fc, new_parent_clus)?;
                }
                if t_fc != FREE_CLUSTER && self.clus_is_valid(t_fc) {
                    self.clus_chain_del(t_fc, true)?;
                }
            }
            None => {
                self.dir_entry_create(
                    new_parent_sec,
                    new_parent_clus,
                    new_name,
                    old_attr,
                    old_fc,
                    old_size,
                )?;
                self.dir_entry_del(old_f.start, old_f.end)?;
                if is_dir && old_parent_clus != new_parent_clus && self.clus_is_valid(old_fc) {
                    self.dotdot_update(old_fc, new_parent_clus)?;
                }
            }
        }
        self.op_commit()
    }

    /// Read from the current position; returns the byte count, short at
    /// end of file.
    pub fn file_rd(&mut self, e: &mut EntryData, buf: &mut [u8]) -> Result<usize> {
        if e.is_root || e.is_dir() {
            return Err(Error::EntryNotFile);
        }
        if e.mode & MODE_RD == 0 {
            return Err(Error::InvalidAccessMode);
        }
        if e.pos >= e.size || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min((e.size - e.pos) as usize);
        let clus_bytes = self.clus_size_bytes as usize;
        let sec_size = self.sec_size;

        let mut clus = e.first_clus;
        if !self.clus_is_valid(clus) {
            return Err(Error::EntryCorrupt);
        }
        let clus_idx = e.pos as usize / clus_bytes;
        if clus_idx > 0 {
            let (c, cnt, _) = self.clus_chain_follow(clus, clus_idx as u32)?;
            if cnt != clus_idx as u32 {
                return Err(Error::EntryCorrupt);
            }
            clus = c;
        }

        let mut done = 0usize;
        let mut pos = e.pos as usize;
        while done < len {
            let off_in_clus = pos % clus_bytes;
            let sec = self.clus_to_sec(clus) + (off_in_clus / sec_size) as u32;
            let off_in_sec = pos % sec_size;
            let chunk = (sec_size - off_in_sec).min(len - done);
            self.sec_read(sec, SecType::File, |b| {
                buf[done..done + chunk].copy_from_slice(&b[off_in_sec..off_in_sec + chunk]);
            })?;
            done += chunk;
            pos += chunk;
            if done < len && pos % clus_bytes == 0 {
                let (c, cnt, _) = self.clus_chain_follow(clus, 1)?;
                if cnt != 1 {
                    return Err(Error::EntryCorrupt);
                }
                clus = c;
            }
        }
        e.pos += done as u32;
        Ok(done)
    }

    /// Write at the current position (at end of file under `MODE_APPEND`),
    /// growing the chain and the size field as needed.
    pub fn file_wr(&mut self, e: &mut EntryData, buf: &[u8]) -> Result<usize> {
        if self.cfg.read_only {
            return Err(Error::ReadOnlyVol);
        }
        if e.is_root || e.is_dir() {
            return Err(Error::EntryNotFile);
        }
        if e.mode & MODE_WR == 0 {
            return Err(Error::InvalidAccessMode);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if e.mode & MODE_APPEND != 0 {
            e.pos = e.size;
        }
        let end64 = e.pos as u64 + buf.len() as u64;
        if end64 > u32::MAX as u64 {
            return Err(Error::DevFull);
        }
        let end = end64 as u32;
        let ft = self.fat_type;

        // Grow the chain first, then stream the payload, then commit the
        // new size. A crash in between is rewound through the allocation
        // and pre-image records.
        let need = self.clus_cnt_of_len(end);
        if e.first_clus == FREE_CLUSTER {
            let (head, _) = self.clus_chain_alloc(0, need)?;
            self.journal_enter_entry_update(e.sde_pos, e.sde_pos)?;
            self.sde_update(e.sde_pos, |sde| sde.set_first_clus(head, ft))?;
            e.first_clus = head;
        } else {
            if !self.clus_is_valid(e.first_clus) {
                return Err(Error::EntryCorrupt);
            }
            let (tail, cnt, endk) = self.clus_chain_end_find(e.first_clus)?;
            if !matches!(endk, ChainEnd::Eoc) {
                return Err(Error::EntryCorrupt);
            }
            let have = cnt + 1;
            if need > have {
                self.clus_chain_alloc(tail, need - have)?;
            }
        }

        let clus_bytes = self.clus_size_bytes as usize;
        let sec_size = self.sec_size;
        let mut clus = e.first_clus;
        let clus_idx = e.pos as usize / clus_bytes;
        if clus_idx > 0 {
            let (c, cnt, _) = self.clus_chain_follow(clus, clus_idx as u32)?;
            if cnt != clus_idx as u32 {
                return Err(Error::EntryCorrupt);
            }
            clus = c;
        }
        let mut done = 0usize;
        let mut pos = e.pos as usize;
        while done < buf.len() {
            let off_in_clus = pos % clus_bytes;
            let sec = self.clus_to_sec(clus) + (off_in_clus / sec_size) as u32;
            let off_in_sec = pos % sec_size;
            let chunk = (sec_size - off_in_sec).min(buf.len() - done);
            self.sec_modify(sec, SecType::File, |b| {
                b[off_in_sec..off_in_sec + chunk].copy_from_slice(&buf[done..done + chunk]);
            })?;
            done += chunk;
            pos += chunk;
            if done < buf.len() && pos % clus_bytes == 0 {
                let (c, cnt, _) = self.clus_chain_follow(clus, 1)?;
                if cnt != 1 {
                    return Err(Error::EntryCorrupt);
                }
                clus = c;
            }
        }

        let (date, time, _) = clock::now_fields(self.cfg.clock.as_ref());
        self.journal_enter_entry_update(e.sde_pos, e.sde_pos)?;
        self.sde_update(e.sde_pos, |sde| {
            if end > sde.file_size {
                sde.file_size = end;
            }
            sde.set_write_time(date, time);
        })?;
        if end > e.size {
            e.size = end;
        }
        e.pos = end;
        e.wrt_date = date;
        e.wrt_time = time;
        self.op_commit()?;
        Ok(buf.len())
    }

    /// Enumerate an open directory.
    pub fn dir_rd(&mut self, e: &EntryData) -> Result<Vec<DirItem>> {
        if !e.is_dir() {
            return Err(Error::EntryNotDir);
        }
        let sec = self.entry_dir_first_sec(e)?;
        self.dir_list(sec)
    }

    /// First body sector of an open directory.
    pub(crate) fn entry_dir_first_sec(&self, e: &EntryData) -> Result<SecNbr> {
        if e.is_root {
            Ok(self.root_dir_first_sec())
        } else if self.clus_is_valid(e.first_clus) {
            Ok(self.clus_to_sec(e.first_clus))
        } else {
            Err(Error::EntryCorrupt)
        }
    }

    fn root_entry_data(&self, mode: Mode) -> EntryData {
        EntryData {
            name: String::from("\\"),
            sde_pos: DirPos { sec: 0, off: 0 },
            lde_start: None,
            parent_first_sec: self.root_dir_first_sec(),
            attr: ATTR_DIRECTORY,
            first_clus: self.root_clus,
            size: 0,
            pos: 0,
            mode,
            is_root: true,
            wrt_date: 0,
            wrt_time: 0,
        }
    }

    fn entry_data_from(&self, f: &FoundEntry, parent_sec: SecNbr, mode: Mode) -> EntryData {
        EntryData {
            name: f.name.clone(),
            sde_pos: f.end,
            lde_start: if f.start == f.end {
                None
            } else {
                Some(f.start)
            },
            parent_first_sec: parent_sec,
            attr: f.sde.attr,
            first_clus: f.sde.first_clus(self.fat_type),
            size: f.sde.file_size,
            pos: 0,
            mode,
            is_root: false,
            wrt_date: f.sde.wrt_date,
            wrt_time: f.sde.wrt_time,
        }
    }

    /// Resolve every component but the last; returns the parent
    /// directory's first sector and first cluster (0 for the root, which
    /// is also the value `..` entries record).
    fn resolve_parent(&self, comps: &[&str]) -> Result<(SecNbr, ClusNbr)> {
        let mut sec = self.root_dir_first_sec();
        let mut clus = FREE_CLUSTER;
        if comps.is_empty() {
            return Ok((sec, clus));
        }
        for comp in &comps[..comps.len() - 1] {
            let f = self
                .dir_entry_find(sec, comp)?
                .ok_or(Error::ParentNotFound)?;
            if !f.sde.is_dir() {
                return Err(Error::ParentNotDir);
            }
            let fc = f.sde.first_clus(self.fat_type);
            if fc == FREE_CLUSTER {
                // A `..` entry records the root as cluster 0.
                sec = self.root_dir_first_sec();
                clus = FREE_CLUSTER;
            } else if self.clus_is_valid(fc) {
                sec = self.clus_to_sec(fc);
                clus = fc;
            } else {
                return Err(Error::EntryCorrupt);
            }
        }
        Ok((sec, clus))
    }

    /// Overwrite one short entry in place.
    pub(crate) fn sde_update(
        &self,
        pos: DirPos,
        f: impl FnOnce(&mut ShortDirEntry),
    ) -> Result<()> {
        self.sec_modify(pos.sec, SecType::Dir, |b| {
            let off = pos.off as usize;
            let mut sde = ShortDirEntry::load(&b[off..off + DIRENT_SIZE]);
            f(&mut sde);
            sde.store(&mut b[off..off + DIRENT_SIZE]);
        })
    }

    /// Point a moved directory's `..` entry at its new parent.
    fn dotdot_update(&mut self, dir_first_clus: ClusNbr, parent_clus: ClusNbr) -> Result<()> {
        let sec = self.clus_to_sec(dir_first_clus);
        let pos = DirPos {
            sec,
            off: DIRENT_SIZE as u32,
        };
        let raw = self.dir_slot_rd(pos)?;
        let sde = ShortDirEntry::load(&raw);
        if sde.name != DOTDOT_NAME {
            return Ok(());
        }
        self.journal_enter_entry_update(pos, pos)?;
        let ft = self.fat_type;
        self.sde_update(pos, |sde| sde.set_first_clus(parent_clus, ft))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_validation_rejects_contradictions() {
        // neither read nor write
        assert!(mode_validate(MODE_DIR).is_err());
        // neither dir nor file
        assert!(mode_validate(MODE_RD).is_err());
        // truncate on a directory
        assert!(mode_validate(MODE_RD | MODE_WR | MODE_DIR | MODE_TRUNCATE).is_err());
        // truncate without write
        assert!(mode_validate(MODE_RD | MODE_FILE | MODE_TRUNCATE).is_err());
        // delete without write
        assert!(mode_validate(MODE_RD | MODE_FILE | MODE_DEL).is_err());
        // create must pick exactly one type
        assert!(mode_validate(MODE_RD | MODE_WR | MODE_CREATE | MODE_DIR | MODE_FILE).is_err());
        assert!(mode_validate(MODE_RD | MODE_WR | MODE_CREATE | MODE_FILE).is_ok());
        assert!(mode_validate(MODE_RD | MODE_DIR | MODE_FILE).is_ok());
    }

    #[test]
    fn path_split_uses_backslash() {
        let comps = path_components("\\a\\b\\c.txt").unwrap();
        assert_eq!(comps, ["a", "b", "c.txt"]);
        assert!(path_components("").is_err());
        let root: Vec<&str> = path_components("\\").unwrap();
        assert!(root.is_empty());
    }
}
