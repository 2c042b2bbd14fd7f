//! The 32-byte directory slot codec.
//!
//! Special notes about the first byte (`DIR_Name[0]`) of a directory slot:
//!
//! - 0xE5: the slot is free (deleted).
//! - 0x00: the slot is free, and every slot after this one is also free.
//!   The 0 value lets scanning code stop at the logical directory end
//!   instead of visiting every allocated slot.
//! - 0x05: the real first name character is 0xE5 (a valid KANJI lead byte);
//!   the escape keeps such names distinguishable from deleted slots.
//!
//! A set of long-name slots is always physically contiguous with, and
//! immediately precedes, the short slot it belongs to. Slots of one set are
//! numbered from 1 upward in file order; the last member is OR'd with 0x40
//! and is the first one encountered on disk. Every long slot carries the
//! checksum of the short name; a disagreement makes the set an orphan.
//!
//! The short slot remains the single holder of attributes, times, first
//! cluster and size; long slots carry nothing but name text. The
//! first-cluster field is split: high word at offset 20 (FAT32 only; it
//! MUST be written as zero on FAT12/16, and nonzero values found on disk
//! are masked off on read for compatibility with non-conformant writers),
//! low word at offset 26.

use crate::bpb::FatType;
use crate::codec::{get_u16, get_u32, get_u8, set_u16, set_u32, set_u8};
use crate::name;
use crate::{
    ClusNbr, ATTR_DIRECTORY, ATTR_LONG_NAME, ATTR_READ_ONLY, ATTR_VOLUME_ID, DIRENT_SIZE,
    DIR_ENTRY_FREE, DIR_ENTRY_KANJI, DIR_ENTRY_LAST_AND_FREE, LAST_LONG_ENTRY,
    LONG_NAME_PIECE_LEN,
};

use alloc::string::String;

const OFF_NAME: usize = 0;
const OFF_ATTR: usize = 11;
const OFF_NT_RES: usize = 12;
const OFF_CRT_TIME_TENTH: usize = 13;
const OFF_CRT_TIME: usize = 14;
const OFF_CRT_DATE: usize = 16;
const OFF_LST_ACC_DATE: usize = 18;
const OFF_FST_CLUS_HI: usize = 20;
const OFF_WRT_TIME: usize = 22;
const OFF_WRT_DATE: usize = 24;
const OFF_FST_CLUS_LO: usize = 26;
const OFF_FILE_SIZE: usize = 28;

const OFF_LDIR_ORD: usize = 0;
const OFF_LDIR_NAME1: usize = 1;
const OFF_LDIR_ATTR: usize = 11;
const OFF_LDIR_TYPE: usize = 12;
const OFF_LDIR_CHKSUM: usize = 13;
const OFF_LDIR_NAME2: usize = 14;
const OFF_LDIR_FST_CLUS_LO: usize = 26;
const OFF_LDIR_NAME3: usize = 28;

/// A short (8.3) directory entry. `name` is kept in disk form, including
/// the 0x05 escape; display goes through [`ShortDirEntry::name_string`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortDirEntry {
    pub name: [u8; 11],
    pub attr: u8,
    pub nt_res: u8,
    pub crt_time_tenth: u8,
    pub crt_time: u16,
    pub crt_date: u16,
    pub lst_acc_date: u16,
    pub fst_clus_hi: u16,
    pub wrt_time: u16,
    pub wrt_date: u16,
    pub fst_clus_lo: u16,
    pub file_size: u32,
}

impl ShortDirEntry {
    pub fn new(name: [u8; 11], attr: u8, first_clus: ClusNbr, size: u32, fat_type: FatType) -> Self {
        let mut sde = Self {
            name,
            attr,
            nt_res: 0,
            crt_time_tenth: 0,
            crt_time: 0,
            crt_date: 0,
            lst_acc_date: 0,
            fst_clus_hi: 0,
            wrt_time: 0,
            wrt_date: 0,
            fst_clus_lo: 0,
            file_size: size,
        };
        sde.set_first_clus(first_clus, fat_type);
        sde
    }

    pub fn load(buf: &[u8]) -> Self {
        Self {
            name: buf[OFF_NAME..OFF_NAME + 11].try_into().unwrap_or([0; 11]),
            attr: get_u8(buf, OFF_ATTR),
            nt_res: get_u8(buf, OFF_NT_RES),
            crt_time_tenth: get_u8(buf, OFF_CRT_TIME_TENTH),
            crt_time: get_u16(buf, OFF_CRT_TIME),
            crt_date: get_u16(buf, OFF_CRT_DATE),
            lst_acc_date: get_u16(buf, OFF_LST_ACC_DATE),
            fst_clus_hi: get_u16(buf, OFF_FST_CLUS_HI),
            wrt_time: get_u16(buf, OFF_WRT_TIME),
            wrt_date: get_u16(buf, OFF_WRT_DATE),
            fst_clus_lo: get_u16(buf, OFF_FST_CLUS_LO),
            file_size: get_u32(buf, OFF_FILE_SIZE),
        }
    }

    pub fn store(&self, buf: &mut [u8]) {
        buf[..DIRENT_SIZE].fill(0);
        buf[OFF_NAME..OFF_NAME + 11].copy_from_slice(&self.name);
        if buf[OFF_NAME] == DIR_ENTRY_FREE {
            buf[OFF_NAME] = DIR_ENTRY_KANJI;
        }
        set_u8(buf, OFF_ATTR, self.attr);
        set_u8(buf, OFF_NT_RES, self.nt_res);
        set_u8(buf, OFF_CRT_TIME_TENTH, self.crt_time_tenth);
        set_u16(buf, OFF_CRT_TIME, self.crt_time);
        set_u16(buf, OFF_CRT_DATE, self.crt_date);
        set_u16(buf, OFF_LST_ACC_DATE, self.lst_acc_date);
        set_u16(buf, OFF_FST_CLUS_HI, self.fst_clus_hi);
        set_u16(buf, OFF_WRT_TIME, self.wrt_time);
        set_u16(buf, OFF_WRT_DATE, self.wrt_date);
        set_u16(buf, OFF_FST_CLUS_LO, self.fst_clus_lo);
        set_u32(buf, OFF_FILE_SIZE, self.file_size);
    }

    /// First cluster of the entry's chain. The high word is only meaningful
    /// on FAT32; on FAT12/16 a nonzero high word written by a
    /// non-conformant implementation is masked off.
    pub fn first_clus(&self, fat_type: FatType) -> ClusNbr {
        match fat_type {
            FatType::Fat32 => ((self.fst_clus_hi as u32) << 16) | self.fst_clus_lo as u32,
            _ => self.fst_clus_lo as u32,
        }
    }

    /// Set the first cluster; the high word is forced to zero on FAT12/16.
    pub fn set_first_clus(&mut self, clus: ClusNbr, fat_type: FatType) {
        self.fst_clus_lo = (clus & 0xFFFF) as u16;
        self.fst_clus_hi = match fat_type {
            FatType::Fat32 => (clus >> 16) as u16,
            _ => 0,
        };
    }

    pub fn set_times(&mut self, date: u16, time: u16, tenth: u8) {
        self.crt_date = date;
        self.crt_time = time;
        self.crt_time_tenth = tenth;
        self.lst_acc_date = date;
        self.wrt_date = date;
        self.wrt_time = time;
    }

    pub fn set_write_time(&mut self, date: u16, time: u16) {
        self.wrt_date = date;
        self.wrt_time = time;
        self.lst_acc_date = date;
    }

    pub fn is_dir(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    pub fn is_volume_id(&self) -> bool {
        self.attr != ATTR_LONG_NAME && self.attr & ATTR_VOLUME_ID != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.attr & ATTR_READ_ONLY != 0
    }

    pub fn checksum(&self) -> u8 {
        name::checksum(&self.name)
    }

    pub fn name_string(&self) -> String {
        name::sfn_to_string(&self.name)
    }
}

/// A long-name companion slot: 13 UTF-16 code units, a sequence ordinal and
/// the alias checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongDirEntry {
    pub ord: u8,
    pub chksum: u8,
    pub units: [u16; LONG_NAME_PIECE_LEN],
}

impl LongDirEntry {
    pub fn new(ord: u8, chksum: u8, units: [u16; LONG_NAME_PIECE_LEN]) -> Self {
        Self { ord, chksum, units }
    }

    pub fn load(buf: &[u8]) -> Self {
        let mut units = [0u16; LONG_NAME_PIECE_LEN];
        for i in 0..5 {
            units[i] = get_u16(buf, OFF_LDIR_NAME1 + i * 2);
        }
        for i in 0..6 {
            units[5 + i] = get_u16(buf, OFF_LDIR_NAME2 + i * 2);
        }
        for i in 0..2 {
            units[11 + i] = get_u16(buf, OFF_LDIR_NAME3 + i * 2);
        }
        Self {
            ord: get_u8(buf, OFF_LDIR_ORD),
            chksum: get_u8(buf, OFF_LDIR_CHKSUM),
            units,
        }
    }

    pub fn store(&self, buf: &mut [u8]) {
        buf[..DIRENT_SIZE].fill(0);
        set_u8(buf, OFF_LDIR_ORD, self.ord);
        for i in 0..5 {
            set_u16(buf, OFF_LDIR_NAME1 + i * 2, self.units[i]);
        }
        set_u8(buf, OFF_LDIR_ATTR, ATTR_LONG_NAME);
        set_u8(buf, OFF_LDIR_TYPE, 0);
        set_u8(buf, OFF_LDIR_CHKSUM, self.chksum);
        for i in 0..6 {
            set_u16(buf, OFF_LDIR_NAME2 + i * 2, self.units[5 + i]);
        }
        set_u16(buf, OFF_LDIR_FST_CLUS_LO, 0);
        for i in 0..2 {
            set_u16(buf, OFF_LDIR_NAME3 + i * 2, self.units[11 + i]);
        }
    }

    /// True for the slot carrying the last piece of the name (the first
    /// slot of the set on disk).
    pub fn is_last(&self) -> bool {
        self.ord & LAST_LONG_ENTRY != 0
    }

    /// One-based piece index within the set.
    pub fn ord_index(&self) -> u8 {
        self.ord & (LAST_LONG_ENTRY - 1)
    }
}

/// Classification of a raw slot by its first byte and attribute byte.
pub(crate) fn slot_is_end(raw: &[u8]) -> bool {
    raw[0] == DIR_ENTRY_LAST_AND_FREE
}

pub(crate) fn slot_is_deleted(raw: &[u8]) -> bool {
    raw[0] == DIR_ENTRY_FREE
}

pub(crate) fn slot_is_long(raw: &[u8]) -> bool {
    raw[OFF_ATTR] == ATTR_LONG_NAME
}
