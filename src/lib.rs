#![no_std]

//! A journaled FAT12/16/32 filesystem engine.
//!
//! The crate translates high-level entry operations (create, open, read,
//! write, truncate, rename, delete, enumerate) into mutations of the on-disk
//! FAT structures, and keeps those mutations crash-consistent through an
//! intent log stored in a hidden file on the volume itself.
//!
//! Layering, leaves first:
//!
//! - [`codec`]: little-endian scalar reads/writes into sector buffers.
//! - [`device`]: the block-device contract (sector read/write/release).
//! - [`cache`]: the sector buffer cache shared by every mounted volume.
//! - [`clock`]: the date/time collaborator.
//! - [`bpb`]: boot sector, FSINFO, FAT type detection, format geometry.
//! - [`fat`]: FAT entry access (12/16/32-bit) and the cluster chain manager.
//! - [`sector`]: the sector walker mapping chains to consecutive sectors.
//! - [`name`]: 8.3 and long-name validation, generation and comparison.
//! - [`entry`]: the 32-byte directory entry codec.
//! - [`dir`]: the directory entry engine (find/create/delete/enumerate).
//! - [`vfs`]: high-level entry operations over an entry descriptor.
//! - [`journal`]: the append-only intent log and its replay.
//! - [`fs`]: the volume facade (mount, format, query, label).
//! - [`chk`]: the read-only volume consistency check.
//!
//! All engine state lives in a [`fs::FileSystem`] value; there is one per
//! mounted volume and no process-wide engine state other than the sector
//! cache pool. A volume is single-writer: callers serialize top-level
//! operations, typically by wrapping the `FileSystem` in a `spin::Mutex`.

extern crate alloc;

pub mod bpb;
pub mod cache;
pub mod chk;
pub mod clock;
pub mod codec;
pub mod device;
pub mod dir;
pub mod entry;
pub mod fat;
pub mod fs;
pub mod journal;
pub mod name;
pub mod sector;
pub mod vfs;

pub use crate::bpb::FatType;
pub use crate::chk::ChkReport;
pub use crate::clock::{Clock, DateTime};
pub use crate::device::{BlockDevice, DeviceErr, SecType};
pub use crate::dir::{DirItem, DirPos};
pub use crate::fs::{FileSystem, FmtCfg, MountCfg, VolInfo};
pub use crate::vfs::EntryData;

/// Boot sector signature, little-endian at byte offsets 510..512.
pub const BOOT_SIG: u16 = 0xAA55;
pub const BOOT_SIG_OFFSET: usize = 510;

/// FSINFO sector signatures (FAT32 only).
pub const LEAD_SIGNATURE: u32 = 0x41615252;
pub const STRUCT_SIGNATURE: u32 = 0x61417272;
pub const TRAIL_SIGNATURE: u32 = 0xAA550000;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
/// The attribute value marking a long-name slot.
pub const ATTR_LONG_NAME: u8 = ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_VOLUME_ID;

/// Size of one directory slot (short entry or long-name companion).
pub const DIRENT_SIZE: usize = 32;

/// First name byte of a deleted slot.
pub const DIR_ENTRY_FREE: u8 = 0xE5;
/// First name byte of a never-used slot; also the logical directory end.
pub const DIR_ENTRY_LAST_AND_FREE: u8 = 0x00;
/// Escape for a real leading 0xE5 (KANJI lead byte) in an 8.3 name.
pub const DIR_ENTRY_KANJI: u8 = 0x05;

/// Mask marking the last long-name slot of a set (in file order).
pub const LAST_LONG_ENTRY: u8 = 0x40;
/// UTF-16 code units carried by one long-name slot.
pub const LONG_NAME_PIECE_LEN: usize = 13;
/// Longest long file name, in UTF-16 code units.
pub const MAX_LFN_LEN: usize = 255;

pub const SPACE: u8 = 0x20;

/// A free FAT entry, in every FAT width.
pub const FREE_CLUSTER: u32 = 0;

/// FAT type thresholds: a volume with `data_clus <= 4084` data clusters is
/// FAT12, with `data_clus <= 65524` FAT16, anything larger FAT32. The type
/// is decided from the cluster count alone, never from the type string in
/// the boot sector.
pub const MAX_DATA_CLUS_FAT12: u32 = 4084;
pub const MAX_DATA_CLUS_FAT16: u32 = 65524;

/// A cluster index, or a raw FAT entry value. The two interconvert on every
/// FAT read (an entry below the EOC range *is* the next cluster index), so
/// they share one representation, as in the on-disk format.
pub type ClusNbr = u32;
/// A sector number, relative to sector 0 of the volume.
pub type SecNbr = u32;

/// Open-mode bit set for [`fs::FileSystem::entry_find`].
pub type Mode = u16;
/// Open for reading.
pub const MODE_RD: Mode = 0x0001;
/// Open for writing.
pub const MODE_WR: Mode = 0x0002;
/// Create the entry if missing.
pub const MODE_CREATE: Mode = 0x0004;
/// Fail if the entry already exists.
pub const MODE_MUST_CREATE: Mode = 0x0008;
/// Shrink the entry to zero length on open; requires `MODE_WR`, illegal
/// with `MODE_DIR`.
pub const MODE_TRUNCATE: Mode = 0x0010;
/// Position writes at the end of the file.
pub const MODE_APPEND: Mode = 0x0020;
/// The operation is a delete; requires `MODE_WR`.
pub const MODE_DEL: Mode = 0x0040;
/// The target may (or, without `MODE_FILE`, must) be a directory.
pub const MODE_DIR: Mode = 0x0080;
/// The target may (or, without `MODE_DIR`, must) be a file.
pub const MODE_FILE: Mode = 0x0100;

/// Longest accepted path, in bytes.
pub const PATH_MAX: usize = 260;

/// Path separator accepted by the entry operations.
pub const PATH_SEP: char = '\\';

use crate::device::DeviceErr as Dev;

/// Engine error. Low-level errors bubble up unchanged; the high-level entry
/// operations map cluster-chain corruption to [`Error::EntryCorrupt`] where
/// a caller cannot act on the distinction, except during delete, where an
/// invalid chain is tolerated to permit cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Null or empty name.
    NameNull,
    /// Name contains an illegal character or exceeds the name limits.
    NameInvalid,
    /// Path longer than [`PATH_MAX`].
    PathTooLong,
    /// The mode bit set is contradictory, or the operation is disabled by
    /// the mount configuration.
    InvalidAccessMode,
    /// Final path component not found.
    EntryNotFound,
    /// An intermediate path component not found.
    ParentNotFound,
    /// An intermediate path component is not a directory.
    ParentNotDir,
    /// Entry exists and `MODE_MUST_CREATE` was given.
    EntryExists,
    /// The target is a directory but the operation requires a file.
    EntryNotFile,
    /// The target is a file but the operation requires a directory.
    EntryNotDir,
    /// Directory delete on a non-empty directory.
    DirNotEmpty,
    /// Fixed root directory region (FAT12/16) exhausted.
    DirFull,
    /// No free cluster on the volume.
    DevFull,
    /// The journal file cannot hold another log record.
    JournalFull,
    /// A cluster number or FAT entry is outside the valid range.
    ClusInvalid,
    /// A cluster chain ended where a valid link was required.
    ClusChainEnd,
    /// A directory entry is inconsistent (bad first cluster, orphan slots).
    EntryCorrupt,
    /// A journal record carries impossible arguments.
    JournalLogInvalid,
    /// Boot sector signature or geometry is invalid.
    BootSecInvalid,
    /// Format parameters produce an out-of-range cluster count.
    FmtInvalid,
    /// The volume is mounted read-only.
    ReadOnlyVol,
    /// The entry carries the read-only attribute.
    ReadOnlyEntry,
    /// Journal operation before the journal was opened.
    JournalNotOpen,
    /// `journal_start` while already started.
    JournalAlreadyStarted,
    /// `journal_stop` while not started.
    JournalNotStarted,
    /// Feature disabled by the mount configuration.
    NotImplemented,
    /// Block device failure.
    DeviceIo(Dev),
}

impl From<Dev> for Error {
    fn from(err: Dev) -> Self {
        Error::DeviceIo(err)
    }
}

pub type Result<T> = core::result::Result<T, Error>;

pub(crate) fn div_ceil_u32(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}
