//! Block device interface.
//!
//! The engine never touches storage except through this trait. A write MUST
//! be persistent by the time `sec_wr` returns, or the journal's
//! crash-consistency guarantees are void; retry of transient media errors is
//! the device driver's job, never the engine's.

use core::result::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErr {
    /// Read or write failed.
    Io,
    /// Device is gone.
    Absent,
    /// Device did not answer in time.
    Timeout,
}

/// What the engine is writing; lets the collaborator route the access, e.g.
/// to a wear-leveling translation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecType {
    /// Boot sector, FSINFO, FAT, journal.
    Mgmt,
    /// Directory slots.
    Dir,
    /// File payload.
    File,
}

pub trait BlockDevice: Send + Sync {
    /// Sector size in bytes; one of 512, 1024, 2048 or 4096.
    fn sec_size(&self) -> usize;

    /// Read `cnt` consecutive sectors starting at `lba` into `buf`.
    fn sec_rd(&self, buf: &mut [u8], lba: u32, cnt: u32, sec_type: SecType)
        -> Result<(), DeviceErr>;

    /// Write `cnt` consecutive sectors starting at `lba` from `buf`.
    fn sec_wr(&self, buf: &[u8], lba: u32, cnt: u32, sec_type: SecType) -> Result<(), DeviceErr>;

    /// Hint that the engine no longer needs this sector range. Issued when
    /// clusters are freed, for discard-capable devices.
    fn sec_release(&self, _lba: u32, _cnt: u32) -> Result<(), DeviceErr> {
        Ok(())
    }
}
