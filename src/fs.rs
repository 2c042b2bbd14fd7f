//! Volume facade: mount, format, statistics, label, sync.
//!
//! Layout of a mounted volume:
//!
//! ```text
//! boot sector - reserved sectors - FAT #1 - FAT #2 - root dir region - data region
//! ```
//!
//! The root directory region only exists on FAT12/16; a FAT32 root
//! directory is an ordinary cluster chain whose first cluster is named by
//! the BPB. The engine keeps two identical FATs in sync when the volume
//! carries two; reads always go to FAT #1.
//!
//! A `FileSystem` value is one mounted volume. It owns the volume geometry,
//! the free-cluster hint, the query cache and the journal cursor; nothing
//! engine-wide lives outside it except the shared sector buffer pool.

use alloc::sync::Arc;
use alloc::vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::bpb::{sec_per_clus_pick, BiosParamBlock, FatType, FsInfo};
use crate::cache::{sec_cache_get, sec_cache_invalidate_vol, sec_cache_sync_vol};
use crate::clock::{self, Clock};
use crate::device::{BlockDevice, SecType};
use crate::dir::DirPos;
use crate::entry::{self, ShortDirEntry};
use crate::journal::Journal;
use crate::{
    div_ceil_u32, ClusNbr, Error, Result, SecNbr, ATTR_VOLUME_ID, FREE_CLUSTER,
    MAX_DATA_CLUS_FAT12, MAX_DATA_CLUS_FAT16, SPACE,
};

static NEXT_VOL_ID: AtomicU32 = AtomicU32::new(1);

/// Mount-time configuration. Disabled features stay in the API and return
/// `InvalidAccessMode` or `NotImplemented` instead of vanishing.
#[derive(Clone)]
pub struct MountCfg {
    /// Refuse every mutating operation.
    pub read_only: bool,
    /// Open (and if needed create) the journal, and replay it on mount.
    pub journal: bool,
    /// Allow names that need long-name storage.
    pub lfn: bool,
    /// Allow mounting FAT12 volumes.
    pub fat12: bool,
    /// Journal file size in bytes; rounded up to a power of two and to at
    /// least one sector.
    pub journal_len: u32,
    /// Time source for directory entry timestamps; entries get zeroed
    /// date/time fields without one.
    pub clock: Option<Arc<dyn Clock>>,
}

impl Default for MountCfg {
    fn default() -> Self {
        Self {
            read_only: false,
            journal: true,
            lfn: true,
            fat12: true,
            journal_len: 16 * 1024,
            clock: None,
        }
    }
}

/// Format-time configuration.
#[derive(Clone)]
pub struct FmtCfg {
    /// Total sectors of the volume.
    pub total_secs: u32,
    /// FAT width; `None` picks one from the volume size.
    pub fat_type: Option<FatType>,
    /// 1 or 2.
    pub num_fats: u8,
    /// Volume serial number.
    pub vol_id: u32,
}

impl FmtCfg {
    pub fn new(total_secs: u32) -> Self {
        Self {
            total_secs,
            fat_type: None,
            num_fats: 2,
            vol_id: 0,
        }
    }
}

/// Volume statistics returned by [`FileSystem::vol_query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolInfo {
    pub fat_type: FatType,
    pub sec_size: u32,
    pub clus_size_sec: u32,
    pub data_clus: u32,
    pub free_clus: u32,
    pub bad_clus: u32,
    pub used_clus: u32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct QueryCache {
    pub free_cnt: u32,
    pub bad_cnt: u32,
}

pub struct FileSystem {
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) vol_id: u64,
    pub(crate) cfg: MountCfg,
    pub(crate) bpb: BiosParamBlock,
    pub(crate) fat_type: FatType,
    pub(crate) sec_size: usize,
    pub(crate) clus_size_sec: u32,
    pub(crate) clus_size_bytes: u32,
    pub(crate) num_fats: u32,
    pub(crate) fat_start: SecNbr,
    pub(crate) fat_size: u32,
    pub(crate) root_dir_start: SecNbr,
    /// Sectors in the fixed root region; zero on FAT32.
    pub(crate) root_dir_size: u32,
    /// First cluster of the FAT32 root directory; zero on FAT12/16.
    pub(crate) root_clus: ClusNbr,
    pub(crate) data_start: SecNbr,
    /// One past the last valid cluster number.
    pub(crate) max_clus_nbr: ClusNbr,
    /// Free-search hint: next cluster to inspect.
    pub(crate) next_clus_nbr: ClusNbr,
    pub(crate) query_cache: Option<QueryCache>,
    pub(crate) journal: Journal,
}

impl FileSystem {
    /// Mount a volume. Reads and validates the boot sector, derives the FAT
    /// type from the data-cluster count, then opens (creating or replaying
    /// as needed) the journal.
    pub fn mount(device: Arc<dyn BlockDevice>, cfg: MountCfg) -> Result<FileSystem> {
        let sec_size = device.sec_size();
        if !matches!(sec_size, 512 | 1024 | 2048 | 4096) {
            return Err(Error::BootSecInvalid);
        }
        let mut buf = vec![0u8; sec_size];
        device.sec_rd(&mut buf, 0, 1, SecType::Mgmt)?;
        let bpb = BiosParamBlock::parse(&buf)?;
        if bpb.byts_per_sec as usize != sec_size {
            return Err(Error::BootSecInvalid);
        }

        let data_clus = bpb.data_clus_cnt();
        let fat_type = FatType::from_data_clus(data_clus);
        if fat_type == FatType::Fat12 && !cfg.fat12 {
            return Err(Error::NotImplemented);
        }
        if fat_type == FatType::Fat32 && (bpb.root_clus < 2 || bpb.root_clus >= data_clus + 2) {
            return Err(Error::BootSecInvalid);
        }

        // The FSINFO hints are only hints; range-check before trusting.
        let mut next_hint = 2;
        if fat_type == FatType::Fat32 && bpb.fs_info != 0 && (bpb.fs_info as u32) < bpb.rsvd_sec_cnt as u32
        {
            if device
                .sec_rd(&mut buf, bpb.fs_info as u32, 1, SecType::Mgmt)
                .is_ok()
            {
                if let Some(fsi) = FsInfo::parse(&buf) {
                    if fsi.next_free >= 2 && fsi.next_free < data_clus + 2 {
                        next_hint = fsi.next_free;
                    }
                }
            }
        }

        let vol_id = NEXT_VOL_ID.fetch_add(1, Ordering::Relaxed) as u64;
        let journal = Journal::new(cfg.journal_len, sec_size as u32);
        let mut fs = FileSystem {
            device,
            vol_id,
            cfg,
            bpb,
            fat_type,
            sec_size,
            clus_size_sec: bpb.sec_per_clus as u32,
            clus_size_bytes: bpb.sec_per_clus as u32 * sec_size as u32,
            num_fats: bpb.num_fats as u32,
            fat_start: bpb.rsvd_sec_cnt as u32,
            fat_size: bpb.fat_size(),
            root_dir_start: bpb.root_dir_first_sec(),
            root_dir_size: bpb.root_dir_secs(),
            root_clus: if fat_type == FatType::Fat32 {
                bpb.root_clus
            } else {
                0
            },
            data_start: bpb.first_data_sec(),
            max_clus_nbr: data_clus + 2,
            next_clus_nbr: next_hint,
            query_cache: None,
            journal,
        };

        if fs.cfg.journal && !fs.cfg.read_only {
            fs.journal_open()?;
        }
        Ok(fs)
    }

    /// Format a device. The cluster size comes from a per-type table of
    /// (volume size, sectors per cluster) pairs; cluster counts within 16
    /// of the 4084/65524 type boundaries are rejected outright.
    pub fn format(device: &dyn BlockDevice, cfg: &FmtCfg) -> Result<()> {
        let sec_size = device.sec_size();
        if !matches!(sec_size, 512 | 1024 | 2048 | 4096) {
            return Err(Error::FmtInvalid);
        }
        let total = cfg.total_secs;
        if total < 64 {
            return Err(Error::FmtInvalid);
        }
        let fat_type = match cfg.fat_type {
            Some(t) => t,
            None => {
                if total <= 16384 {
                    FatType::Fat12
                } else if total <= 1048576 {
                    FatType::Fat16
                } else {
                    FatType::Fat32
                }
            }
        };
        let spc = sec_per_clus_pick(fat_type, total).ok_or(Error::FmtInvalid)? as u32;
        if spc * sec_size as u32 > 65536 {
            return Err(Error::FmtInvalid);
        }
        let num_fats: u8 = if cfg.num_fats == 1 { 1 } else { 2 };
        let (rsvd, root_ent): (u16, u16) = match fat_type {
            FatType::Fat32 => (32, 0),
            FatType::Fat16 => (1, 512),
            FatType::Fat12 => (1, 224),
        };
        let root_secs = (root_ent as u32 * 32 + sec_size as u32 - 1) / sec_size as u32;

        // The FAT size depends on the cluster count, which depends on the
        // FAT size; a couple of rounds settle it.
        let mut fat_size = 1u32;
        for _ in 0..8 {
            let meta = rsvd as u32 + num_fats as u32 * fat_size + root_secs;
            if total <= meta {
                return Err(Error::FmtInvalid);
            }
            let clus = (total - meta) / spc;
            let need_bytes: u64 = match fat_type {
                FatType::Fat12 => ((clus as u64 + 2) * 3 + 1) / 2,
                FatType::Fat16 => (clus as u64 + 2) * 2,
                FatType::Fat32 => (clus as u64 + 2) * 4,
            };
            let need = ((need_bytes + sec_size as u64 - 1) / sec_size as u64) as u32;
            if need == fat_size {
                break;
            }
            fat_size = need;
        }

        let meta = rsvd as u32 + num_fats as u32 * fat_size + root_secs;
        let data_clus = (total - meta) / spc;
        let in_range = match fat_type {
            FatType::Fat12 => data_clus >= 16 && data_clus + 16 <= MAX_DATA_CLUS_FAT12,
            FatType::Fat16 => {
                data_clus >= MAX_DATA_CLUS_FAT12 + 1 + 16 && data_clus + 16 <= MAX_DATA_CLUS_FAT16
            }
            FatType::Fat32 => data_clus >= MAX_DATA_CLUS_FAT16 + 1 + 16,
        };
        if !in_range {
            return Err(Error::FmtInvalid);
        }

        let tot_sec16: u16 = if fat_type != FatType::Fat32 && total < 0x10000 {
            total as u16
        } else {
            0
        };
        let bpb = BiosParamBlock {
            byts_per_sec: sec_size as u16,
            sec_per_clus: spc as u8,
            rsvd_sec_cnt: rsvd,
            num_fats,
            root_ent_cnt: root_ent,
            tot_sec16,
            media: 0xF8,
            fat_sz16: if fat_type == FatType::Fat32 {
                0
            } else {
                fat_size as u16
            },
            tot_sec32: if tot_sec16 != 0 { 0 } else { total },
            fat_sz32: if fat_type == FatType::Fat32 {
                fat_size
            } else {
                0
            },
            root_clus: if fat_type == FatType::Fat32 { 2 } else { 0 },
            fs_info: if fat_type == FatType::Fat32 { 1 } else { 0 },
            bk_boot_sec: if fat_type == FatType::Fat32 { 6 } else { 0 },
            vol_id: cfg.vol_id,
        };

        let mut buf = vec![0u8; sec_size];
        bpb.store(&mut buf, fat_type);
        device.sec_wr(&buf, 0, 1, SecType::Mgmt)?;
        if fat_type == FatType::Fat32 {
            device.sec_wr(&buf, 6, 1, SecType::Mgmt)?;
            // Cluster 2 goes to the root directory.
            let fsi = FsInfo {
                free_count: data_clus - 1,
                next_free: 3,
            };
            fsi.store(&mut buf);
            device.sec_wr(&buf, 1, 1, SecType::Mgmt)?;
            device.sec_wr(&buf, 7, 1, SecType::Mgmt)?;
        }

        buf.fill(0);
        let fat_start = rsvd as u32;
        for s in 0..num_fats as u32 * fat_size {
            device.sec_wr(&buf, fat_start + s, 1, SecType::Mgmt)?;
        }
        let root_start = fat_start + num_fats as u32 * fat_size;
        for s in 0..root_secs {
            device.sec_wr(&buf, root_start + s, 1, SecType::Dir)?;
        }
        if fat_type == FatType::Fat32 {
            for s in 0..spc {
                device.sec_wr(&buf, root_start + s, 1, SecType::Dir)?;
            }
        }

        // Seed FAT[0] (media byte), FAT[1] (EOC), and on FAT32 the root
        // directory cluster.
        let eoc = fat_type.eoc();
        let fat0 = (eoc & !0xFF) | 0xF8;
        buf.fill(0);
        match fat_type {
            FatType::Fat12 => {
                buf[0] = (fat0 & 0xFF) as u8;
                buf[1] = (((fat0 >> 8) & 0x0F) | ((eoc & 0x0F) << 4)) as u8;
                buf[2] = ((eoc >> 4) & 0xFF) as u8;
            }
            FatType::Fat16 => {
                crate::codec::set_u16(&mut buf, 0, fat0 as u16);
                crate::codec::set_u16(&mut buf, 2, eoc as u16);
            }
            FatType::Fat32 => {
                crate::codec::set_u32(&mut buf, 0, fat0);
                crate::codec::set_u32(&mut buf, 4, eoc);
                crate::codec::set_u32(&mut buf, 8, eoc);
            }
        }
        for copy in 0..num_fats as u32 {
            device.sec_wr(&buf, fat_start + copy * fat_size, 1, SecType::Mgmt)?;
        }
        Ok(())
    }

    pub fn fat_type(&self) -> FatType {
        self.fat_type
    }

    pub fn sec_size(&self) -> usize {
        self.sec_size
    }

    pub fn clus_size_bytes(&self) -> u32 {
        self.clus_size_bytes
    }

    /// First sector of `clus`.
    pub(crate) fn clus_to_sec(&self, clus: ClusNbr) -> SecNbr {
        self.data_start + (clus - 2) * self.clus_size_sec
    }

    /// Cluster owning a data-region sector.
    pub(crate) fn sec_to_clus(&self, sec: SecNbr) -> ClusNbr {
        (sec - self.data_start) / self.clus_size_sec + 2
    }

    /// Whether `sec` lies in the fixed root directory region (FAT12/16).
    pub(crate) fn is_root_region_sec(&self, sec: SecNbr) -> bool {
        self.root_dir_size != 0
            && sec >= self.root_dir_start
            && sec < self.root_dir_start + self.root_dir_size
    }

    /// First sector of the root directory.
    pub fn root_dir_first_sec(&self) -> SecNbr {
        match self.fat_type {
            FatType::Fat32 => self.clus_to_sec(self.root_clus),
            _ => self.root_dir_start,
        }
    }

    pub(crate) fn sec_read<V>(
        &self,
        sec: SecNbr,
        sec_type: SecType,
        f: impl FnOnce(&[u8]) -> V,
    ) -> Result<V> {
        let buf = sec_cache_get(self.vol_id, sec, Arc::clone(&self.device), sec_type, true)?;
        let guard = buf.read();
        Ok(guard.read(f))
    }

    pub(crate) fn sec_modify<V>(
        &self,
        sec: SecNbr,
        sec_type: SecType,
        f: impl FnOnce(&mut [u8]) -> V,
    ) -> Result<V> {
        let buf = sec_cache_get(self.vol_id, sec, Arc::clone(&self.device), sec_type, true)?;
        let mut guard = buf.write();
        Ok(guard.modify(f))
    }

    /// Zero a whole sector without reading it first.
    pub(crate) fn sec_zero(&self, sec: SecNbr, sec_type: SecType) -> Result<()> {
        let buf = sec_cache_get(self.vol_id, sec, Arc::clone(&self.device), sec_type, false)?;
        let mut guard = buf.write();
        guard.modify(|b| b.fill(0));
        Ok(())
    }

    /// Flush every dirty sector of this volume.
    pub(crate) fn vol_sync(&self) -> Result<()> {
        sec_cache_sync_vol(self.vol_id)?;
        Ok(())
    }

    /// Flush dirty sectors and, on FAT32, write the FSINFO hints back.
    pub fn sync(&mut self) -> Result<()> {
        if self.fat_type == FatType::Fat32 && self.bpb.fs_info != 0 && !self.cfg.read_only {
            let fsi = FsInfo {
                free_count: self
                    .query_cache
                    .map(|q| q.free_cnt)
                    .unwrap_or(0xFFFF_FFFF),
                next_free: self.next_clus_nbr,
            };
            self.sec_modify(self.bpb.fs_info as u32, SecType::Mgmt, |b| fsi.store(b))?;
        }
        self.vol_sync()
    }

    /// Flush and unmount.
    pub fn close(mut self) -> Result<()> {
        self.sync()
    }

    /// Free/bad cluster counts. The full FAT scan runs once; the chain
    /// manager keeps the cached counts current afterwards.
    pub fn vol_query(&mut self) -> Result<VolInfo> {
        if self.query_cache.is_none() {
            let mut free = 0u32;
            let mut bad = 0u32;
            for clus in 2..self.max_clus_nbr {
                let val = self.clus_val_rd(clus)?;
                if val == FREE_CLUSTER {
                    free += 1;
                } else if self.is_bad(val) {
                    bad += 1;
                }
            }
            self.query_cache = Some(QueryCache {
                free_cnt: free,
                bad_cnt: bad,
            });
        }
        let q = self.query_cache.unwrap_or(QueryCache {
            free_cnt: 0,
            bad_cnt: 0,
        });
        let data_clus = self.max_clus_nbr - 2;
        Ok(VolInfo {
            fat_type: self.fat_type,
            sec_size: self.sec_size as u32,
            clus_size_sec: self.clus_size_sec,
            data_clus,
            free_clus: q.free_cnt,
            bad_clus: q.bad_cnt,
            used_clus: data_clus - q.free_cnt - q.bad_cnt,
        })
    }

    /// Raw FAT entry of `clus`, masked to the FAT width. Volume-check aid:
    /// lets a checker walk chains and audit free counts without raw sector
    /// access.
    pub fn fat_entry(&self, clus: ClusNbr) -> Result<u32> {
        self.clus_val_rd(clus)
    }

    /// The volume label, or `NO NAME` when none is set.
    pub fn label_get(&mut self) -> Result<[u8; 11]> {
        match self.label_slot_find()? {
            Some((_, name)) => Ok(name),
            None => Ok(*b"NO NAME    "),
        }
    }

    /// Set the volume label, creating the label slot when absent. The label
    /// slot carries the VOLUME_ID attribute and never has long-name
    /// companions.
    pub fn label_set(&mut self, label: &str) -> Result<()> {
        if self.cfg.read_only {
            return Err(Error::ReadOnlyVol);
        }
        let bytes = label.as_bytes();
        if bytes.is_empty() || bytes.len() > 11 {
            return Err(Error::NameInvalid);
        }
        let mut name = [SPACE; 11];
        for (i, &b) in bytes.iter().enumerate() {
            if b < SPACE {
                return Err(Error::NameInvalid);
            }
            name[i] = b.to_ascii_uppercase();
        }
        match self.label_slot_find()? {
            Some((pos, _)) => {
                self.journal_enter_entry_update(pos, pos)?;
                self.sec_modify(pos.sec, SecType::Dir, |b| {
                    let off = pos.off as usize;
                    b[off..off + 11].copy_from_slice(&name);
                })?;
            }
            None => {
                let (start, end) = self.dir_free_run_find(self.root_dir_first_sec(), 1)?;
                let (date, time, _) = clock::now_fields(self.cfg.clock.as_ref());
                let mut sde = ShortDirEntry::new(name, ATTR_VOLUME_ID, 0, 0, self.fat_type);
                sde.set_write_time(date, time);
                self.journal_enter_entry_create(start, end)?;
                let mut raw = [0u8; crate::DIRENT_SIZE];
                sde.store(&mut raw);
                self.dir_slot_wr(start, &raw)?;
            }
        }
        self.op_commit()
    }

    fn label_slot_find(&mut self) -> Result<Option<(DirPos, [u8; 11])>> {
        let mut pos = DirPos {
            sec: self.root_dir_first_sec(),
            off: 0,
        };
        loop {
            let raw = self.dir_slot_rd(pos)?;
            if entry::slot_is_end(&raw) {
                return Ok(None);
            }
            if !entry::slot_is_deleted(&raw) && !entry::slot_is_long(&raw) {
                let sde = ShortDirEntry::load(&raw);
                if sde.is_volume_id() {
                    return Ok(Some((pos, sde.name)));
                }
            }
            pos = match self.dir_pos_next(pos) {
                Ok(p) => p,
                Err(Error::DirFull) | Err(Error::ClusChainEnd) => return Ok(None),
                Err(e) => return Err(e),
            };
        }
    }

    /// Clusters a file of `len` bytes occupies.
    pub(crate) fn clus_cnt_of_len(&self, len: u32) -> u32 {
        if len == 0 {
            0
        } else {
            div_ceil_u32(len, self.clus_size_bytes)
        }
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        // Best effort: orderly shutdown goes through close()/sync().
        let _ = sec_cache_sync_vol(self.vol_id);
        sec_cache_invalidate_vol(self.vol_id);
    }
}
