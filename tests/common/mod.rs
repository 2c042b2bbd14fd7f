//! Shared harness for the integration tests: RAM-backed block devices, a
//! power-cut wrapper for crash scenarios, and raw-image inspection helpers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use fat_rs::{BlockDevice, DeviceErr, SecType};

pub struct RamDisk {
    sec_size: usize,
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(sec_size: usize, sec_cnt: usize) -> Arc<Self> {
        Arc::new(Self {
            sec_size,
            data: Mutex::new(vec![0u8; sec_size * sec_cnt]),
        })
    }

    pub fn from_image(sec_size: usize, image: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            sec_size,
            data: Mutex::new(image),
        })
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl BlockDevice for RamDisk {
    fn sec_size(&self) -> usize {
        self.sec_size
    }

    fn sec_rd(
        &self,
        buf: &mut [u8],
        lba: u32,
        cnt: u32,
        _sec_type: SecType,
    ) -> Result<(), DeviceErr> {
        let start = lba as usize * self.sec_size;
        let len = cnt as usize * self.sec_size;
        let data = self.data.lock().unwrap();
        if start + len > data.len() {
            return Err(DeviceErr::Io);
        }
        buf[..len].copy_from_slice(&data[start..start + len]);
        Ok(())
    }

    fn sec_wr(&self, buf: &[u8], lba: u32, cnt: u32, _sec_type: SecType) -> Result<(), DeviceErr> {
        let start = lba as usize * self.sec_size;
        let len = cnt as usize * self.sec_size;
        let mut data = self.data.lock().unwrap();
        if start + len > data.len() {
            return Err(DeviceErr::Io);
        }
        data[start..start + len].copy_from_slice(&buf[..len]);
        Ok(())
    }
}

/// Passes reads through and fails every write once the budget runs out,
/// like a power cut: whatever reached the backing store before the cut is
/// the on-disk state the next mount sees.
pub struct PowerCut {
    inner: Arc<RamDisk>,
    writes_left: AtomicI64,
}

impl PowerCut {
    pub fn new(inner: Arc<RamDisk>, budget: i64) -> Arc<Self> {
        Arc::new(Self {
            inner,
            writes_left: AtomicI64::new(budget),
        })
    }

    pub fn set_writes_left(&self, budget: i64) {
        self.writes_left.store(budget, Ordering::SeqCst);
    }
}

impl BlockDevice for PowerCut {
    fn sec_size(&self) -> usize {
        self.inner.sec_size()
    }

    fn sec_rd(
        &self,
        buf: &mut [u8],
        lba: u32,
        cnt: u32,
        sec_type: SecType,
    ) -> Result<(), DeviceErr> {
        self.inner.sec_rd(buf, lba, cnt, sec_type)
    }

    fn sec_wr(&self, buf: &[u8], lba: u32, cnt: u32, sec_type: SecType) -> Result<(), DeviceErr> {
        if self.writes_left.fetch_sub(1, Ordering::SeqCst) <= 0 {
            return Err(DeviceErr::Io);
        }
        self.inner.sec_wr(buf, lba, cnt, sec_type)
    }
}

/// Just enough boot-sector parsing to locate regions in a raw image.
pub struct RawGeom {
    pub sec_size: usize,
    pub rsvd: usize,
    pub num_fats: usize,
    pub fat_size: usize,
    pub spc: usize,
    pub root_ent: usize,
}

fn le16(img: &[u8], off: usize) -> usize {
    u16::from_le_bytes([img[off], img[off + 1]]) as usize
}

fn le32(img: &[u8], off: usize) -> usize {
    u32::from_le_bytes([img[off], img[off + 1], img[off + 2], img[off + 3]]) as usize
}

pub fn raw_geom(img: &[u8]) -> RawGeom {
    let fat_sz16 = le16(img, 22);
    RawGeom {
        sec_size: le16(img, 11),
        rsvd: le16(img, 14),
        num_fats: img[16] as usize,
        fat_size: if fat_sz16 != 0 {
            fat_sz16
        } else {
            le32(img, 36)
        },
        spc: img[13] as usize,
        root_ent: le16(img, 17),
    }
}

/// One FAT copy's bytes from a raw image.
pub fn fat_region<'a>(img: &'a [u8], g: &RawGeom, copy: usize) -> &'a [u8] {
    let start = (g.rsvd + copy * g.fat_size) * g.sec_size;
    &img[start..start + g.fat_size * g.sec_size]
}

/// Both FAT copies must be byte-identical at every sync point.
pub fn assert_fats_mirrored(img: &[u8]) {
    let g = raw_geom(img);
    if g.num_fats == 2 {
        assert_eq!(
            fat_region(img, &g, 0),
            fat_region(img, &g, 1),
            "FAT copies diverged"
        );
    }
}
