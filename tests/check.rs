//! The volume checker: clean volumes audit clean, seeded corruption is
//! found and classified.

mod common;

use common::RamDisk;
use fat_rs::{
    FileSystem, FmtCfg, MountCfg, MODE_CREATE, MODE_DEL, MODE_DIR, MODE_FILE, MODE_RD, MODE_WR,
};
use std::sync::Arc;

const RW_FILE: u16 = MODE_RD | MODE_WR | MODE_FILE;

fn fat16_vol() -> (Arc<RamDisk>, FileSystem) {
    let dev = RamDisk::new(512, 65536);
    FileSystem::format(dev.as_ref(), &FmtCfg::new(65536)).unwrap();
    let fs = FileSystem::mount(dev.clone(), MountCfg::default()).unwrap();
    (dev, fs)
}

#[test]
fn fresh_volume_audits_clean() {
    let (_dev, fs) = fat16_vol();
    let report = fs.vol_chk().unwrap();
    assert!(report.is_clean(), "fresh volume not clean: {report:?}");
    // Only the journal file is reachable.
    assert_eq!(report.files, 1);
    assert_eq!(report.dirs, 0);
    drop(fs);
}

#[test]
fn volume_stays_clean_through_a_workload() {
    let (_dev, mut fs) = fat16_vol();
    fs.journal_start().unwrap();
    fs.entry_find("\\docs", MODE_RD | MODE_WR | MODE_CREATE | MODE_DIR)
        .unwrap();
    let mut f = fs
        .entry_find("\\docs\\A long report name.txt", RW_FILE | MODE_CREATE)
        .unwrap();
    fs.file_wr(&mut f, &vec![0x42u8; 10_000]).unwrap();
    fs.entry_find("\\docs\\other.bin", RW_FILE | MODE_CREATE)
        .unwrap();
    fs.entry_rename("\\docs\\other.bin", "\\moved.bin").unwrap();
    fs.entry_truncate(&mut f, 100).unwrap();
    fs.entry_find("\\moved.bin", RW_FILE | MODE_DEL).unwrap();
    fs.journal_stop().unwrap();

    let report = fs.vol_chk().unwrap();
    assert!(report.is_clean(), "workload left faults: {report:?}");
    assert_eq!(report.dirs, 1);
    assert_eq!(report.files, 2); // journal + the report file
    let info = fs.vol_query().unwrap();
    // FREE count law: free = data - used - bad.
    assert_eq!(
        report.free_clus,
        info.data_clus - report.used_clus - report.bad_clus
    );
    assert_eq!(report.free_clus, info.free_clus);
    drop(fs);
}

#[test]
fn checker_spots_a_lost_chain() {
    let (dev, mut fs) = fat16_vol();
    let mut f = fs.entry_find("\\x.bin", RW_FILE | MODE_CREATE).unwrap();
    fs.file_wr(&mut f, &vec![1u8; 5000]).unwrap();
    let first = f.first_clus() as usize;
    fs.sync().unwrap();
    drop(fs);

    // Clip the entry's first-cluster field to orphan its chain.
    let mut img = dev.snapshot();
    let g = common::raw_geom(&img);
    let root = (g.rsvd + g.num_fats * g.fat_size) * g.sec_size;
    let mut patched = false;
    for slot in 0..g.root_ent {
        let off = root + slot * 32;
        if img[off] != 0 && img[off] != 0xE5 && img[off + 11] != 0x0F {
            let lo = u16::from_le_bytes([img[off + 26], img[off + 27]]) as usize;
            if lo == first {
                img[off + 26] = 0;
                img[off + 27] = 0;
                img[off + 28] = 0; // size, so 0-cluster file stays plausible
                img[off + 29] = 0;
                img[off + 30] = 0;
                img[off + 31] = 0;
                patched = true;
                break;
            }
        }
    }
    assert!(patched);

    let dev2 = RamDisk::from_image(512, img);
    let fs = FileSystem::mount(dev2, MountCfg::default()).unwrap();
    let report = fs.vol_chk().unwrap();
    assert!(!report.is_clean());
    assert!(report.lost_clus >= 3, "orphaned clusters not counted: {report:?}");
    drop(fs);
}

#[test]
fn checker_spots_cross_linked_entries() {
    let (dev, mut fs) = fat16_vol();
    let mut a = fs.entry_find("\\a.bin", RW_FILE | MODE_CREATE).unwrap();
    fs.file_wr(&mut a, &[1u8; 100]).unwrap();
    let mut b = fs.entry_find("\\b.bin", RW_FILE | MODE_CREATE).unwrap();
    fs.file_wr(&mut b, &[2u8; 100]).unwrap();
    let a_clus = a.first_clus();
    fs.sync().unwrap();
    drop(fs);

    // Point b at a's cluster.
    let mut img = dev.snapshot();
    let g = common::raw_geom(&img);
    let root = (g.rsvd + g.num_fats * g.fat_size) * g.sec_size;
    let mut patched = 0;
    for slot in 0..g.root_ent {
        let off = root + slot * 32;
        if img[off] != 0 && img[off] != 0xE5 && img[off + 11] != 0x0F {
            let lo = u16::from_le_bytes([img[off + 26], img[off + 27]]) as u32;
            if lo == b.first_clus() {
                img[off + 26] = (a_clus & 0xFF) as u8;
                img[off + 27] = (a_clus >> 8) as u8;
                patched += 1;
            }
        }
    }
    assert_eq!(patched, 1);

    let dev2 = RamDisk::from_image(512, img);
    let fs = FileSystem::mount(dev2, MountCfg::default()).unwrap();
    let report = fs.vol_chk().unwrap();
    assert!(report.cross_links >= 1, "cross-link missed: {report:?}");
    // b's old cluster became unreachable as well.
    assert!(report.lost_clus >= 1);
    drop(fs);
}
