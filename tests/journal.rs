//! Journal behavior: arming, clearing, re-creation after corruption, and
//! crash recovery swept across power-cut points during allocation, delete
//! and rename.

mod common;

use common::{PowerCut, RamDisk};
use fat_rs::{
    Error, FatType, FileSystem, FmtCfg, MountCfg, MODE_CREATE, MODE_DEL, MODE_FILE, MODE_RD,
    MODE_WR,
};
use std::sync::Arc;

const RW_FILE: u16 = MODE_RD | MODE_WR | MODE_FILE;
const RW_DIR: u16 = MODE_RD | MODE_WR | fat_rs::MODE_DIR;

fn mount(dev: Arc<RamDisk>) -> FileSystem {
    FileSystem::mount(dev, MountCfg::default()).unwrap()
}

/// Format a small FAT12 volume and give its journal a first mount.
fn fat12_base(total: u32) -> Vec<u8> {
    let dev = RamDisk::new(512, total as usize);
    FileSystem::format(dev.as_ref(), &FmtCfg::new(total)).unwrap();
    mount(dev.clone()).close().unwrap();
    dev.snapshot()
}

/// Walk a chain through the public FAT accessor; returns its length and
/// requires EOC termination.
fn chain_len(fs: &FileSystem, first: u32) -> u32 {
    let mut clus = first;
    let mut cnt = 1;
    loop {
        let v = fs.fat_entry(clus).unwrap();
        if v >= fs.fat_type().eoc_min() {
            return cnt;
        }
        assert!(v >= 2, "chain of cluster {clus} hit invalid entry {v:#x}");
        clus = v;
        cnt += 1;
    }
}

#[test]
fn journal_file_is_hidden_but_reachable() {
    let base = fat12_base(2880);
    let dev = RamDisk::from_image(512, base);
    let mut fs = mount(dev);
    let e = fs.entry_find("\\journal.jnl", MODE_RD | MODE_FILE).unwrap();
    assert_eq!(e.size(), 16 * 1024);
    assert_ne!(e.attr() & fat_rs::ATTR_HIDDEN, 0);
    // The root listing shows it under its stored 8.3 name.
    let root = fs.entry_find("\\", MODE_RD | fat_rs::MODE_DIR).unwrap();
    let items = fs.dir_rd(&root).unwrap();
    assert!(items.iter().any(|i| i.name == "JOURNAL.JNL"));
    drop(fs);
}

#[test]
fn journal_is_clear_after_each_operation() {
    let base = fat12_base(2880);
    let dev = RamDisk::from_image(512, base);
    let mut fs = mount(dev);
    fs.journal_start().unwrap();
    let mut e = fs.entry_find("\\work.bin", RW_FILE | MODE_CREATE).unwrap();
    fs.file_wr(&mut e, &[0xAAu8; 4096]).unwrap();
    fs.entry_find("\\work.bin", RW_FILE | MODE_DEL).unwrap();
    fs.journal_stop().unwrap();

    // The journal body is an ordinary (hidden) file; after the ops it
    // must be all zeroes.
    let mut j = fs.entry_find("\\journal.jnl", MODE_RD | MODE_FILE).unwrap();
    let mut body = vec![0u8; j.size() as usize];
    fs.file_rd(&mut j, &mut body).unwrap();
    assert!(body.iter().all(|&b| b == 0));
    drop(fs);
}

#[test]
fn journal_start_stop_state_machine() {
    let base = fat12_base(2880);
    let dev = RamDisk::from_image(512, base);
    let mut fs = mount(dev);
    assert!(fs.journal_is_open());
    assert_eq!(fs.journal_stop().err(), Some(Error::JournalNotStarted));
    fs.journal_start().unwrap();
    assert_eq!(fs.journal_start().err(), Some(Error::JournalAlreadyStarted));
    fs.journal_stop().unwrap();
    drop(fs);

    // With the journal disabled, start is not available.
    let dev = RamDisk::new(512, 2880);
    FileSystem::format(dev.as_ref(), &FmtCfg::new(2880)).unwrap();
    let cfg = MountCfg {
        journal: false,
        ..MountCfg::default()
    };
    let mut fs = FileSystem::mount(dev, cfg).unwrap();
    assert!(!fs.journal_is_open());
    assert_eq!(fs.journal_start().err(), Some(Error::NotImplemented));
    drop(fs);
}

#[test]
fn damaged_journal_is_recreated_on_mount() {
    let base = fat12_base(2880);
    // Break the journal's chain: free its first cluster in both FATs.
    let dev = RamDisk::from_image(512, base);
    {
        let mut fs = mount(dev.clone());
        let e = fs.entry_find("\\journal.jnl", MODE_RD | MODE_FILE).unwrap();
        let first = e.first_clus() as usize;
        drop(fs);
        let mut img = dev.snapshot();
        let g = common::raw_geom(&img);
        for copy in 0..g.num_fats {
            let off = (g.rsvd + copy * g.fat_size) * g.sec_size + first + first / 2;
            // FAT12 entry, first cluster is even or odd depending on layout
            if first % 2 == 0 {
                img[off] = 0;
                img[off + 1] &= 0xF0;
            } else {
                img[off] &= 0x0F;
                img[off + 1] = 0;
            }
        }
        let dev2 = RamDisk::from_image(512, img);
        // Mount must notice the truncated chain and build a fresh journal.
        let mut fs = mount(dev2);
        let e = fs.entry_find("\\journal.jnl", MODE_RD | MODE_FILE).unwrap();
        assert_eq!(e.size(), 16 * 1024);
        assert_eq!(chain_len(&fs, e.first_clus()), 16 * 1024 / fs.clus_size_bytes());
        // And the volume stays usable.
        fs.journal_start().unwrap();
        fs.entry_find("\\alive.txt", RW_FILE | MODE_CREATE).unwrap();
        drop(fs);
    }
}

#[test]
fn crash_during_allocation_recovers() {
    // S3: begin writing into a fresh file and cut the power at assorted
    // points. After replay the file either does not exist or exists with
    // a chain exactly matching its size, and no cluster leaks.
    let base = fat12_base(2880);
    let base_free = {
        let mut fs = mount(RamDisk::from_image(512, base.clone()));
        fs.vol_query().unwrap().free_clus
    };
    let payload = vec![0x5Au8; 30 * 1024];

    for budget in [0i64, 1, 2, 3, 4, 6, 9, 14, 22, 35, 60, 90, 140, 400] {
        let ram = RamDisk::from_image(512, base.clone());
        let cut = PowerCut::new(ram.clone(), i64::MAX);
        let mut fs = FileSystem::mount(cut.clone(), MountCfg::default()).unwrap();
        fs.journal_start().unwrap();
        cut.set_writes_left(budget);
        let _ = (|| -> Result<(), Error> {
            let mut e = fs.entry_find("\\big.bin", RW_FILE | MODE_CREATE)?;
            fs.file_wr(&mut e, &payload)?;
            Ok(())
        })();
        drop(fs);

        // Power restored.
        let dev = RamDisk::from_image(512, ram.snapshot());
        let mut fs = mount(dev);
        let report = fs.vol_chk().unwrap();
        assert!(report.is_clean(), "budget {budget}: {report:?}");
        let free = fs.vol_query().unwrap().free_clus;
        match fs.entry_find("\\big.bin", MODE_RD | MODE_FILE) {
            Err(Error::EntryNotFound) => {
                assert_eq!(free, base_free, "budget {budget}: clusters leaked");
            }
            Ok(e) => {
                let cb = fs.clus_size_bytes();
                let expect = (e.size() + cb - 1) / cb;
                if e.size() == 0 {
                    assert_eq!(e.first_clus(), 0, "budget {budget}");
                } else {
                    assert_eq!(chain_len(&fs, e.first_clus()), expect, "budget {budget}");
                }
                assert_eq!(free, base_free - expect, "budget {budget}");
            }
            Err(other) => panic!("budget {budget}: unexpected error {other:?}"),
        }
        drop(fs);
    }
}

#[test]
fn crash_during_delete_completes_forward() {
    // S4: cut the power inside a journaled delete. After replay either
    // the file is fully intact or it is gone with every cluster freed;
    // a half-freed chain must never survive.
    let base = {
        let dev = RamDisk::from_image(512, fat12_base(2880));
        let mut fs = mount(dev.clone());
        let mut e = fs.entry_find("\\doom.bin", RW_FILE | MODE_CREATE).unwrap();
        let payload = vec![0xC3u8; 100 * 1024];
        fs.file_wr(&mut e, &payload).unwrap();
        fs.close().unwrap();
        dev.snapshot()
    };
    let (base_free, file_clus) = {
        let mut fs = mount(RamDisk::from_image(512, base.clone()));
        let e = fs.entry_find("\\doom.bin", MODE_RD | MODE_FILE).unwrap();
        let n = chain_len(&fs, e.first_clus());
        assert_eq!(n, 100 * 1024 / fs.clus_size_bytes());
        (fs.vol_query().unwrap().free_clus, n)
    };

    let mut budget = 0i64;
    while budget < 320 {
        let ram = RamDisk::from_image(512, base.clone());
        let cut = PowerCut::new(ram.clone(), i64::MAX);
        let mut fs = FileSystem::mount(cut.clone(), MountCfg::default()).unwrap();
        fs.journal_start().unwrap();
        cut.set_writes_left(budget);
        let _ = fs.entry_find("\\doom.bin", RW_FILE | MODE_DEL);
        drop(fs);

        let dev = RamDisk::from_image(512, ram.snapshot());
        let mut fs = mount(dev);
        let report = fs.vol_chk().unwrap();
        assert!(report.is_clean(), "budget {budget}: {report:?}");
        let free = fs.vol_query().unwrap().free_clus;
        match fs.entry_find("\\doom.bin", MODE_RD | MODE_FILE) {
            Ok(e) => {
                assert_eq!(e.size(), 100 * 1024, "budget {budget}");
                assert_eq!(chain_len(&fs, e.first_clus()), file_clus, "budget {budget}");
                assert_eq!(free, base_free, "budget {budget}");
            }
            Err(Error::EntryNotFound) => {
                assert_eq!(free, base_free + file_clus, "budget {budget}: delete did not complete");
            }
            Err(other) => panic!("budget {budget}: unexpected error {other:?}"),
        }
        drop(fs);
        budget += 11;
    }
}

#[test]
fn crash_during_rename_keeps_one_name() {
    // S5: at every crash point at least one of the two names reaches the
    // data; after replay exactly one of them exists.
    let base = {
        let dev = RamDisk::from_image(512, fat12_base(2880));
        let mut fs = mount(dev.clone());
        fs.entry_find("\\a", RW_DIR | MODE_CREATE).unwrap();
        fs.entry_find("\\b", RW_DIR | MODE_CREATE).unwrap();
        let mut f = fs.entry_find("\\a\\file.bin", RW_FILE | MODE_CREATE).unwrap();
        fs.file_wr(&mut f, b"survives the move").unwrap();
        fs.close().unwrap();
        dev.snapshot()
    };
    let base_free = {
        let mut fs = mount(RamDisk::from_image(512, base.clone()));
        fs.vol_query().unwrap().free_clus
    };

    for budget in [0i64, 1, 2, 3, 4, 5, 6, 8, 10, 13, 17, 25, 40, 80] {
        let ram = RamDisk::from_image(512, base.clone());
        let cut = PowerCut::new(ram.clone(), i64::MAX);
        let mut fs = FileSystem::mount(cut.clone(), MountCfg::default()).unwrap();
        fs.journal_start().unwrap();
        cut.set_writes_left(budget);
        let _ = fs.entry_rename("\\a\\file.bin", "\\b\\file.bin");
        drop(fs);

        let dev = RamDisk::from_image(512, ram.snapshot());
        let mut fs = mount(dev);
        let report = fs.vol_chk().unwrap();
        assert!(report.is_clean(), "budget {budget}: {report:?}");
        let in_a = fs.entry_find("\\a\\file.bin", MODE_RD | MODE_FILE).is_ok();
        let in_b = fs.entry_find("\\b\\file.bin", MODE_RD | MODE_FILE).is_ok();
        assert!(
            in_a ^ in_b,
            "budget {budget}: expected exactly one name, got a={in_a} b={in_b}"
        );
        let path = if in_a { "\\a\\file.bin" } else { "\\b\\file.bin" };
        let mut e = fs.entry_find(path, MODE_RD | MODE_FILE).unwrap();
        let mut buf = vec![0u8; e.size() as usize];
        fs.file_rd(&mut e, &mut buf).unwrap();
        assert_eq!(&buf, b"survives the move", "budget {budget}");
        assert_eq!(fs.vol_query().unwrap().free_clus, base_free, "budget {budget}");
        drop(fs);
    }
}

#[test]
fn fat12_boundary_clusters_skipped_while_journaling() {
    // S6: while the journal is armed, the allocator must refuse FAT12
    // clusters whose 1.5-byte entry straddles a sector boundary; filling
    // the volume leaves exactly those clusters free.
    let dev = RamDisk::new(512, 16000);
    let mut cfg = FmtCfg::new(16000);
    cfg.fat_type = Some(FatType::Fat12);
    FileSystem::format(dev.as_ref(), &cfg).unwrap();
    let mut fs = mount(dev.clone());
    let info = fs.vol_query().unwrap();
    let max_clus = info.data_clus + 2;

    let straddlers: Vec<u32> = (2..max_clus)
        .filter(|c| (c + c / 2) % 512 == 511)
        .collect();
    assert!(!straddlers.is_empty());

    fs.journal_start().unwrap();
    let mut e = fs.entry_find("\\fill.bin", RW_FILE | MODE_CREATE).unwrap();
    let chunk = vec![0x11u8; 64 * 1024];
    loop {
        match fs.file_wr(&mut e, &chunk) {
            Ok(_) => (),
            Err(Error::DevFull) => {
                if chunk.len() > fs.clus_size_bytes() as usize {
                    // retry with single-cluster writes to squeeze the tail
                    let one = vec![0x22u8; fs.clus_size_bytes() as usize];
                    while fs.file_wr(&mut e, &one).is_ok() {}
                    break;
                }
                break;
            }
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }

    let free = fs.vol_query().unwrap().free_clus;
    assert_eq!(free as usize, straddlers.len());
    for &c in &straddlers {
        assert_eq!(fs.fat_entry(c).unwrap(), 0, "straddling cluster {c} was allocated");
    }
    fs.journal_stop().unwrap();
    drop(fs);
}

#[test]
fn replay_is_idempotent_for_a_committed_state() {
    // Mount-replay-clear twice over the same healthy image must change
    // nothing the second time.
    let base = fat12_base(2880);
    let dev = RamDisk::from_image(512, base);
    mount(dev.clone()).close().unwrap();
    let once = dev.snapshot();
    mount(dev.clone()).close().unwrap();
    assert_eq!(once, dev.snapshot());
}
