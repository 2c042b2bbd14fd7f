//! The journal: an append-only intent log enabling crash recovery.
//!
//! The log lives inside the filesystem itself, in a hidden regular file
//! named `journal.jnl` in the root directory, pre-allocated to a power-of-
//! two size and EOC-terminated. Every record is framed:
//!
//! ```text
//! ENTER_MARK (u16 0x6666) | SIG (u16) | ...body... | ENTER_END_MARK (u16 0xDDDD)
//! ```
//!
//! Four signatures exist:
//!
//! | SIG    | body |
//! |--------|------|
//! | 0x0001 | chain alloc: start_clus u32, is_new u8 |
//! | 0x0002 | chain delete: nbr_markers u32, start_clus u32, del_first u8, markers |
//! | 0x0003 | entry create: start/end slot positions, 4 x u32 |
//! | 0x0004 | entry update: start/end slot positions, then each slot's pre-image |
//!
//! Invariants:
//!
//! - a record reaches the journal before any on-disk mutation it describes;
//! - a record without its end mark is incomplete and ignored on replay;
//! - chain delete is the only operation completed *forward* on replay, and
//!   is the last primitive inside any top-level operation, so reaching its
//!   record during the newest-first scan means everything logged before it
//!   is already committed and the scan stops.
//!
//! The delete record samples every `step`-th cluster of the doomed chain as
//! markers, `step` chosen so the markers fit in the remaining journal
//! space. On replay the markers locate the last intact segment of a
//! half-deleted chain so the deletion can resume there.
//!
//! Journal I/O goes through a dedicated sector buffer, written through to
//! the device immediately, never through the shared cache; pre-images are
//! read through the shared cache so they reflect pending writes.

use alloc::vec;
use alloc::vec::Vec;

use crate::bpb::FatType;
use crate::codec::{get_u16, get_u32, set_u16, set_u32, set_u8};
use crate::device::SecType;
use crate::dir::DirPos;
use crate::fat::ChainEnd;
use crate::fs::FileSystem;
use crate::{
    div_ceil_u32, ClusNbr, Error, Result, SecNbr, ATTR_ARCHIVE, ATTR_HIDDEN, DIRENT_SIZE,
};

/// Name of the journal file, as looked up in the root directory.
pub const JOURNAL_FILE_NAME: &str = "journal.jnl";
/// The stored 8.3 form (no long-name slots are spent on the journal).
const JOURNAL_FILE_SFN: &str = "JOURNAL.JNL";
/// The same name as it sits in the slot's name field.
pub(crate) const JOURNAL_SFN_BYTES: [u8; 11] = *b"JOURNAL JNL";

pub(crate) const MARK_ENTER: u16 = 0x6666;
pub(crate) const MARK_ENTER_END: u16 = 0xDDDD;

pub(crate) const SIG_CLUS_CHAIN_ALLOC: u16 = 0x0001;
pub(crate) const SIG_CLUS_CHAIN_DEL: u16 = 0x0002;
pub(crate) const SIG_ENTRY_CREATE: u16 = 0x0003;
pub(crate) const SIG_ENTRY_UPDATE: u16 = 0x0004;

const LOG_MARK_SIZE: u32 = 2;
const LOG_CLUS_CHAIN_ALLOC_SIZE: usize = 11;
const LOG_CLUS_CHAIN_DEL_HEADER_SIZE: usize = 13;
const LOG_ENTRY_CREATE_SIZE: usize = 22;
const LOG_ENTRY_UPDATE_HEADER_SIZE: usize = 20;

pub(crate) const STATE_OPEN: u8 = 0x01;
pub(crate) const STATE_STARTED: u8 = 0x02;
pub(crate) const STATE_REPLAYING: u8 = 0x04;

/// Per-volume journal state: lifecycle bits, the backing file's chain, and
/// the write cursor.
pub(crate) struct Journal {
    pub(crate) state: u8,
    pub(crate) first_clus: ClusNbr,
    /// File size in bytes; power of two, at least one sector.
    pub(crate) len: u32,
    /// Append cursor.
    pub(crate) pos: u32,
    /// High-water mark of bytes that may be nonzero; bounds the clear.
    hi: u32,
    /// The file's sectors, in file order.
    pub(crate) secs: Vec<SecNbr>,
    /// Dedicated write-through sector buffer.
    buf: Vec<u8>,
    buf_sec_idx: Option<usize>,
}

impl Journal {
    pub(crate) fn new(cfg_len: u32, sec_size: u32) -> Self {
        let mut len = cfg_len.max(sec_size);
        if !len.is_power_of_two() {
            len = len.next_power_of_two();
        }
        Self {
            state: 0,
            first_clus: 0,
            len,
            pos: 0,
            hi: 0,
            secs: Vec::new(),
            buf: Vec::new(),
            buf_sec_idx: None,
        }
    }
}

enum Rec {
    Alloc {
        start: ClusNbr,
        is_new: bool,
    },
    Del {
        start: ClusNbr,
        del_first: bool,
        markers: Vec<ClusNbr>,
    },
    Create {
        start: DirPos,
        end: DirPos,
    },
    Update {
        start: DirPos,
        end: DirPos,
        images: Vec<[u8; DIRENT_SIZE]>,
    },
}

impl FileSystem {
    /// True while records should be emitted: armed, and not replaying.
    pub(crate) fn journal_logging(&self) -> bool {
        self.journal.state & STATE_STARTED != 0 && self.journal.state & STATE_REPLAYING == 0
    }

    pub fn journal_is_open(&self) -> bool {
        self.journal.state & STATE_OPEN != 0
    }

    /// Arm logging. Records are only emitted between `journal_start` and
    /// `journal_stop`.
    pub fn journal_start(&mut self) -> Result<()> {
        if !self.cfg.journal {
            return Err(Error::NotImplemented);
        }
        if self.journal.state & STATE_OPEN == 0 {
            return Err(Error::JournalNotOpen);
        }
        if self.journal.state & STATE_STARTED != 0 {
            return Err(Error::JournalAlreadyStarted);
        }
        self.journal.state |= STATE_STARTED;
        Ok(())
    }

    /// Disarm logging, flushing and clearing first.
    pub fn journal_stop(&mut self) -> Result<()> {
        if self.journal.state & STATE_STARTED == 0 {
            return Err(Error::JournalNotStarted);
        }
        self.vol_sync()?;
        self.journal_clr_reset()?;
        self.journal.state &= !STATE_STARTED;
        Ok(())
    }

    /// End-of-op commit: flush the volume's dirty sectors, then clear the
    /// journal. An operation becomes durable exactly when the clear's first
    /// sector write lands.
    pub(crate) fn op_commit(&mut self) -> Result<()> {
        if self.journal_logging() && self.journal.pos > 0 {
            self.vol_sync()?;
            self.journal_clr_reset()?;
        }
        Ok(())
    }

    /// Locate (or re-create) and verify the journal file, then replay
    /// whatever log survived the previous session. Called during mount.
    pub(crate) fn journal_open(&mut self) -> Result<()> {
        let root_sec = self.root_dir_first_sec();
        let found = self.dir_entry_find(root_sec, JOURNAL_FILE_NAME)?;
        let mut have = false;
        if let Some(f) = found {
            let fc = f.sde.first_clus(self.fat_type);
            let size = f.sde.file_size;
            let mut good = false;
            if size >= self.sec_size as u32 && size.is_power_of_two() && self.clus_is_valid(fc) {
                if let Ok((_, cnt, ChainEnd::Eoc)) = self.clus_chain_end_find(fc) {
                    if cnt + 1 == div_ceil_u32(size, self.clus_size_bytes) {
                        good = true;
                    }
                }
            }
            if good {
                self.journal.first_clus = fc;
                self.journal.len = size;
                have = true;
            } else {
                // Incomplete or damaged journal: discard and start fresh.
                self.dir_entry_del(f.start, f.end)?;
                if self.clus_is_valid(fc) {
                    let _ = self.clus_chain_del(fc, true)?;
                }
            }
        }
        if !have {
            self.journal_file_create()?;
        }
        self.journal_secs_collect()?;
        self.journal.state |= STATE_OPEN;
        self.journal.hi = self.journal.len;

        if have {
            let sec = self.journal.secs[0];
            self.device
                .sec_rd(&mut self.journal.buf, sec, 1, SecType::Mgmt)?;
            self.journal.buf_sec_idx = Some(0);
            if get_u16(&self.journal.buf, 0) == MARK_ENTER {
                self.journal.state |= STATE_REPLAYING;
                let res = self.journal_replay();
                self.journal.state &= !STATE_REPLAYING;
                res?;
            }
        }
        self.vol_sync()?;
        self.journal_clr_reset()?;
        Ok(())
    }

    /// Allocate, zero-fill and name a fresh journal file. The body is
    /// written directly to the device so no shared-cache buffer ever
    /// aliases the journal's own write-through buffer.
    fn journal_file_create(&mut self) -> Result<()> {
        let len = self.journal.len;
        let clus_cnt = div_ceil_u32(len, self.clus_size_bytes);
        let (head, _) = self.clus_chain_alloc(0, clus_cnt)?;

        let zbuf = vec![0u8; self.sec_size];
        let mut left = div_ceil_u32(len, self.sec_size as u32);
        let mut clus = head;
        'zero: loop {
            let first = self.clus_to_sec(clus);
            for i in 0..self.clus_size_sec {
                self.device.sec_wr(&zbuf, first + i, 1, SecType::Mgmt)?;
                left -= 1;
                if left == 0 {
                    break 'zero;
                }
            }
            let next = self.clus_val_rd(clus)?;
            if !self.clus_is_valid(next) {
                break;
            }
            clus = next;
        }

        let root_sec = self.root_dir_first_sec();
        self.dir_entry_create(
            root_sec,
            0,
            JOURNAL_FILE_SFN,
            ATTR_ARCHIVE | ATTR_HIDDEN,
            head,
            len,
        )?;
        self.journal.first_clus = head;
        Ok(())
    }

    fn journal_secs_collect(&mut self) -> Result<()> {
        let need = div_ceil_u32(self.journal.len, self.sec_size as u32) as usize;
        let mut secs = Vec::with_capacity(need);
        let mut clus = self.journal.first_clus;
        'collect: loop {
            let first = self.clus_to_sec(clus);
            for i in 0..self.clus_size_sec {
                secs.push(first + i);
                if secs.len() == need {
                    break 'collect;
                }
            }
            let next = self.clus_val_rd(clus)?;
            if !self.clus_is_valid(next) {
                return Err(Error::EntryCorrupt);
            }
            clus = next;
        }
        self.journal.secs = secs;
        self.journal.buf = vec![0u8; self.sec_size];
        self.journal.buf_sec_idx = None;
        Ok(())
    }

    /// Append raw log bytes, writing each touched sector through
    /// immediately.
    fn journal_wr(&mut self, data: &[u8]) -> Result<()> {
        if self.journal.pos as usize + data.len() > self.journal.len as usize {
            return Err(Error::JournalFull);
        }
        let sec_size = self.sec_size;
        let mut written = 0usize;
        while written < data.len() {
            let pos = self.journal.pos as usize;
            let idx = pos / sec_size;
            let off = pos % sec_size;
            let chunk = (sec_size - off).min(data.len() - written);
            let sec = self.journal.secs[idx];
            if self.journal.buf_sec_idx != Some(idx) {
                self.device
                    .sec_rd(&mut self.journal.buf, sec, 1, SecType::Mgmt)?;
                self.journal.buf_sec_idx = Some(idx);
            }
            self.journal.buf[off..off + chunk].copy_from_slice(&data[written..written + chunk]);
            self.device
                .sec_wr(&self.journal.buf, sec, 1, SecType::Mgmt)?;
            written += chunk;
            self.journal.pos += chunk as u32;
        }
        if self.journal.pos > self.journal.hi {
            self.journal.hi = self.journal.pos;
        }
        Ok(())
    }

    /// Zero the used journal sectors and reset the cursor. The first sector
    /// goes first: once its leading enter mark is gone, a crash during the
    /// rest of the clear still replays as an empty journal.
    pub(crate) fn journal_clr_reset(&mut self) -> Result<()> {
        if self.journal.state & STATE_OPEN == 0 {
            return Ok(());
        }
        let sec_size = self.sec_size as u32;
        let used = div_ceil_u32(self.journal.hi.max(1), sec_size) as usize;
        self.journal.buf.fill(0);
        for idx in 0..used {
            let sec = self.journal.secs[idx];
            self.device
                .sec_wr(&self.journal.buf, sec, 1, SecType::Mgmt)?;
        }
        self.journal.buf_sec_idx = Some(0);
        self.journal.pos = 0;
        self.journal.hi = 0;
        Ok(())
    }

    /// Log an imminent chain allocation or extension at `start_clus`.
    pub(crate) fn journal_enter_clus_chain_alloc(
        &mut self,
        start_clus: ClusNbr,
        is_new: bool,
    ) -> Result<()> {
        if !self.journal_logging() {
            return Ok(());
        }
        let mut log = [0u8; LOG_CLUS_CHAIN_ALLOC_SIZE];
        set_u16(&mut log, 0, MARK_ENTER);
        set_u16(&mut log, 2, SIG_CLUS_CHAIN_ALLOC);
        set_u32(&mut log, 4, start_clus);
        set_u8(&mut log, 8, is_new as u8);
        set_u16(&mut log, 9, MARK_ENTER_END);
        self.journal_wr(&log)
    }

    /// Log an imminent chain deletion, sampling marker clusters along the
    /// chain. Flushes the volume first: replay keeps everything that
    /// precedes a chain-delete record, so it must be on disk.
    pub(crate) fn journal_enter_clus_chain_del(
        &mut self,
        start_clus: ClusNbr,
        chain_len: u32,
        del_first: bool,
    ) -> Result<()> {
        if !self.journal_logging() {
            return Ok(());
        }
        self.vol_sync()?;

        let marker_size: u32 = match self.fat_type {
            FatType::Fat32 => 4,
            _ => 2,
        };
        let fixed = LOG_CLUS_CHAIN_DEL_HEADER_SIZE as u32 + LOG_MARK_SIZE;
        let free = self.journal.len - self.journal.pos;
        if free < fixed + marker_size {
            return Err(Error::JournalFull);
        }
        let cap = (free - fixed) / marker_size;
        let want = chain_len.saturating_sub(1);
        let step = if want == 0 { 1 } else { div_ceil_u32(want, cap) };

        let mut markers: Vec<ClusNbr> = Vec::new();
        let mut cur = start_clus;
        loop {
            let (next, cnt, end) = self.clus_chain_follow(cur, step)?;
            if cnt == 0 {
                break;
            }
            markers.push(next);
            cur = next;
            if !matches!(end, ChainEnd::Complete) {
                break;
            }
        }

        let mut hdr = [0u8; LOG_CLUS_CHAIN_DEL_HEADER_SIZE];
        set_u16(&mut hdr, 0, MARK_ENTER);
        set_u16(&mut hdr, 2, SIG_CLUS_CHAIN_DEL);
        set_u32(&mut hdr, 4, markers.len() as u32);
        set_u32(&mut hdr, 8, start_clus);
        set_u8(&mut hdr, 12, del_first as u8);
        self.journal_wr(&hdr)?;
        for &m in &markers {
            if marker_size == 2 {
                let mut b = [0u8; 2];
                set_u16(&mut b, 0, m as u16);
                self.journal_wr(&b)?;
            } else {
                let mut b = [0u8; 4];
                set_u32(&mut b, 0, m);
                self.journal_wr(&b)?;
            }
        }
        let mut end = [0u8; 2];
        set_u16(&mut end, 0, MARK_ENTER_END);
        self.journal_wr(&end)
    }

    /// Log that the directory slots in `[start, end]` are about to be
    /// allocated.
    pub(crate) fn journal_enter_entry_create(&mut self, start: DirPos, end: DirPos) -> Result<()> {
        if !self.journal_logging() {
            return Ok(());
        }
        let mut log = [0u8; LOG_ENTRY_CREATE_SIZE];
        set_u16(&mut log, 0, MARK_ENTER);
        set_u16(&mut log, 2, SIG_ENTRY_CREATE);
        set_u32(&mut log, 4, start.sec);
        set_u32(&mut log, 8, start.off);
        set_u32(&mut log, 12, end.sec);
        set_u32(&mut log, 16, end.off);
        set_u16(&mut log, 20, MARK_ENTER_END);
        self.journal_wr(&log)
    }

    /// Log the pre-image of every slot in `[start, end]` before they are
    /// mutated or deleted.
    pub(crate) fn journal_enter_entry_update(&mut self, start: DirPos, end: DirPos) -> Result<()> {
        if !self.journal_logging() {
            return Ok(());
        }
        let mut hdr = [0u8; LOG_ENTRY_UPDATE_HEADER_SIZE];
        set_u16(&mut hdr, 0, MARK_ENTER);
        set_u16(&mut hdr, 2, SIG_ENTRY_UPDATE);
        set_u32(&mut hdr, 4, start.sec);
        set_u32(&mut hdr, 8, start.off);
        set_u32(&mut hdr, 12, end.sec);
        set_u32(&mut hdr, 16, end.off);
        self.journal_wr(&hdr)?;
        let mut pos = start;
        loop {
            let raw = self.dir_slot_rd(pos)?;
            self.journal_wr(&raw)?;
            if pos == end {
                break;
            }
            pos = self.dir_pos_next(pos)?;
        }
        let mut endmark = [0u8; 2];
        set_u16(&mut endmark, 0, MARK_ENTER_END);
        self.journal_wr(&endmark)
    }

    fn journal_rd_all(&self) -> Result<Vec<u8>> {
        let sec_size = self.sec_size;
        let n = self.journal.secs.len();
        let mut out = vec![0u8; n * sec_size];
        for (i, &sec) in self.journal.secs.iter().enumerate() {
            self.device
                .sec_rd(&mut out[i * sec_size..(i + 1) * sec_size], sec, 1, SecType::Mgmt)?;
        }
        out.truncate(self.journal.len as usize);
        Ok(out)
    }

    /// Replay the log: records are parsed in write order, then handled
    /// newest first. Alloc, entry-create and entry-update records revert;
    /// a chain-delete record completes forward and ends the scan. A record
    /// missing its end mark, and everything after it, is ignored.
    fn journal_replay(&mut self) -> Result<()> {
        let data = self.journal_rd_all()?;
        let len = data.len();
        let mut recs: Vec<Rec> = Vec::new();
        let mut cur = 0usize;
        'parse: while cur + 4 <= len && get_u16(&data, cur) == MARK_ENTER {
            let sig = get_u16(&data, cur + 2);
            let body = cur + 4;
            match sig {
                SIG_CLUS_CHAIN_ALLOC => {
                    if body + 7 > len || get_u16(&data, body + 5) != MARK_ENTER_END {
                        break 'parse;
                    }
                    recs.push(Rec::Alloc {
                        start: get_u32(&data, body),
                        is_new: data[body + 4] != 0,
                    });
                    cur = body + 7;
                }
                SIG_CLUS_CHAIN_DEL => {
                    if body + 9 > len {
                        break 'parse;
                    }
                    let nbr = get_u32(&data, body) as usize;
                    let start = get_u32(&data, body + 4);
                    let del_first = data[body + 8] != 0;
                    let msize: usize = match self.fat_type {
                        FatType::Fat32 => 4,
                        _ => 2,
                    };
                    // A marker list can never exceed the journal itself.
                    if nbr > len {
                        break 'parse;
                    }
                    let mend = body + 9 + nbr * msize;
                    if mend + 2 > len || get_u16(&data, mend) != MARK_ENTER_END {
                        break 'parse;
                    }
                    let mut markers = Vec::with_capacity(nbr);
                    for i in 0..nbr {
                        let off = body + 9 + i * msize;
                        markers.push(if msize == 2 {
                            get_u16(&data, off) as u32
                        } else {
                            get_u32(&data, off)
                        });
                    }
                    recs.push(Rec::Del {
                        start,
                        del_first,
                        markers,
                    });
                    cur = mend + 2;
                }
                SIG_ENTRY_CREATE => {
                    if body + 18 > len || get_u16(&data, body + 16) != MARK_ENTER_END {
                        break 'parse;
                    }
                    recs.push(Rec::Create {
                        start: DirPos {
                            sec: get_u32(&data, body),
                            off: get_u32(&data, body + 4),
                        },
                        end: DirPos {
                            sec: get_u32(&data, body + 8),
                            off: get_u32(&data, body + 12),
                        },
                    });
                    cur = body + 18;
                }
                SIG_ENTRY_UPDATE => {
                    if body + 16 > len {
                        break 'parse;
                    }
                    let start = DirPos {
                        sec: get_u32(&data, body),
                        off: get_u32(&data, body + 4),
                    };
                    let end = DirPos {
                        sec: get_u32(&data, body + 8),
                        off: get_u32(&data, body + 12),
                    };
                    let mut images: Vec<[u8; DIRENT_SIZE]> = Vec::new();
                    let mut off = body + 16;
                    let mut pos = start;
                    loop {
                        if off + DIRENT_SIZE > len {
                            break 'parse;
                        }
                        let mut img = [0u8; DIRENT_SIZE];
                        img.copy_from_slice(&data[off..off + DIRENT_SIZE]);
                        images.push(img);
                        off += DIRENT_SIZE;
                        if pos == end {
                            break;
                        }
                        pos = match self.dir_pos_next(pos) {
                            Ok(p) => p,
                            Err(_) => break 'parse,
                        };
                    }
                    if off + 2 > len || get_u16(&data, off) != MARK_ENTER_END {
                        break 'parse;
                    }
                    recs.push(Rec::Update { start, end, images });
                    cur = off + 2;
                }
                _ => return Err(Error::JournalLogInvalid),
            }
        }

        for rec in recs.into_iter().rev() {
            match rec {
                Rec::Alloc { start, is_new } => {
                    if !self.clus_is_valid(start) {
                        return Err(Error::JournalLogInvalid);
                    }
                    self.clus_chain_reverse_del(start, is_new)?;
                }
                Rec::Del {
                    start,
                    del_first,
                    markers,
                } => {
                    self.journal_replay_clus_chain_del(start, del_first, &markers)?;
                    break;
                }
                Rec::Create { start, end } => {
                    self.dir_entry_del(start, end)?;
                }
                Rec::Update { start, end, images } => {
                    let mut pos = start;
                    for (i, img) in images.iter().enumerate() {
                        self.dir_slot_wr(pos, img)?;
                        if pos == end {
                            break;
                        }
                        if i + 1 < images.len() {
                            pos = self.dir_pos_next(pos)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Forward-complete a half-done chain deletion: find the last marker
    /// whose FAT entry is still a valid link or EOC, walk backward from it
    /// to the first surviving cluster of the chain, delete forward from
    /// there, then force `start_clus` itself to its final value.
    fn journal_replay_clus_chain_del(
        &mut self,
        start: ClusNbr,
        del_first: bool,
        markers: &[ClusNbr],
    ) -> Result<()> {
        if !self.clus_is_valid(start) {
            return Err(Error::JournalLogInvalid);
        }
        let mut alive: Option<ClusNbr> = None;
        for &m in markers.iter().rev() {
            if !self.clus_is_valid(m) {
                continue;
            }
            let val = self.clus_val_rd(m)?;
            if self.clus_is_valid(val) || self.is_eoc(val) {
                alive = Some(m);
                break;
            }
        }
        if let Some(m) = alive {
            let head = self.clus_chain_reverse_follow(m, start)?;
            if head == start {
                self.clus_chain_del(start, del_first)?;
            } else {
                self.clus_chain_del(head, true)?;
            }
        }
        // The head cluster may still hold a stale value: force it.
        let val = self.clus_val_rd(start)?;
        if del_first {
            if val != crate::FREE_CLUSTER {
                self.clus_val_wr(start, crate::FREE_CLUSTER)?;
            }
        } else if !self.is_eoc(val) {
            self.clus_val_wr(start, self.eoc())?;
        }
        Ok(())
    }
}
