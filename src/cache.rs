//! Sector buffer cache.
//!
//! One pool is shared by every mounted volume, keyed by `(volume id,
//! sector)`; a volume id is handed out at mount time so two volumes never
//! alias each other's sectors. Buffers are write-back: a `modify` marks the
//! buffer dirty and the data reaches the device on `sync`, on eviction, or
//! when the buffer is dropped. Top-level operations flush explicitly before
//! clearing the journal, so the write-back window never outlives a log
//! record.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use lru::LruCache;
use spin::{Mutex, RwLock};

use crate::device::{BlockDevice, DeviceErr, SecType};
use crate::SecNbr;

/// Buffers kept before the pool starts evicting.
pub const SEC_CACHE_LIMIT: usize = 64;

pub struct SecBuf {
    data: Vec<u8>,
    sec: SecNbr,
    sec_type: SecType,
    device: Arc<dyn BlockDevice>,
    dirty: bool,
}

impl SecBuf {
    /// Pin a buffer to `sec`, reading its contents unless told otherwise.
    /// Skipping the read is only sound when the caller overwrites the whole
    /// sector.
    fn new(
        device: Arc<dyn BlockDevice>,
        sec: SecNbr,
        sec_type: SecType,
        read: bool,
    ) -> Result<Self, DeviceErr> {
        let mut data = vec![0u8; device.sec_size()];
        if read {
            device.sec_rd(&mut data, sec, 1, sec_type)?;
        }
        Ok(Self {
            data,
            sec,
            sec_type,
            device,
            dirty: !read,
        })
    }

    pub fn read<V>(&self, f: impl FnOnce(&[u8]) -> V) -> V {
        f(&self.data)
    }

    pub fn modify<V>(&mut self, f: impl FnOnce(&mut [u8]) -> V) -> V {
        self.dirty = true;
        f(&mut self.data)
    }

    /// Write the buffer back if dirty.
    pub fn sync(&mut self) -> Result<(), DeviceErr> {
        if self.dirty {
            self.dirty = false;
            self.device.sec_wr(&self.data, self.sec, 1, self.sec_type)?;
        }
        Ok(())
    }

    /// Drop any pending write. Used when the sectors of a freed cluster are
    /// released.
    pub fn discard(&mut self) {
        self.dirty = false;
    }
}

impl Drop for SecBuf {
    fn drop(&mut self) {
        // Nothing to report a failure to here; orderly shutdown goes
        // through FileSystem::sync instead.
        let _ = self.sync();
    }
}

pub struct SecCacheManager {
    lru: LruCache<(u64, SecNbr), Arc<RwLock<SecBuf>>>,
}

impl SecCacheManager {
    pub fn new() -> Self {
        Self {
            lru: LruCache::unbounded(),
        }
    }

    pub fn get(
        &mut self,
        vol_id: u64,
        sec: SecNbr,
        device: Arc<dyn BlockDevice>,
        sec_type: SecType,
        read: bool,
    ) -> Result<Arc<RwLock<SecBuf>>, DeviceErr> {
        if let Some(buf) = self.lru.get(&(vol_id, sec)) {
            return Ok(Arc::clone(buf));
        }
        let buf = Arc::new(RwLock::new(SecBuf::new(device, sec, sec_type, read)?));
        if self.lru.len() >= SEC_CACHE_LIMIT {
            // Evict the least recently used buffer nobody holds; the drop
            // writes it back.
            if let Some((_, lru_buf)) = self.lru.peek_lru() {
                if Arc::strong_count(lru_buf) == 1 {
                    self.lru.pop_lru();
                }
            }
        }
        self.lru.put((vol_id, sec), Arc::clone(&buf));
        Ok(buf)
    }

    /// Flush every dirty buffer belonging to `vol_id`.
    pub fn sync_vol(&mut self, vol_id: u64) -> Result<(), DeviceErr> {
        for ((id, _), buf) in self.lru.iter() {
            if *id == vol_id {
                buf.write().sync()?;
            }
        }
        Ok(())
    }

    /// Drop one sector of `vol_id` without writing it back.
    pub fn discard(&mut self, vol_id: u64, sec: SecNbr) {
        if let Some(buf) = self.lru.pop(&(vol_id, sec)) {
            buf.write().discard();
        }
    }

    /// Drop every buffer of `vol_id` without writing back. Used on unmount
    /// after the final sync.
    pub fn invalidate_vol(&mut self, vol_id: u64) {
        let secs: Vec<SecNbr> = self
            .lru
            .iter()
            .filter(|((id, _), _)| *id == vol_id)
            .map(|((_, sec), _)| *sec)
            .collect();
        for sec in secs {
            if let Some(buf) = self.lru.pop(&(vol_id, sec)) {
                buf.write().discard();
            }
        }
    }
}

lazy_static! {
    static ref SEC_CACHE: Mutex<SecCacheManager> = Mutex::new(SecCacheManager::new());
}

pub fn sec_cache_get(
    vol_id: u64,
    sec: SecNbr,
    device: Arc<dyn BlockDevice>,
    sec_type: SecType,
    read: bool,
) -> Result<Arc<RwLock<SecBuf>>, DeviceErr> {
    SEC_CACHE.lock().get(vol_id, sec, device, sec_type, read)
}

pub fn sec_cache_sync_vol(vol_id: u64) -> Result<(), DeviceErr> {
    SEC_CACHE.lock().sync_vol(vol_id)
}

pub fn sec_cache_discard(vol_id: u64, sec: SecNbr) {
    SEC_CACHE.lock().discard(vol_id, sec);
}

pub fn sec_cache_invalidate_vol(vol_id: u64) {
    SEC_CACHE.lock().invalidate_vol(vol_id);
}
