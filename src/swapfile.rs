//! C5: swap-file manager. Tracks free space inside each swap file as a
//! chain of 64-bit slot bitmaps (mirrors `vm_file_t` in the original source).
//!
//! The original backs each slot *page* with a recursively-obtained VMP
//! frame (the pool opens one of its own handles to hold the bitmap bytes).
//! This crate keeps the bitmap bookkeeping itself as ordinary heap memory
//! instead of re-entering the pool: the observable behavior (which on-disk
//! pages are free, allocation/free order) is identical, and it avoids a
//! real self-referential borrow of `Pool` from inside its own bootstrap.
//! Slot pages remain a conceptual grouping (`slots_per_slot_page` slots
//! each) purely for the diagnostics surfaced by [`SwapFile::slot_page_count`].

use crate::config::MAX_SWAP_FILES;
use crate::deps::log::debug;
use crate::deps::nix::sys::uio::{pread, pwrite};
use crate::deps::parking_lot::Mutex;
use crate::error::Error;
use crate::sid::Sid;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

const PAGES_PER_SLOT: u32 = 64;
const SLOT_BYTES: u64 = 16; // matches the original `sizeof(vm_page_slot_t)`: u64 bitmap + next ptr

struct FileBitmaps {
    /// One entry per slot; bit `i` set means on-disk page `slot*64 + i` is
    /// occupied.
    slots: Vec<u64>,
    /// LIFO stack of slot indices with at least one free bit. Only the
    /// top is ever touched, exactly like the original's singly linked
    /// `free_slots` chain.
    free_slots: Vec<u32>,
}

pub struct SwapFile {
    pub id: u32,
    pub name: PathBuf,
    pub page_max_count: u32,
    file: File,
    bitmaps: Mutex<FileBitmaps>,
}

impl SwapFile {
    pub fn slots_per_slot_page(page_size: u64) -> u32 {
        (page_size / SLOT_BYTES) as u32
    }

    pub fn slot_page_count(&self, page_size: u64) -> u32 {
        let per_page = Self::slots_per_slot_page(page_size);
        let total_slots = self.bitmaps.lock().slots.len() as u32;
        (total_slots + per_page - 1) / per_page
    }

    fn alloc_page(&self) -> Option<u32> {
        let mut bm = self.bitmaps.lock();
        let slot_index = *bm.free_slots.last()?;
        let slot = &mut bm.slots[slot_index as usize];
        debug_assert_ne!(*slot, u64::MAX, "free_slots held a full slot");

        // Byte-wise scan from index 0, bit 0 first within each byte: the
        // lowest free page number always wins ties.
        let bytes = slot.to_le_bytes();
        let mut found = None;
        'outer: for (byte_idx, byte) in bytes.iter().enumerate() {
            if *byte == 0xFF {
                continue;
            }
            for bit in 0..8u32 {
                if byte & (1 << bit) == 0 {
                    found = Some(byte_idx as u32 * 8 + bit);
                    break 'outer;
                }
            }
        }
        let bit_index = found.expect("non-full slot must have a free bit");
        *slot |= 1u64 << bit_index;

        if *slot == u64::MAX {
            bm.free_slots.pop();
        }

        Some(slot_index * PAGES_PER_SLOT + bit_index)
    }

    fn free_page(&self, page_no: u32) {
        let slot_index = page_no / PAGES_PER_SLOT;
        let bit_index = page_no % PAGES_PER_SLOT;

        let mut bm = self.bitmaps.lock();
        let was_full = bm.slots[slot_index as usize] == u64::MAX;
        bm.slots[slot_index as usize] &= !(1u64 << bit_index);
        if was_full {
            bm.free_slots.push(slot_index);
        }
    }

    pub fn fd(&self) -> std::os::unix::io::RawFd {
        self.file.as_raw_fd()
    }

    /// Total number of set bits across every slot -- the number of on-disk
    /// pages currently occupied. Diagnostic only.
    pub fn pages_in_use(&self) -> u32 {
        self.bitmaps.lock().slots.iter().map(|slot| slot.count_ones()).sum()
    }
}

/// The pool-wide swap-file directory: up to [`MAX_SWAP_FILES`] files,
/// assigned ids in insertion order.
pub struct SwapFileManager {
    page_size: u64,
    /// Guards the file directory itself (insertion) *and* is held for the
    /// duration of the whole allocation scan, matching the original's
    /// `vm_files_mutex` critical section (lock-ordering rule: pool-wide
    /// file mutex before any per-file mutex).
    files: Mutex<Vec<SwapFile>>,
}

impl SwapFileManager {
    pub fn new(page_size: u64) -> Self {
        Self { page_size, files: Mutex::new(Vec::new()) }
    }

    pub fn add_file(&self, path: PathBuf, size_bytes: u64) -> Result<u32, Error> {
        let mut files = self.files.lock();
        if files.len() >= MAX_SWAP_FILES {
            return Err(Error::ConfigInvalid { reason: format!("at most {} swap files are supported", MAX_SWAP_FILES) });
        }

        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path)?;
        file.set_len(size_bytes)?;

        let page_max_count = (size_bytes / self.page_size) as u32;
        let per_slot_page = SwapFile::slots_per_slot_page(self.page_size);
        let total_slots = ((page_max_count + PAGES_PER_SLOT - 1) / PAGES_PER_SLOT).max(1);

        debug!(
            "[SwapFileManager::add_file] {:?}: page_max_count={} total_slots={} slots_per_slot_page={}",
            path, page_max_count, total_slots, per_slot_page
        );

        let id = files.len() as u32;
        let free_slots = (0..total_slots).rev().collect();
        files.push(SwapFile {
            id,
            name: path,
            page_max_count,
            file,
            bitmaps: Mutex::new(FileBitmaps { slots: vec![0u64; total_slots as usize], free_slots }),
        });
        Ok(id)
    }

    /// Scans files in strict file-id order (the original's `vm_file_index`
    /// rotating counter is dropped entirely) and returns the first free
    /// page found, or `Sid::NONE` if every file is full.
    pub fn alloc_page(&self) -> Sid {
        let files = self.files.lock();
        for file in files.iter() {
            if let Some(page_no) = file.alloc_page() {
                return Sid::new(file.id, page_no);
            }
        }
        Sid::NONE
    }

    pub fn free_page(&self, sid: Sid) {
        debug_assert!(!sid.is_none());
        let files = self.files.lock();
        let file = &files[sid.file_id() as usize];
        file.free_page(sid.page_no());
    }

    pub fn offset_of(&self, sid: Sid) -> u64 {
        sid.page_no() as u64 * self.page_size
    }

    /// Total pages currently occupied across all registered files.
    /// Diagnostic only -- useful for monitoring swap pressure.
    pub fn pages_in_use(&self) -> u32 {
        self.files.lock().iter().map(|f| f.pages_in_use()).sum()
    }

    pub fn with_file<R>(&self, file_id: u32, f: impl FnOnce(&SwapFile) -> R) -> R {
        let files = self.files.lock();
        f(&files[file_id as usize])
    }

    pub fn read_at(&self, sid: Sid, buf: &mut [u8]) -> std::io::Result<()> {
        let offset = self.offset_of(sid) as i64;
        let fd = self.with_file(sid.file_id(), |f| f.fd());
        let mut total = 0usize;
        while total < buf.len() {
            let n = pread(fd, &mut buf[total..], offset + total as i64)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            if n == 0 {
                return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read from swap file"));
            }
            total += n;
        }
        Ok(())
    }

    pub fn write_at(&self, sid: Sid, buf: &[u8]) -> std::io::Result<()> {
        let offset = self.offset_of(sid) as i64;
        let fd = self.with_file(sid.file_id(), |f| f.fd());
        let mut total = 0usize;
        while total < buf.len() {
            let n = pwrite(fd, &buf[total..], offset + total as i64)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            total += n;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("vmpool-test-{}-{}", std::process::id(), name))
    }

    #[test]
    fn alloc_and_free_round_trip_single_bit() {
        let mgr = SwapFileManager::new(4096);
        let path = tmp_path("swapfile-basic");
        mgr.add_file(path.clone(), 8 * 1024 * 1024).unwrap();

        let sid = mgr.alloc_page();
        assert!(!sid.is_none());
        assert_eq!(sid.file_id(), 0);

        mgr.free_page(sid);
        let sid2 = mgr.alloc_page();
        assert_eq!(sid2, sid, "freeing should relink the slot at the head for immediate reuse");

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn allocation_is_byte_then_bit_order() {
        let mgr = SwapFileManager::new(4096);
        let path = tmp_path("swapfile-order");
        mgr.add_file(path.clone(), 8 * 1024 * 1024).unwrap();

        let first = mgr.alloc_page();
        let second = mgr.alloc_page();
        assert_eq!(first.page_no(), 0);
        assert_eq!(second.page_no(), 1);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn second_file_used_only_after_first_is_exhausted() {
        let mgr = SwapFileManager::new(4096);
        let path_a = tmp_path("swapfile-a");
        let path_b = tmp_path("swapfile-b");
        // File 0 has exactly one slot's worth of capacity (64 pages).
        mgr.add_file(path_a.clone(), 64 * 4096).unwrap();
        mgr.add_file(path_b.clone(), 8 * 1024 * 1024).unwrap();

        // Exhaust every bit in file 0's first slot.
        for _ in 0..64 {
            let sid = mgr.alloc_page();
            assert_eq!(sid.file_id(), 0);
        }
        let spill = mgr.alloc_page();
        assert_eq!(spill.file_id(), 1);

        std::fs::remove_file(path_a).ok();
        std::fs::remove_file(path_b).ok();
    }

    #[test]
    fn write_then_read_round_trips_bytes() {
        let mgr = SwapFileManager::new(4096);
        let path = tmp_path("swapfile-io");
        mgr.add_file(path.clone(), 8 * 1024 * 1024).unwrap();
        let sid = mgr.alloc_page();

        let pattern = vec![0xAB_u8; 4096];
        mgr.write_at(sid, &pattern).unwrap();
        let mut read_back = vec![0u8; 4096];
        mgr.read_at(sid, &mut read_back).unwrap();
        assert_eq!(pattern, read_back);

        std::fs::remove_file(path).ok();
    }
}
