//! C7: the page-lifecycle protocol. Ties the raw arena (C1), sharded free
//! lists (C2/C3), close-lists (C4), swap-file manager (C5) and I/O engine
//! (C6) together into the public `alloc` / `open` / `close` / `free` API,
//! mirroring `vm_alloc` / `vm_open` / `vm_close` / `vm_free` in the
//! original source.

use crate::affinity::caller_shard;
use crate::arena::{Arena, FrameAddr};
use crate::closelist::CloseList;
use crate::config::{validate_swap_file_size, PoolConfig, EXPANSION_SPIN_SLEEP_US, MAX_REF, N_CLOSE, N_FREE_CTRL, N_FREE_PAGE};
use crate::ctrl::{Ctrl, CtrlId, CtrlTable};
use crate::deps::log::debug;
use crate::error::Error;
use crate::freelist::FreeList;
use crate::io_engine::{IoEngine, IoOutcome};
use crate::sid::Sid;
use crate::swapfile::SwapFileManager;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// A page-pool instance: one arena, its free lists, its close-lists, and
/// the swap files backing overflow.
pub struct Pool {
    page_size: usize,
    #[allow(dead_code)]
    arena: Arc<Arena>,
    free_pages: FreeList,
    ctrls: CtrlTable,
    close_list: CloseList,
    swap_files: Arc<SwapFileManager>,
    io: IoEngine,
}

impl Pool {
    /// Builds a pool from a validated configuration. `io_workers` sizes the
    /// background thread pool backing swap reads/writes.
    pub fn create(config: PoolConfig, io_workers: usize) -> Result<Self, Error> {
        let validated = config.validate()?;
        let page_size = validated.page_size.bytes();

        let arena = Arc::new(Arena::new(page_size, validated.page_count)?);
        let free_pages = FreeList::new(N_FREE_PAGE, Arc::clone(&arena));
        free_pages.prepopulate(validated.initial_frames);

        let ctrl_record_size = std::mem::size_of::<Ctrl>().max(1);
        let ctrl_count_per_chunk = (page_size / ctrl_record_size).max(1) as u32;
        let ctrls = CtrlTable::new(N_FREE_CTRL, ctrl_count_per_chunk);
        let close_list = CloseList::new(N_CLOSE);

        let swap_files = Arc::new(SwapFileManager::new(page_size as u64));
        let io = IoEngine::new(Arc::clone(&swap_files), io_workers);

        debug!(
            "[Pool::create] page_size={} page_count={} ctrl_count_per_chunk={}",
            page_size, validated.page_count, ctrl_count_per_chunk
        );

        Ok(Self { page_size, arena, free_pages, ctrls, close_list, swap_files, io })
    }

    /// Registers a new swap file, rounding and bounds-checking its size the
    /// same way `vm_pool_add_file` does.
    pub fn add_swap_file(&self, path: PathBuf, size_bytes: u64) -> Result<u32, Error> {
        let rounded = validate_swap_file_size(size_bytes)?;
        self.swap_files.add_file(path, rounded)
    }

    /// Builds a pool straight from `page_size`/`page_count`, skipping
    /// `PoolConfig`'s minimum-budget floor. Test-only: exercising eviction
    /// through the public constructor would require a 64 MiB+ arena.
    #[cfg(test)]
    fn create_unchecked(page_size: usize, page_count: usize, io_workers: usize) -> Result<Self, Error> {
        let arena = Arc::new(Arena::new(page_size, page_count)?);
        let free_pages = FreeList::new(N_FREE_PAGE, Arc::clone(&arena));
        let ctrl_record_size = std::mem::size_of::<Ctrl>().max(1);
        let ctrl_count_per_chunk = (page_size / ctrl_record_size).max(1) as u32;
        let ctrls = CtrlTable::new(N_FREE_CTRL, ctrl_count_per_chunk);
        let close_list = CloseList::new(N_CLOSE);
        let swap_files = Arc::new(SwapFileManager::new(page_size as u64));
        let io = IoEngine::new(Arc::clone(&swap_files), io_workers);
        Ok(Self { page_size, arena, free_pages, ctrls, close_list, swap_files, io })
    }

    /// Allocates a fresh, Absent `Ctrl`: no frame, no disk backing, `ref_count`
    /// zero. Growing the control-block table itself may require a frame,
    /// obtained the same way page allocation does (free list, then eviction).
    pub fn alloc(&self) -> Result<CtrlId, Error> {
        let affinity = caller_shard(self.ctrls.shard_count());
        self.ctrls.alloc(affinity, || self.acquire_frame(affinity)).ok_or(Error::Exhausted)
    }

    /// Releases a `Ctrl` permanently: returns its frame to the free list (if
    /// resident) or its swap slot to the swap-file manager (if swapped),
    /// then returns the `Ctrl` record itself to its shard's free list.
    /// Mirrors `vm_free` -- waits out any in-flight I/O first.
    pub fn free(&self, id: CtrlId) -> Result<(), Error> {
        let ctrl = self.ctrls.ctrl(id);
        let (frame, swap_id) = loop {
            let mut state = ctrl.lock();
            if state.io_in_progress || state.ref_count != 0 {
                drop(state);
                std::thread::sleep(Duration::from_micros(EXPANSION_SPIN_SLEEP_US));
                continue;
            }
            if state.is_free {
                // Idempotent per spec: a second `free` after the first has
                // returned succeeds without touching state again, matching
                // the original's `ut_ad(!ctrl->is_free)` debug assertion
                // rather than surfacing a user-visible error.
                debug_assert!(!state.is_free, "double free of the same Ctrl");
                return Ok(());
            }
            state.is_free = true;
            let frame = state.frame.take();
            let swap_id = state.swap_id;
            state.swap_id = Sid::NONE;
            break (frame, swap_id);
        };

        if let Some(frame) = frame {
            let shard = id.shard as usize % self.free_pages.shard_count();
            self.free_pages.free_page(shard, frame);
        }
        self.close_list.remove(id, &self.ctrls);
        self.ctrls.free(id);
        if !swap_id.is_none() {
            self.swap_files.free_page(swap_id);
        }
        Ok(())
    }

    /// Opens a `Ctrl` for use, making its page resident: bumps `ref_count`
    /// if it is already open, otherwise acquires a frame and, if the page
    /// was previously swapped out, reads its contents back in. Mirrors
    /// `vm_open`.
    pub fn open(&self, id: CtrlId) -> Result<(), Error> {
        let affinity = caller_shard(self.ctrls.shard_count());
        let ctrl = self.ctrls.ctrl(id);

        let needs_io = loop {
            let mut state = ctrl.lock();
            if state.is_free {
                return Err(Error::UseAfterFree);
            }
            if state.io_in_progress {
                drop(state);
                std::thread::sleep(Duration::from_micros(EXPANSION_SPIN_SLEEP_US));
                continue;
            }
            if state.ref_count >= MAX_REF {
                return Err(Error::OpenLimitExceeded { max: MAX_REF });
            }
            if state.ref_count > 0 {
                state.ref_count += 1;
                return Ok(());
            }
            let needs_io = state.frame.is_none();
            if needs_io {
                state.io_in_progress = true;
            }
            state.ref_count = 1;
            break needs_io;
        };

        self.close_list.remove(id, &self.ctrls);

        if !needs_io {
            return Ok(());
        }

        let frame = match self.acquire_frame(affinity) {
            Some(f) => f,
            None => {
                let mut state = ctrl.lock();
                state.ref_count -= 1;
                state.io_in_progress = false;
                return Err(Error::Exhausted);
            }
        };

        let swap_id = ctrl.lock().swap_id;
        if swap_id.is_none() {
            let mut state = ctrl.lock();
            state.io_in_progress = false;
            state.frame = Some(frame);
            return Ok(());
        }

        let outcome = {
            let bytes = unsafe { frame.as_mut_slice(self.page_size) };
            self.io.read_page(swap_id, bytes)
        };

        match outcome {
            IoOutcome::Completed => {
                self.swap_files.free_page(swap_id);
                let mut state = ctrl.lock();
                state.swap_id = Sid::NONE;
                state.frame = Some(frame);
                state.io_in_progress = false;
                Ok(())
            }
            IoOutcome::TimedOut => {
                let mut state = ctrl.lock();
                state.ref_count -= 1;
                state.io_in_progress = false;
                drop(state);
                self.free_pages.free_page(affinity, frame);
                Err(Error::TimedOut(Duration::from_secs(crate::config::IO_TIMEOUT_SECS)))
            }
            IoOutcome::SubmitFailed => {
                let mut state = ctrl.lock();
                state.ref_count -= 1;
                state.io_in_progress = false;
                drop(state);
                self.free_pages.free_page(affinity, frame);
                Err(Error::Io { source: std::io::Error::new(std::io::ErrorKind::Other, "swap-in submit failed") })
            }
        }
    }

    /// Drops one reference. Once the last reference is released the `Ctrl`
    /// becomes an eviction candidate again. Mirrors `vm_close`.
    pub fn close(&self, id: CtrlId) -> Result<(), Error> {
        let ctrl = self.ctrls.ctrl(id);
        let now_closed = loop {
            let mut state = ctrl.lock();
            if state.io_in_progress {
                drop(state);
                std::thread::sleep(Duration::from_micros(EXPANSION_SPIN_SLEEP_US));
                continue;
            }
            if state.ref_count == 0 {
                return Err(Error::UseAfterFree);
            }
            state.ref_count -= 1;
            break state.ref_count == 0;
        };

        if now_closed {
            let shard = id.shard as usize % self.close_list.shard_count();
            self.close_list.add(shard, id, &self.ctrls);
        }
        Ok(())
    }

    /// Runs `f` over the resident page's bytes. The `Ctrl` must currently
    /// be open (`ref_count > 0`), which the caller guarantees by holding a
    /// successful [`Pool::open`].
    pub fn with_page<R>(&self, id: CtrlId, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, Error> {
        let ctrl = self.ctrls.ctrl(id);
        let state = ctrl.lock();
        if state.ref_count == 0 {
            return Err(Error::UseAfterFree);
        }
        let frame = state.frame.expect("an open ctrl is always resident");
        let bytes = unsafe { frame.as_mut_slice(self.page_size) };
        Ok(f(bytes))
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Total pages currently resident on swap, across every registered
    /// file. Diagnostic only.
    pub fn pages_in_use(&self) -> u32 {
        self.swap_files.pages_in_use()
    }

    /// Tries the caller-affinity free-page shard (and neighbors, and the
    /// raw arena bump), then falls back to evicting a close-listed `Ctrl`.
    fn acquire_frame(&self, affinity: usize) -> Option<FrameAddr> {
        if let Some(frame) = self.free_pages.alloc_page(affinity) {
            return Some(frame);
        }
        self.swap_out_one(affinity)
    }

    /// Picks a victim off the close-list and swaps its page out, returning
    /// the now-empty frame. On failure (no swap space, or the write itself
    /// failed/timed out) the victim is returned to its close-list and `None`
    /// is reported up, matching `vm_swap_out_page`.
    fn swap_out_one(&self, affinity: usize) -> Option<FrameAddr> {
        let victim = self.close_list.pick_victim(affinity, &self.ctrls)?;
        match self.swap_out_victim(victim) {
            Ok(frame) => Some(frame),
            Err(id) => {
                let shard = id.shard as usize % self.close_list.shard_count();
                self.close_list.add(shard, id, &self.ctrls);
                None
            }
        }
    }

    /// Allocates a swap slot and writes `id`'s resident page to it. On any
    /// failure the slot (if allocated) is freed and the frame is left in
    /// place; on success the frame is detached and returned to the caller.
    fn swap_out_victim(&self, id: CtrlId) -> Result<FrameAddr, CtrlId> {
        let ctrl = self.ctrls.ctrl(id);
        let frame = ctrl.lock().frame.expect("pick_victim only yields resident ctrls");

        let sid = self.swap_files.alloc_page();
        if sid.is_none() {
            ctrl.lock().io_in_progress = false;
            return Err(id);
        }

        let outcome = {
            let bytes = unsafe { frame.as_slice(self.page_size) };
            self.io.write_page(sid, bytes)
        };

        let mut state = ctrl.lock();
        state.io_in_progress = false;
        match outcome {
            IoOutcome::Completed => {
                state.frame = None;
                state.swap_id = sid;
                Ok(frame)
            }
            _ => {
                drop(state);
                self.swap_files.free_page(sid);
                Err(id)
            }
        }
    }
}
