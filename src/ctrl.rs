//! `Ctrl`: the handle type for one logical page's lifetime, plus C3's
//! sharded free-control lists and their lazy, frame-backed expansion.
//!
//! Mirrors `vm_ctrl_t` / `vm_free_ctrls_t` in the original source. Ctrl
//! storage is carved in `ctrl_count_per_page`-sized chunks, one arena frame
//! consumed per chunk exactly as in the original `expand_ctrls_by_page`;
//! the frame is retained for bookkeeping only (capacity accounting), while
//! the `Ctrl` records themselves live in an ordinary boxed slice so they
//! get real Rust field types (a `parking_lot::Mutex`, an `AtomicBool`)
//! instead of being punned out of raw page bytes.

use crate::arena::FrameAddr;
use crate::config::NEIGHBOR_PROBE;
use crate::deps::parking_lot::Mutex;
use crate::sid::Sid;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Identifies one `Ctrl` record: its owning shard and its index within
/// that shard's storage. Stands in for a raw pointer so the pool can stay
/// an arena-with-indices rather than a web of cyclic references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CtrlId {
    pub shard: u16,
    pub index: u32,
}

/// The mutex-guarded fields of a `Ctrl`, everything the original `ctrl.m`
/// struct holds except `in_close_list` (guarded by the owning close-list
/// shard instead, since close-list membership and ctrl state are locked in
/// a fixed order -- close-list before ctrl, never the reverse).
#[derive(Debug)]
pub struct CtrlState {
    pub is_free: bool,
    pub io_in_progress: bool,
    pub ref_count: u32,
    pub swap_id: Sid,
    pub frame: Option<FrameAddr>,
}

impl CtrlState {
    fn fresh() -> Self {
        CtrlState { is_free: false, io_in_progress: false, ref_count: 0, swap_id: Sid::NONE, frame: None }
    }
}

#[derive(Debug)]
pub struct Ctrl {
    /// Monotonic diagnostic sequence number; never read for control flow.
    pub id: u64,
    pub shard: u16,
    pub in_close_list: AtomicBool,
    state: Mutex<CtrlState>,
}

impl Ctrl {
    pub fn lock(&self) -> crate::deps::parking_lot::MutexGuard<'_, CtrlState> {
        self.state.lock()
    }
}

struct CtrlChunk {
    /// Retained purely to account for the arena capacity this chunk
    /// permanently consumed; never read again.
    _frame: FrameAddr,
    ctrls: Box<[Ctrl]>,
}

/// One of `N_FREE_CTRL` shards of free `Ctrl` records.
pub struct CtrlShard {
    id: u16,
    ctrl_count_per_chunk: u32,
    free_ids: Mutex<Vec<u32>>,
    chunks: Mutex<Vec<CtrlChunk>>,
    /// Pairs with `ExpansionGuard`: set while one thread is carving a new
    /// chunk, so concurrent expanders spin-wait instead of double-carving.
    expanding: Mutex<bool>,
    next_id: AtomicU64,
}

/// RAII guard ensuring the expansion flag is always cleared, including on
/// early returns through `?` -- the flag must never leak set.
struct ExpansionGuard<'a> {
    flag: &'a Mutex<bool>,
}

impl<'a> ExpansionGuard<'a> {
    fn acquire(flag: &'a Mutex<bool>) -> Self {
        loop {
            let mut guard = flag.lock();
            if !*guard {
                *guard = true;
                break;
            }
            drop(guard);
            std::thread::sleep(std::time::Duration::from_micros(crate::config::EXPANSION_SPIN_SLEEP_US));
        }
        ExpansionGuard { flag }
    }
}

impl<'a> Drop for ExpansionGuard<'a> {
    fn drop(&mut self) {
        *self.flag.lock() = false;
    }
}

impl CtrlShard {
    pub fn new(id: u16, ctrl_count_per_chunk: u32) -> Self {
        Self {
            id,
            ctrl_count_per_chunk,
            free_ids: Mutex::new(Vec::new()),
            chunks: Mutex::new(Vec::new()),
            expanding: Mutex::new(false),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Pops a free index from this shard only (no neighbor probing --
    /// that is a pool-level concern, see `crate::pool`). Resets the popped
    /// `Ctrl` to the fresh Absent state before handing it out, matching
    /// `vm_free_ctrls_t::alloc_ctrl()`'s `ctrl->is_free = FALSE; ctrl->ref_num = 0;`
    /// -- a `Ctrl` carries no memory of its previous life across a
    /// `free`/`alloc` cycle.
    pub fn try_alloc_local(&self) -> Option<CtrlId> {
        let index = self.free_ids.lock().pop()?;
        let id = CtrlId { shard: self.id, index };
        *self.ctrl(index).lock() = CtrlState::fresh();
        self.ctrl(index).in_close_list.store(false, Ordering::SeqCst);
        Some(id)
    }

    pub fn free(&self, id: CtrlId) {
        debug_assert_eq!(id.shard, self.id);
        self.free_ids.lock().push(id.index);
    }

    /// Carves one freshly acquired frame into `ctrl_count_per_chunk` fresh
    /// `Ctrl` records, zeroed to the Absent state, and pushes their
    /// indices onto the free list. `acquire_frame` is whatever combination
    /// of C2/C7 eviction the caller wants to try; expansion fails (and the
    /// flag is still released) if it returns `None`.
    pub fn expand(&self, acquire_frame: impl FnOnce() -> Option<FrameAddr>) -> bool {
        let _guard = ExpansionGuard::acquire(&self.expanding);

        // Another thread may have expanded while we waited for the flag.
        if !self.free_ids.lock().is_empty() {
            return true;
        }

        let frame = match acquire_frame() {
            Some(f) => f,
            None => return false,
        };

        let base_index = {
            let chunks = self.chunks.lock();
            chunks.len() as u32 * self.ctrl_count_per_chunk
        };

        let ctrls: Vec<Ctrl> = (0..self.ctrl_count_per_chunk)
            .map(|_| Ctrl {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                shard: self.id,
                in_close_list: AtomicBool::new(false),
                state: Mutex::new(CtrlState::fresh()),
            })
            .collect();

        let mut free_ids = self.free_ids.lock();
        for i in 0..self.ctrl_count_per_chunk {
            free_ids.push(base_index + i);
        }
        drop(free_ids);

        self.chunks.lock().push(CtrlChunk { _frame: frame, ctrls: ctrls.into_boxed_slice() });
        true
    }

    /// # Safety contract
    /// `index` must name a `Ctrl` that has already been carved by
    /// `expand`. The returned reference is valid for as long as `self` is,
    /// because chunks are append-only and a `Box<[Ctrl]>`'s heap storage
    /// never moves once allocated.
    pub fn ctrl(&self, index: u32) -> &Ctrl {
        let chunk_idx = (index / self.ctrl_count_per_chunk) as usize;
        let offset = (index % self.ctrl_count_per_chunk) as usize;
        let chunks = self.chunks.lock();
        let ptr: *const Ctrl = &chunks[chunk_idx].ctrls[offset];
        // SAFETY: see doc comment -- chunks are never removed or relocated.
        unsafe { &*ptr }
    }
}

/// The full set of `N_FREE_CTRL` shards.
pub struct CtrlTable {
    shards: Vec<CtrlShard>,
}

impl CtrlTable {
    pub fn new(shard_count: usize, ctrl_count_per_chunk: u32) -> Self {
        let shards = (0..shard_count).map(|i| CtrlShard::new(i as u16, ctrl_count_per_chunk)).collect();
        Self { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn ctrl(&self, id: CtrlId) -> &Ctrl {
        self.shards[id.shard as usize].ctrl(id.index)
    }

    /// Probes the caller-affinity shard then up to [`NEIGHBOR_PROBE`]
    /// neighbors for a free `Ctrl`; on a full miss, expands the
    /// caller-affinity shard via `acquire_frame` and retries once.
    pub fn alloc(&self, affinity: usize, acquire_frame: impl FnOnce() -> Option<FrameAddr>) -> Option<CtrlId> {
        let n = self.shards.len();
        if let Some(id) = self.shards[affinity % n].try_alloc_local() {
            return Some(id);
        }
        for step in 1..=NEIGHBOR_PROBE {
            if let Some(id) = self.shards[(affinity + step) % n].try_alloc_local() {
                return Some(id);
            }
        }
        if !self.shards[affinity % n].expand(acquire_frame) {
            return None;
        }
        self.shards[affinity % n].try_alloc_local()
    }

    pub fn free(&self, id: CtrlId) {
        self.shards[id.shard as usize].free(id);
    }
}
