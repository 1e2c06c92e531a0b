//! C4: sharded close-lists. FIFO queues of closed (`ref_count == 0`,
//! Resident) `Ctrl`s, one per shard, that double as the eviction
//! candidate pool (mirrors `vm_close_ctrls_t` in the original source).

use crate::ctrl::{CtrlId, CtrlTable};
use crate::deps::parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;

struct CloseListShard {
    id: u16,
    queue: Mutex<VecDeque<CtrlId>>,
}

impl CloseListShard {
    /// Push `ctrl` onto this shard's FIFO iff it is not already close-listed
    /// and has no outstanding opens. Lock order: queue mutex, then the
    /// ctrl's own mutex -- the reverse order is forbidden everywhere in
    /// this crate.
    fn add(&self, id: CtrlId, table: &CtrlTable) {
        let mut queue = self.queue.lock();
        let ctrl = table.ctrl(id);
        let state = ctrl.lock();
        if ctrl.in_close_list.load(Ordering::SeqCst) || state.ref_count != 0 {
            return;
        }
        drop(state);
        ctrl.in_close_list.store(true, Ordering::SeqCst);
        queue.push_back(id);
    }

    /// Unlink `ctrl` iff it is currently close-listed.
    fn remove(&self, id: CtrlId, table: &CtrlTable) {
        let mut queue = self.queue.lock();
        let ctrl = table.ctrl(id);
        if !ctrl.in_close_list.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(pos) = queue.iter().position(|&x| x == id) {
            queue.remove(pos);
        }
    }

    /// Scans head-to-tail for the first candidate that is resident, has no
    /// outstanding opens, and is not already mid-I/O; reserves it for
    /// eviction by setting `io_in_progress` and unlinking it.
    fn pick_victim(&self, table: &CtrlTable) -> Option<CtrlId> {
        let mut queue = self.queue.lock();
        let mut cursor = 0;
        while cursor < queue.len() {
            let id = queue[cursor];
            let ctrl = table.ctrl(id);
            let mut state = ctrl.lock();
            if state.ref_count == 0 && !state.io_in_progress && state.frame.is_some() {
                state.io_in_progress = true;
                drop(state);
                ctrl.in_close_list.store(false, Ordering::SeqCst);
                queue.remove(cursor);
                return Some(id);
            }
            cursor += 1;
        }
        None
    }
}

/// The full set of `N_CLOSE` shards.
pub struct CloseList {
    shards: Vec<CloseListShard>,
}

impl CloseList {
    pub fn new(shard_count: usize) -> Self {
        let shards = (0..shard_count).map(|i| CloseListShard { id: i as u16, queue: Mutex::new(VecDeque::new()) }).collect();
        Self { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn add(&self, affinity: usize, id: CtrlId, table: &CtrlTable) {
        let n = self.shards.len();
        self.shards[affinity % n].add(id, table);
    }

    pub fn remove(&self, id: CtrlId, table: &CtrlTable) {
        // Any shard's mutex correctly serializes the flag flip; the owning
        // shard is wherever `add` last placed it, so route by the ctrl's
        // own shard tag as a stable, deterministic choice.
        let n = self.shards.len();
        self.shards[id.shard as usize % n].remove(id, table);
    }

    /// Iterates close-list shards starting at `affinity`, returning the
    /// first victim any shard yields.
    pub fn pick_victim(&self, affinity: usize, table: &CtrlTable) -> Option<CtrlId> {
        let n = self.shards.len();
        for step in 0..n {
            let idx = (affinity + step) % n;
            if let Some(id) = self.shards[idx].pick_victim(table) {
                return Some(id);
            }
        }
        None
    }
}
