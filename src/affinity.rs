//! Thread-stable shard affinity.
//!
//! Every sharded collaborator (C2-C4) picks its home shard from a stable
//! per-thread integer, mirroring the original's internal thread id.
//! `std::thread::ThreadId` already is one such integer; we cache a small
//! derived index in thread-local storage so repeated calls from the same
//! thread are cheap and never renumber mid-lifetime.

use std::cell::Cell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

thread_local! {
    static INTERNAL_ID: Cell<Option<u64>> = Cell::new(None);
}

fn internal_id() -> u64 {
    INTERNAL_ID.with(|cell| {
        if let Some(id) = cell.get() {
            return id;
        }
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        let id = hasher.finish();
        cell.set(Some(id));
        id
    })
}

/// Maps the calling thread to a shard index in `0..shard_count`.
pub fn caller_shard(shard_count: usize) -> usize {
    debug_assert!(shard_count > 0);
    (internal_id() % shard_count as u64) as usize
}
