//! End-to-end scenarios exercised only through the public API: `create`,
//! `add_swap_file`, `alloc`/`open`/`close`/`free`.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use vmpool::config::{PageSize, PoolConfig};
use vmpool::{Error, Pool};

fn tmp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("vmpool-scenario-{}-{}", std::process::id(), name))
}

fn full_pool(io_workers: usize) -> Pool {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = PoolConfig { ram_budget: 64 * 1024 * 1024, page_size: PageSize::Kb128, initial_frames: 0 };
    Pool::create(config, io_workers).expect("64 MiB / 128 KiB pool should construct")
}

#[test]
fn basic_cycle_fits_entirely_in_ram() {
    let pool = full_pool(2);
    let path = tmp_path("basic-cycle");
    pool.add_swap_file(path.clone(), 64 * 1024 * 1024).unwrap();

    let mut ids = Vec::new();
    for i in 0..10u8 {
        let id = pool.alloc().unwrap();
        pool.open(id).unwrap();
        pool.with_page(id, |bytes| bytes.iter_mut().for_each(|b| *b = i)).unwrap();
        pool.close(id).unwrap();
        ids.push(id);
    }

    assert_eq!(pool.pages_in_use(), 0, "10 pages easily fit in 512 frames; no eviction should occur");

    for (i, id) in ids.into_iter().enumerate() {
        pool.open(id).unwrap();
        let first_byte = pool.with_page(id, |bytes| bytes[0]).unwrap();
        assert_eq!(first_byte, i as u8);
        pool.close(id).unwrap();
        pool.free(id).unwrap();
    }

    std::fs::remove_file(path).ok();
}

#[test]
fn forced_eviction_preserves_byte_patterns_across_512_frames() {
    let pool = full_pool(4);
    let path = tmp_path("forced-eviction");
    pool.add_swap_file(path.clone(), 64 * 1024 * 1024).unwrap();

    // Of the pool's 512 frames, one is permanently claimed bootstrapping
    // the ctrl table's first chunk, leaving 511 for page data. Hold 509
    // ctrls open with distinct patterns.
    let mut held = Vec::new();
    for i in 0..509u32 {
        let id = pool.alloc().unwrap();
        pool.open(id).unwrap();
        let pattern = (i % 256) as u8;
        pool.with_page(id, |bytes| bytes.iter_mut().for_each(|b| *b = pattern)).unwrap();
        held.push((id, pattern));
    }

    // Two more ctrls fill the remaining data frames exactly.
    for i in 509..511u32 {
        let id = pool.alloc().unwrap();
        pool.open(id).unwrap();
        let pattern = (i % 256) as u8;
        pool.with_page(id, |bytes| bytes.iter_mut().for_each(|b| *b = pattern)).unwrap();
        held.push((id, pattern));
    }

    // Close two arbitrary earlier ctrls, making them eviction candidates.
    let victim_a = held[3].0;
    let victim_b = held[17].0;
    pool.close(victim_a).unwrap();
    pool.close(victim_b).unwrap();

    // Two further ctrls can now only be opened by evicting the two closed ones.
    let newcomer_a = pool.alloc().unwrap();
    pool.open(newcomer_a).unwrap();
    pool.with_page(newcomer_a, |bytes| bytes.iter_mut().for_each(|b| *b = 0xAA)).unwrap();

    let newcomer_b = pool.alloc().unwrap();
    pool.open(newcomer_b).unwrap();
    pool.with_page(newcomer_b, |bytes| bytes.iter_mut().for_each(|b| *b = 0xBB)).unwrap();

    assert_eq!(pool.pages_in_use(), 2, "exactly the two evicted victims should be on swap right now");

    // Reopening the two closed ctrls must swap their contents back in intact.
    pool.open(victim_a).unwrap();
    let restored_a = pool.with_page(victim_a, |bytes| bytes[0]).unwrap();
    assert_eq!(restored_a, held[3].1);

    pool.open(victim_b).unwrap();
    let restored_b = pool.with_page(victim_b, |bytes| bytes[0]).unwrap();
    assert_eq!(restored_b, held[17].1);

    std::fs::remove_file(path).ok();
}

#[test]
fn capacity_exhaustion_is_rejected_at_creation() {
    let config = PoolConfig { ram_budget: 1024 * 1024, page_size: PageSize::Kb128, initial_frames: 0 };
    assert!(matches!(Pool::create(config, 1), Err(Error::ConfigInvalid { .. })));
}

struct Slot {
    id: vmpool::CtrlId,
    open_count: u32,
}

fn next(state: &mut u64) -> u64 {
    // xorshift64*, deterministic and dependency-free.
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    *state
}

#[test]
fn concurrent_alloc_open_close_free_leaves_no_frame_leaks() {
    const THREADS: usize = 16;
    const ITERATIONS: usize = 10_000;
    const SHARED_CTRLS: usize = 1_000;

    let pool = Arc::new(full_pool(8));
    let path = tmp_path("concurrency");
    pool.add_swap_file(path.clone(), 64 * 1024 * 1024).unwrap();

    let slots: Vec<Mutex<Slot>> = (0..SHARED_CTRLS)
        .map(|_| Mutex::new(Slot { id: pool.alloc().unwrap(), open_count: 0 }))
        .collect();
    let slots = Arc::new(slots);

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let pool = Arc::clone(&pool);
            let slots = Arc::clone(&slots);
            thread::spawn(move || {
                let mut rng = 0x9E3779B97F4A7C15u64 ^ (t as u64 + 1);
                for _ in 0..ITERATIONS {
                    let idx = (next(&mut rng) as usize) % slots.len();
                    let mut slot = slots[idx].lock().unwrap();
                    match next(&mut rng) % 3 {
                        0 => {
                            if pool.open(slot.id).is_ok() {
                                slot.open_count += 1;
                            }
                        }
                        1 => {
                            if slot.open_count > 0 {
                                pool.close(slot.id).unwrap();
                                slot.open_count -= 1;
                            }
                        }
                        _ => {
                            if slot.open_count == 0 {
                                pool.free(slot.id).unwrap();
                                slot.id = pool.alloc().unwrap();
                            }
                        }
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().expect("worker thread should not panic");
    }

    // Drain every slot back to a known quiescent state: fully closed, then
    // prove it is still usable (open/close round-trip without error).
    for slot in slots.iter() {
        let mut s = slot.lock().unwrap();
        while s.open_count > 0 {
            pool.close(s.id).unwrap();
            s.open_count -= 1;
        }
        pool.open(s.id).unwrap();
        pool.close(s.id).unwrap();
    }

    std::fs::remove_file(path).ok();
}

#[test]
fn reopen_reference_counting_protects_from_eviction() {
    let pool = full_pool(2);
    let path = tmp_path("refcount");
    pool.add_swap_file(path.clone(), 64 * 1024 * 1024).unwrap();

    let protected = pool.alloc().unwrap();
    for _ in 0..5 {
        pool.open(protected).unwrap();
    }
    pool.with_page(protected, |bytes| bytes[0] = 0x77).unwrap();
    for _ in 0..4 {
        pool.close(protected).unwrap();
    }
    // ref_count is now 1: still open, and therefore never a close-list
    // candidate no matter how much eviction pressure follows.

    // One frame is claimed bootstrapping the ctrl table, so 511 data
    // frames remain; `protected` already holds one, leaving room for 510
    // fillers to reach capacity exactly.
    let mut fillers = Vec::new();
    for i in 0..510u32 {
        let id = pool.alloc().unwrap();
        pool.open(id).unwrap();
        pool.with_page(id, |bytes| bytes[0] = (i % 256) as u8).unwrap();
        fillers.push(id);
    }

    // Close one filler so there is a genuine eviction candidate, then force
    // one more open; `protected` must survive untouched since it is still
    // open, even though it was allocated before the filler that gets evicted.
    pool.close(fillers[0]).unwrap();
    let extra = pool.alloc().unwrap();
    pool.open(extra).unwrap();
    pool.with_page(extra, |bytes| bytes[0] = 0xEE).unwrap();

    let value = pool.with_page(protected, |bytes| bytes[0]).unwrap();
    assert_eq!(value, 0x77, "a ctrl with ref_count > 0 must never be evicted");

    // The final close now makes it a genuine victim candidate.
    pool.close(protected).unwrap();

    std::fs::remove_file(path).ok();
}
