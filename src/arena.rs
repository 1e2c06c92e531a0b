//! C1: the raw arena. Reserves one large anonymous mapping up front and
//! hands out fixed-size frames by bumping a high-water mark. There is no
//! free-list at this level; reclamation is [`crate::freelist`]'s job.
//!
//! Generalized from an `mmap`-backed file-inspection struct that mapped a
//! *file* for read-only inspection; here the backing is anonymous memory
//! reserved once for the lifetime of the pool, never file-backed.

use crate::deps::{
    log::debug,
    nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags},
};
use crate::deps::parking_lot::Mutex;
use crate::error::Error;
use std::ptr::NonNull;

/// A single `page_size`-aligned frame borrowed out of the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAddr(NonNull<u8>);

unsafe impl Send for FrameAddr {}
unsafe impl Sync for FrameAddr {}

impl FrameAddr {
    /// # Safety
    /// `ptr` must point at a live, `len`-byte frame owned by the arena that
    /// produced it, and the caller must not retain it past the frame's
    /// logical lifetime (i.e. past a `free`/eviction of the owning `Ctrl`).
    pub unsafe fn as_slice<'a>(&self, len: usize) -> &'a [u8] {
        std::slice::from_raw_parts(self.0.as_ptr(), len)
    }

    /// # Safety
    /// See [`FrameAddr::as_slice`]; additionally the caller must hold
    /// exclusive access for the duration of the borrow.
    pub unsafe fn as_mut_slice<'a>(&self, len: usize) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.0.as_ptr(), len)
    }

    pub fn as_nonnull(&self) -> NonNull<u8> {
        self.0
    }
}

struct ArenaInner {
    base: NonNull<u8>,
    mapped_len: usize,
}

// SAFETY: the mapping is reserved once for the pool's lifetime and never
// reallocated; concurrent access to the *frames* it contains is
// synchronized by each frame's owning `Ctrl` mutex, not by `Arena` itself.
unsafe impl Send for ArenaInner {}
unsafe impl Sync for ArenaInner {}

impl Drop for ArenaInner {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = munmap(self.base.as_ptr() as *mut _, self.mapped_len) {
                debug!("[Arena::drop] munmap of {} bytes failed: {:?}", self.mapped_len, e);
            }
        }
    }
}

/// Reserves `page_count * page_size` bytes once and bump-allocates frames
/// out of it. Never deallocates individual frames; frames recycle through
/// [`crate::freelist::FreeList`] instead.
pub struct Arena {
    inner: ArenaInner,
    page_size: usize,
    page_count: usize,
    hwm: Mutex<usize>,
}

impl Arena {
    pub fn new(page_size: usize, page_count: usize) -> Result<Self, Error> {
        let mapped_len = page_size
            .checked_mul(page_count)
            .ok_or_else(|| Error::ConfigInvalid { reason: "page_size * page_count overflowed".into() })?;

        debug!("[Arena::new] reserving {} bytes ({} pages of {} bytes)", mapped_len, page_count, page_size);

        let ptr = unsafe {
            mmap(
                0 as *mut _,
                mapped_len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_NORESERVE,
                -1,
                0,
            )
            .map_err(|e| Error::Io { source: std::io::Error::new(std::io::ErrorKind::Other, e) })?
        };

        let base = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| Error::ConfigInvalid { reason: "mmap returned a null base address".into() })?;

        Ok(Self {
            inner: ArenaInner { base, mapped_len },
            page_size,
            page_count,
            hwm: Mutex::new(0),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Returns the next never-before-handed-out frame, or `None` once the
    /// arena is exhausted.
    pub fn alloc_from_bump(&self) -> Option<FrameAddr> {
        let mut hwm = self.hwm.lock();
        if *hwm >= self.page_count {
            return None;
        }
        let offset = *hwm * self.page_size;
        *hwm += 1;
        let ptr = unsafe { self.inner.base.as_ptr().add(offset) };
        Some(FrameAddr(unsafe { NonNull::new_unchecked(ptr) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocates_up_to_capacity_then_none() {
        let arena = Arena::new(4096, 4).unwrap();
        for _ in 0..4 {
            assert!(arena.alloc_from_bump().is_some());
        }
        assert!(arena.alloc_from_bump().is_none());
    }

    #[test]
    fn frames_are_distinct_and_writable() {
        let arena = Arena::new(4096, 2).unwrap();
        let a = arena.alloc_from_bump().unwrap();
        let b = arena.alloc_from_bump().unwrap();
        unsafe {
            a.as_mut_slice(4096)[0] = 0xAB;
            b.as_mut_slice(4096)[0] = 0xCD;
            assert_eq!(a.as_slice(4096)[0], 0xAB);
            assert_eq!(b.as_slice(4096)[0], 0xCD);
        }
    }
}
