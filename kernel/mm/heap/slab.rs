//! Slab heap backend (Xalloc V1 style)
//!
//! Power-of-two size classes from 32 bytes to one page, each backed by
//! a free list of fixed-size chunks carved out of the heap arena.
//! Requests beyond one page fall through to whole frame spans.
//!
//! An allocated chunk stores its class in the first header word; a free
//! chunk reuses that word as the next-free link. Large spans store a
//! zero marker and their page count instead.

use core::ptr;

use crate::arch::{PAGE_SIZE, phys_to_virt};
use crate::mm::FRAME_ALLOCATOR;
use crate::mm::heap::HeapRegion;
use crate::mm::pages_for;

/// Smallest chunk class
const MIN_CLASS: usize = 32;

/// Largest chunk class; anything bigger takes whole frames
const MAX_CLASS: usize = PAGE_SIZE as usize;

/// Number of classes: 32, 64, ..., 4096
const CLASS_COUNT: usize = 8;

/// Pages carved per slab refill
const SLAB_PAGES: usize = 4;

/// Class index for a request of `total` bytes
fn class_index(total: usize) -> usize {
    let class = total.next_power_of_two().max(MIN_CLASS);
    (class.trailing_zeros() - MIN_CLASS.trailing_zeros()) as usize
}

/// Chunk size of a class index
fn class_size(index: usize) -> usize {
    MIN_CLASS << index
}

/// Slab heap with per-class free lists
pub struct SlabHeap {
    /// Head of the free-chunk list per class
    free: [*mut u8; CLASS_COUNT],
}

// Safety: only reached through the heap's IrqSpinlock
unsafe impl Send for SlabHeap {}

impl SlabHeap {
    pub const fn new() -> Self {
        Self {
            free: [ptr::null_mut(); CLASS_COUNT],
        }
    }

    /// Carve a fresh slab for `index` out of the arena
    fn refill(&mut self, region: &mut HeapRegion, index: usize) -> Option<()> {
        let chunk = class_size(index);
        let slab = region.grow(SLAB_PAGES)?;
        let count = SLAB_PAGES * PAGE_SIZE as usize / chunk;

        for i in 0..count {
            let p = unsafe { slab.add(i * chunk) };
            unsafe {
                *(p as *mut *mut u8) = self.free[index];
            }
            self.free[index] = p;
        }
        Some(())
    }

    /// Allocate a chunk or span holding `total` bytes
    pub fn raw_alloc(&mut self, region: &mut HeapRegion, total: usize) -> Option<*mut u8> {
        if total > MAX_CLASS {
            // Large request: whole frames through the direct map
            let pages = pages_for(total as u64);
            let base = FRAME_ALLOCATOR.request_frames(pages)?;
            let raw = phys_to_virt(base);
            unsafe {
                *(raw as *mut u64) = 0;
                *(raw.add(8) as *mut u64) = pages as u64;
            }
            return Some(raw);
        }

        let index = class_index(total);
        if self.free[index].is_null() {
            self.refill(region, index)?;
        }

        let raw = self.free[index];
        unsafe {
            self.free[index] = *(raw as *const *mut u8);
            *(raw as *mut u64) = class_size(index) as u64;
        }
        Some(raw)
    }

    /// Free a chunk or span
    pub fn raw_free(&mut self, raw: *mut u8) {
        let class = unsafe { *(raw as *const u64) } as usize;
        if class == 0 {
            let pages = unsafe { *(raw.add(8) as *const u64) } as usize;
            FRAME_ALLOCATOR.free_frames(raw as u64, pages);
            return;
        }

        let index = class_index(class);
        unsafe {
            *(raw as *mut *mut u8) = self.free[index];
        }
        self.free[index] = raw;
    }

    /// Usable bytes in the chunk or span
    pub fn raw_size(&self, raw: *mut u8) -> usize {
        let class = unsafe { *(raw as *const u64) } as usize;
        if class == 0 {
            let pages = unsafe { *(raw.add(8) as *const u64) } as usize;
            pages * PAGE_SIZE as usize
        } else {
            class
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_rounding() {
        assert_eq!(class_index(1), 0);
        assert_eq!(class_size(class_index(1)), 32);
        assert_eq!(class_size(class_index(32)), 32);
        assert_eq!(class_size(class_index(33)), 64);
        assert_eq!(class_size(class_index(4096)), 4096);
        assert_eq!(class_index(4096), CLASS_COUNT - 1);
    }
}
