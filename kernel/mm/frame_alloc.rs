//! Physical frame allocator
//!
//! Bitmap-based allocator covering all addressable RAM from physical 0.
//! Two parallel bitmaps: `used` (set iff the frame is allocated or
//! reserved) and `reserved` (set iff the frame must never be handed out:
//! kernel image, MMIO, framebuffer, bad memory, the first 1 MiB).
//!
//! Invariants: `used_frames` equals the popcount of used-and-not-reserved
//! bits, `reserved_frames` the popcount of reserved bits, and
//! `used + free == total - reserved` at all times.
//!
//! Uses IrqSpinlock so allocation is safe from interrupt context.

use crate::arch::{FrameAlloc, IrqSpinlock, PAGE_SIZE};
use crate::bootinfo::{MemoryMap, MemoryType};
use crate::printkln;

/// Frame size in bytes (one 4 KiB page)
pub const FRAME_SIZE: usize = PAGE_SIZE as usize;

/// Maximum number of frames tracked (4 GiB of RAM)
const MAX_FRAMES: usize = 1 << 20;

/// Words per bitmap
const BITMAP_WORDS: usize = MAX_FRAMES / 64;

/// The first 1 MiB is always reserved (BIOS structures, legacy MMIO)
const LOW_MEMORY_FRAMES: usize = (1024 * 1024) / FRAME_SIZE;

/// Bitmap frame allocator
pub struct BitmapFrameAllocator {
    inner: IrqSpinlock<FrameAllocatorInner>,
}

struct FrameAllocatorInner {
    /// Bit set iff the frame is allocated or reserved
    used: [u64; BITMAP_WORDS],
    /// Bit set iff the frame is reserved (never allocatable)
    reserved: [u64; BITMAP_WORDS],
    /// Total frames covered by the bitmaps
    total_frames: usize,
    /// Allocated (non-reserved) frames
    used_frames: usize,
    /// Reserved frames
    reserved_frames: usize,
    /// Search hint for the next free frame
    next_free: usize,
}

impl FrameAllocatorInner {
    #[inline]
    fn bit(word: &[u64], idx: usize) -> bool {
        word[idx / 64] & (1u64 << (idx % 64)) != 0
    }

    #[inline]
    fn set_bit(word: &mut [u64], idx: usize) {
        word[idx / 64] |= 1u64 << (idx % 64);
    }

    #[inline]
    fn clear_bit(word: &mut [u64], idx: usize) {
        word[idx / 64] &= !(1u64 << (idx % 64));
    }

    /// Mark one frame allocated; returns false if it was already used
    fn take(&mut self, idx: usize) -> bool {
        if Self::bit(&self.used, idx) {
            return false;
        }
        Self::set_bit(&mut self.used, idx);
        self.used_frames += 1;
        true
    }

    /// First-fit scan for `count` contiguous free frames
    fn find_span(&self, count: usize) -> Option<usize> {
        let mut run = 0;
        let mut start = 0;
        for idx in 0..self.total_frames {
            if Self::bit(&self.used, idx) {
                run = 0;
            } else {
                if run == 0 {
                    start = idx;
                }
                run += 1;
                if run == count {
                    return Some(start);
                }
            }
        }
        None
    }
}

impl BitmapFrameAllocator {
    /// Create an uninitialized allocator
    pub const fn new() -> Self {
        Self {
            inner: IrqSpinlock::new(FrameAllocatorInner {
                used: [0; BITMAP_WORDS],
                reserved: [0; BITMAP_WORDS],
                total_frames: 0,
                used_frames: 0,
                reserved_frames: 0,
                next_free: 0,
            }),
        }
    }

    /// Initialize from the bootloader memory map
    ///
    /// Every non-`Usable` region and the first 1 MiB are reserved; the
    /// bitmap covers RAM from physical 0 to the end of the highest
    /// entry.
    pub fn init(&self, map: &MemoryMap) {
        let mut inner = self.inner.lock();

        let highest = map
            .iter()
            .map(|e| e.base_address + e.length)
            .max()
            .unwrap_or(0);
        inner.total_frames = ((highest as usize) / FRAME_SIZE).min(MAX_FRAMES);

        // Everything starts reserved; usable regions are then released.
        // Holes in the memory map stay reserved that way.
        for w in 0..BITMAP_WORDS {
            inner.used[w] = !0;
            inner.reserved[w] = !0;
        }

        for entry in map.iter() {
            if entry.kind != MemoryType::Usable {
                continue;
            }
            let first = (entry.base_address as usize).div_ceil(FRAME_SIZE);
            let last = ((entry.base_address + entry.length) as usize) / FRAME_SIZE;
            for idx in first..last.min(inner.total_frames) {
                FrameAllocatorInner::clear_bit(&mut inner.used, idx);
                FrameAllocatorInner::clear_bit(&mut inner.reserved, idx);
            }
        }

        // The first megabyte is never handed out
        for idx in 0..LOW_MEMORY_FRAMES.min(inner.total_frames) {
            FrameAllocatorInner::set_bit(&mut inner.used, idx);
            FrameAllocatorInner::set_bit(&mut inner.reserved, idx);
        }

        // Recount reserved bits within the covered range
        let total = inner.total_frames;
        inner.reserved_frames = (0..total)
            .filter(|&idx| FrameAllocatorInner::bit(&inner.reserved, idx))
            .count();
        inner.used_frames = 0;
        inner.next_free = LOW_MEMORY_FRAMES;
    }

    /// Allocate the lowest-index free frame
    pub fn request_frame(&self) -> Option<u64> {
        let mut inner = self.inner.lock();

        let num_words = inner.total_frames.div_ceil(64);
        let start_word = inner.next_free / 64;

        for offset in 0..num_words {
            let word_idx = (start_word + offset) % num_words;
            let word = !inner.used[word_idx];
            if word == 0 {
                continue;
            }

            let bit = word.trailing_zeros() as usize;
            let idx = word_idx * 64 + bit;
            if idx >= inner.total_frames {
                continue;
            }

            inner.take(idx);
            inner.next_free = idx + 1;
            return Some((idx * FRAME_SIZE) as u64);
        }

        None
    }

    /// Allocate `count` contiguous frames (first-fit), returning the base
    pub fn request_frames(&self, count: usize) -> Option<u64> {
        if count == 0 {
            return None;
        }
        if count == 1 {
            return self.request_frame();
        }

        let mut inner = self.inner.lock();
        let start = inner.find_span(count)?;
        for idx in start..start + count {
            inner.take(idx);
        }
        inner.next_free = start + count;
        Some((start * FRAME_SIZE) as u64)
    }

    /// Free one frame
    ///
    /// Double-frees are idempotent but logged; freeing a reserved frame
    /// is an invariant violation.
    pub fn free_frame(&self, frame: u64) {
        self.free_frames(frame, 1);
    }

    /// Free `count` contiguous frames starting at `base`
    pub fn free_frames(&self, base: u64, count: usize) {
        let mut inner = self.inner.lock();
        let first = (base as usize) / FRAME_SIZE;

        for idx in first..first + count {
            if idx >= inner.total_frames {
                break;
            }
            if FrameAllocatorInner::bit(&inner.reserved, idx) {
                panic!(
                    "free of reserved frame {:#x}",
                    (idx * FRAME_SIZE) as u64
                );
            }
            if !FrameAllocatorInner::bit(&inner.used, idx) {
                printkln!("mm: double free of frame {:#x}", (idx * FRAME_SIZE) as u64);
                continue;
            }
            FrameAllocatorInner::clear_bit(&mut inner.used, idx);
            inner.used_frames -= 1;
            if idx < inner.next_free {
                inner.next_free = idx;
            }
        }
    }

    /// Reserve one frame, even if currently free
    pub fn reserve_frame(&self, frame: u64) {
        self.reserve_frames(frame, 1);
    }

    /// Reserve `count` contiguous frames starting at `base`
    pub fn reserve_frames(&self, base: u64, count: usize) {
        let mut inner = self.inner.lock();
        let first = (base as usize) / FRAME_SIZE;

        for idx in first..first + count {
            if idx >= inner.total_frames {
                break;
            }
            if FrameAllocatorInner::bit(&inner.reserved, idx) {
                continue;
            }
            // A frame moving from allocated to reserved leaves the used
            // counter; it is no longer an allocation.
            if FrameAllocatorInner::bit(&inner.used, idx) {
                inner.used_frames -= 1;
            } else {
                FrameAllocatorInner::set_bit(&mut inner.used, idx);
            }
            FrameAllocatorInner::set_bit(&mut inner.reserved, idx);
            inner.reserved_frames += 1;
        }
    }

    /// Allocated bytes (excluding reserved)
    pub fn get_used(&self) -> u64 {
        (self.inner.lock().used_frames * FRAME_SIZE) as u64
    }

    /// Total bytes covered
    pub fn get_total(&self) -> u64 {
        (self.inner.lock().total_frames * FRAME_SIZE) as u64
    }

    /// Reserved bytes
    pub fn get_reserved(&self) -> u64 {
        (self.inner.lock().reserved_frames * FRAME_SIZE) as u64
    }

    /// Free bytes
    pub fn get_free(&self) -> u64 {
        let inner = self.inner.lock();
        ((inner.total_frames - inner.used_frames - inner.reserved_frames) * FRAME_SIZE) as u64
    }
}

impl Default for BitmapFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapter for traits requiring `&mut self` over the shared allocator
pub struct FrameAllocRef<'a>(pub &'a BitmapFrameAllocator);

impl FrameAlloc for FrameAllocRef<'_> {
    fn alloc_frame(&mut self) -> Option<u64> {
        self.0.request_frame()
    }

    fn alloc_frames(&mut self, count: usize) -> Option<u64> {
        self.0.request_frames(count)
    }

    fn free_frame(&mut self, frame: u64) {
        self.0.free_frame(frame)
    }

    fn free_frames(&mut self, base: u64, count: usize) {
        self.0.free_frames(base, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootinfo::{MAX_MEMORY_ENTRIES, MemoryEntry, MemoryMap};

    fn test_map(usable_mb: u64) -> MemoryMap {
        let mut map = MemoryMap {
            entries: 1,
            entry: [MemoryEntry::default(); MAX_MEMORY_ENTRIES],
            size: usable_mb * 1024 * 1024,
        };
        map.entry[0] = MemoryEntry {
            base_address: 0,
            length: usable_mb * 1024 * 1024,
            kind: MemoryType::Usable,
        };
        map
    }

    fn fresh(usable_mb: u64) -> &'static BitmapFrameAllocator {
        let alloc: &'static BitmapFrameAllocator =
            alloc::boxed::Box::leak(alloc::boxed::Box::new(BitmapFrameAllocator::new()));
        alloc.init(&test_map(usable_mb));
        alloc
    }

    #[test]
    fn test_counters_balance() {
        let pfa = fresh(16);
        let total = pfa.get_total();
        assert_eq!(total, 16 * 1024 * 1024);
        // First MiB reserved
        assert_eq!(pfa.get_reserved(), 1024 * 1024);
        assert_eq!(pfa.get_used(), 0);
        assert_eq!(pfa.get_used() + pfa.get_free(), total - pfa.get_reserved());

        let f = pfa.request_frame().unwrap();
        assert_eq!(pfa.get_used(), FRAME_SIZE as u64);
        assert_eq!(pfa.get_used() + pfa.get_free(), total - pfa.get_reserved());

        pfa.free_frame(f);
        assert_eq!(pfa.get_used(), 0);
    }

    #[test]
    fn test_lowest_index_first_and_reuse() {
        let pfa = fresh(16);
        let a = pfa.request_frame().unwrap();
        let b = pfa.request_frame().unwrap();
        assert_eq!(a, 0x10_0000);
        assert_eq!(b, a + FRAME_SIZE as u64);

        // Freed frame comes back on the next request of the same size
        pfa.free_frame(a);
        assert_eq!(pfa.request_frame().unwrap(), a);
    }

    #[test]
    fn test_contiguous_span_first_fit() {
        let pfa = fresh(16);
        let a = pfa.request_frame().unwrap();
        let span = pfa.request_frames(8).unwrap();
        assert_eq!(span, a + FRAME_SIZE as u64);
        // Whole span is accounted
        assert_eq!(pfa.get_used(), 9 * FRAME_SIZE as u64);

        // Punch a hole too small for the next span and make sure
        // first-fit skips it
        pfa.free_frames(span, 2);
        let big = pfa.request_frames(4).unwrap();
        assert!(big >= span + 2 * FRAME_SIZE as u64);
    }

    #[test]
    fn test_double_free_is_idempotent() {
        let pfa = fresh(16);
        let f = pfa.request_frame().unwrap();
        pfa.free_frame(f);
        pfa.free_frame(f);
        assert_eq!(pfa.get_used(), 0);
    }

    #[test]
    fn test_reserve_excludes_from_allocation() {
        let pfa = fresh(16);
        let reserved_before = pfa.get_reserved();
        // Reserve the first two allocatable frames
        pfa.reserve_frames(0x10_0000, 2);
        assert_eq!(pfa.get_reserved(), reserved_before + 2 * FRAME_SIZE as u64);

        let f = pfa.request_frame().unwrap();
        assert_eq!(f, 0x10_0000 + 2 * FRAME_SIZE as u64);
    }

    #[test]
    fn test_non_usable_regions_never_allocated() {
        let mut map = test_map(16);
        map.entries = 2;
        // Carve a reserved hole right after the first MiB
        map.entry[0].length = 1024 * 1024;
        map.entry[1] = MemoryEntry {
            base_address: 2 * 1024 * 1024,
            length: 14 * 1024 * 1024,
            kind: MemoryType::Usable,
        };
        let alloc: &'static BitmapFrameAllocator =
            alloc::boxed::Box::leak(alloc::boxed::Box::new(BitmapFrameAllocator::new()));
        alloc.init(&map);

        let f = alloc.request_frame().unwrap();
        assert_eq!(f, 2 * 1024 * 1024);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let pfa = fresh(2);
        let allocatable = (pfa.get_total() - pfa.get_reserved()) / FRAME_SIZE as u64;
        for _ in 0..allocatable {
            assert!(pfa.request_frame().is_some());
        }
        assert!(pfa.request_frame().is_none());
        assert_eq!(pfa.get_free(), 0);
    }
}
