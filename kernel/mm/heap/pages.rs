//! Page-granular heap backend (default)
//!
//! Every allocation takes whole frames straight from the frame
//! allocator and is addressed through the direct map. The span length
//! is recorded in the backend header so free can return exactly the
//! frames that were taken.

use crate::arch::{PAGE_SIZE, phys_to_virt};
use crate::mm::FRAME_ALLOCATOR;
use crate::mm::pages_for;

/// Marks a live page-span header
const PAGES_MAGIC: u64 = 0x7067_7370_616e_6b31; // "pgspank1"

/// Page-granular heap
pub struct PageHeap;

impl PageHeap {
    pub const fn new() -> Self {
        Self
    }

    /// Allocate a span of frames holding `total` bytes
    pub fn raw_alloc(&mut self, total: usize) -> Option<*mut u8> {
        let pages = pages_for(total as u64);
        let base = FRAME_ALLOCATOR.request_frames(pages)?;

        let raw = phys_to_virt(base);
        unsafe {
            *(raw as *mut u64) = pages as u64;
            *(raw.add(8) as *mut u64) = PAGES_MAGIC;
        }
        Some(raw)
    }

    /// Free a span
    pub fn raw_free(&mut self, raw: *mut u8) {
        let (pages, magic) = unsafe { (*(raw as *const u64), *(raw.add(8) as *const u64)) };
        if magic != PAGES_MAGIC {
            panic!("heap: corrupt page-span header at {:p}", raw);
        }
        unsafe {
            // Poison the magic so a double free trips the check above
            *(raw.add(8) as *mut u64) = 0;
        }
        FRAME_ALLOCATOR.free_frames(raw as u64, pages as usize);
    }

    /// Usable bytes in the span
    pub fn raw_size(&self, raw: *mut u8) -> usize {
        let pages = unsafe { *(raw as *const u64) };
        (pages * PAGE_SIZE) as usize
    }
}
