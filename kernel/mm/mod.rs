//! Memory management
//!
//! - [`frame_alloc`] - bitmap physical frame allocator
//! - [`heap`] - kernel heap (three selectable algorithms)
//! - [`tracker`] - per-owner frame tracking with free-on-drop
//! - [`brk`] - per-process program break

pub mod brk;
pub mod frame_alloc;
pub mod heap;
pub mod tracker;

pub use frame_alloc::BitmapFrameAllocator;
pub use tracker::MemoryTracker;

use crate::arch::PAGE_SIZE;

/// Number of pages needed to hold `bytes`
#[inline]
pub const fn pages_for(bytes: u64) -> usize {
    (bytes.div_ceil(PAGE_SIZE)) as usize
}

/// Global frame allocator
pub static FRAME_ALLOCATOR: BitmapFrameAllocator = BitmapFrameAllocator::new();

#[cfg(target_arch = "x86_64")]
use crate::arch::{ArchPageTable, IrqSpinlock};
#[cfg(target_arch = "x86_64")]
use spin::Once;

/// The kernel's own page table, installed during `Entry`
#[cfg(target_arch = "x86_64")]
static KERNEL_PAGE_TABLE: Once<IrqSpinlock<ArchPageTable>> = Once::new();

/// Register the kernel page table (once, during `Entry`)
#[cfg(target_arch = "x86_64")]
pub fn set_kernel_page_table(table: ArchPageTable) {
    use crate::arch::PageTable;
    crate::arch::x86_64::paging::set_kernel_table(table.root_table_phys());
    KERNEL_PAGE_TABLE.call_once(|| IrqSpinlock::new(table));
}

/// The kernel page table, if installed
#[cfg(target_arch = "x86_64")]
pub fn kernel_page_table() -> Option<&'static IrqSpinlock<ArchPageTable>> {
    KERNEL_PAGE_TABLE.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pages_for_rounds_up() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
        assert_eq!(pages_for(3 * PAGE_SIZE), 3);
    }
}
