//! Per-process program break
//!
//! The userspace heap grows and shrinks one page at a time between
//! `heap_start` and the current break. Frames come from the owning
//! process's memory tracker (one tracked span per page, so shrink can
//! free exact pages), and mappings are RW|US in the process page table.

use crate::arch::{FrameAlloc, PAGE_SIZE, PageFlags, PageTable};
use crate::error::{KernelError, KernelResult};
use crate::mm::MemoryTracker;

/// Program break state for one process
pub struct ProgramBreak {
    /// Lowest address the break may retreat to
    heap_start: u64,
    /// Current break (one past the last mapped byte)
    break_addr: u64,
}

impl ProgramBreak {
    /// Create a break starting (and bottoming out) at `heap_start`
    ///
    /// `heap_start` is rounded up to a page boundary.
    pub fn new(heap_start: u64) -> Self {
        let start = heap_start.next_multiple_of(PAGE_SIZE);
        Self {
            heap_start: start,
            break_addr: start,
        }
    }

    /// Current break address
    pub fn current(&self) -> u64 {
        self.break_addr
    }

    /// Start of the heap region
    pub fn heap_start(&self) -> u64 {
        self.heap_start
    }

    /// Move the break to `addr`
    ///
    /// - `addr == 0` returns the current break unchanged
    /// - `addr < heap_start` fails with `NoMemory`
    /// - growing maps new RW|US pages; shrinking unmaps and frees them
    pub fn brk<PT, FA>(
        &mut self,
        table: &mut PT,
        mm: &mut MemoryTracker,
        frame_alloc: &mut FA,
        addr: u64,
    ) -> KernelResult<u64>
    where
        PT: PageTable,
        FA: FrameAlloc,
    {
        if addr == 0 {
            return Ok(self.break_addr);
        }

        if addr < self.heap_start {
            return Err(KernelError::NoMemory);
        }

        if addr > self.break_addr {
            let pages = (addr - self.break_addr).div_ceil(PAGE_SIZE);
            for i in 0..pages {
                let va = self.break_addr + i * PAGE_SIZE;
                let frame = mm.request_frames(1)?;
                table
                    .map(va, frame, PageFlags::RW | PageFlags::US, frame_alloc)
                    .map_err(|_| {
                        let _ = mm.free_frames(frame, 1);
                        KernelError::NoMemory
                    })?;
            }
            self.break_addr = addr;
        } else if addr < self.break_addr {
            let first_kept = addr.next_multiple_of(PAGE_SIZE);
            let mut va = first_kept;
            while va < self.break_addr.next_multiple_of(PAGE_SIZE) {
                if let Some(frame) = table.translate(va) {
                    table.unmap(va);
                    let _ = mm.free_frames(frame, 1);
                }
                va += PAGE_SIZE;
            }
            self.break_addr = addr;
        }

        Ok(self.break_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::mock::{MockFrameAlloc, MockPageTable};
    use crate::bootinfo::{MAX_MEMORY_ENTRIES, MemoryEntry, MemoryMap, MemoryType};
    use crate::mm::BitmapFrameAllocator;
    use crate::mm::frame_alloc::FRAME_SIZE;

    fn fresh_pfa() -> &'static BitmapFrameAllocator {
        let mut map = MemoryMap {
            entries: 1,
            entry: [MemoryEntry::default(); MAX_MEMORY_ENTRIES],
            size: 8 * 1024 * 1024,
        };
        map.entry[0] = MemoryEntry {
            base_address: 0,
            length: 8 * 1024 * 1024,
            kind: MemoryType::Usable,
        };
        let pfa: &'static BitmapFrameAllocator =
            alloc::boxed::Box::leak(alloc::boxed::Box::new(BitmapFrameAllocator::new()));
        pfa.init(&map);
        pfa
    }

    const HEAP_START: u64 = 0x40_0000;

    #[test]
    fn test_null_returns_current() {
        let pfa = fresh_pfa();
        let mut table = MockPageTable::new();
        let mut mm = MemoryTracker::new(pfa);
        let mut fa = MockFrameAlloc::new();

        let mut pb = ProgramBreak::new(HEAP_START);
        assert_eq!(pb.brk(&mut table, &mut mm, &mut fa, 0).unwrap(), HEAP_START);
    }

    #[test]
    fn test_below_heap_start_fails() {
        let pfa = fresh_pfa();
        let mut table = MockPageTable::new();
        let mut mm = MemoryTracker::new(pfa);
        let mut fa = MockFrameAlloc::new();

        let mut pb = ProgramBreak::new(HEAP_START);
        assert_eq!(
            pb.brk(&mut table, &mut mm, &mut fa, HEAP_START - PAGE_SIZE),
            Err(KernelError::NoMemory)
        );
    }

    #[test]
    fn test_grow_maps_rw_us_pages() {
        let pfa = fresh_pfa();
        let mut table = MockPageTable::new();
        let mut mm = MemoryTracker::new(pfa);
        let mut fa = MockFrameAlloc::new();

        let mut pb = ProgramBreak::new(HEAP_START);
        let target = HEAP_START + 3 * PAGE_SIZE;
        assert_eq!(pb.brk(&mut table, &mut mm, &mut fa, target).unwrap(), target);

        for i in 0..3 {
            let va = HEAP_START + i * PAGE_SIZE;
            assert!(table.is_mapped(va));
            let (_, flags) = table.mappings[&va];
            assert_eq!(flags, PageFlags::RW | PageFlags::US);
        }
        assert!(!table.is_mapped(target));
        assert_eq!(pfa.get_used(), 3 * FRAME_SIZE as u64);
    }

    #[test]
    fn test_shrink_unmaps_and_frees() {
        let pfa = fresh_pfa();
        let mut table = MockPageTable::new();
        let mut mm = MemoryTracker::new(pfa);
        let mut fa = MockFrameAlloc::new();

        let mut pb = ProgramBreak::new(HEAP_START);
        pb.brk(&mut table, &mut mm, &mut fa, HEAP_START + 3 * PAGE_SIZE)
            .unwrap();

        let shrunk = HEAP_START + PAGE_SIZE;
        assert_eq!(pb.brk(&mut table, &mut mm, &mut fa, shrunk).unwrap(), shrunk);

        assert!(table.is_mapped(HEAP_START));
        assert!(!table.is_mapped(HEAP_START + PAGE_SIZE));
        assert!(!table.is_mapped(HEAP_START + 2 * PAGE_SIZE));
        assert_eq!(pfa.get_used(), FRAME_SIZE as u64);
    }

    #[test]
    fn test_same_address_is_noop() {
        let pfa = fresh_pfa();
        let mut table = MockPageTable::new();
        let mut mm = MemoryTracker::new(pfa);
        let mut fa = MockFrameAlloc::new();

        let mut pb = ProgramBreak::new(HEAP_START);
        let target = HEAP_START + PAGE_SIZE;
        pb.brk(&mut table, &mut mm, &mut fa, target).unwrap();
        assert_eq!(pb.brk(&mut table, &mut mm, &mut fa, target).unwrap(), target);
        assert_eq!(pfa.get_used(), FRAME_SIZE as u64);
    }
}
