//! Architecture abstraction layer
//!
//! Type aliases and traits that keep the rest of the kernel
//! architecture-independent:
//!
//! - [`PageTable`] - per-address-space mapping operations
//! - [`FrameAlloc`] - physical frame allocation, so page-table walkers and
//!   loaders can be exercised against a mock allocator
//! - [`CpuOps`] / [`HaltOps`] - interrupt control and halt
//! - [`PerCpuOps`] - current CPU id and current thread id
//!
//! x86-64 is the populated port. i386 and AArch64 attach behind the same
//! traits as sibling modules when those ports land.

extern crate alloc;

use bitflags::bitflags;

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub type CurrentArch = x86_64::X86_64Arch;

#[cfg(target_arch = "x86_64")]
pub use x86_64::ArchPageTable;

// IRQ-safe spinlock - architecture-specific implementation
#[cfg(target_arch = "x86_64")]
pub use x86_64::spinlock::{IrqSpinlock, IrqSpinlockGuard};

#[cfg(target_arch = "x86_64")]
pub use x86_64::paging::{PAGE_SIZE, phys_to_virt};

/// Interrupt vectors below this are CPU exceptions; device vectors are
/// offset by it when drivers bind raw IRQ numbers.
pub const ARCH_BASE_VECTOR: u16 = 32;

bitflags! {
    /// Page mapping flags
    ///
    /// Absence of `RW` means read-only; absence of `US` means kernel-only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        /// Writable
        const RW = 1 << 0;
        /// User-accessible
        const US = 1 << 1;
        /// Global (survives address-space switches)
        const G = 1 << 2;
        /// No-execute
        const NX = 1 << 3;
        /// Write-through caching
        const WRITE_THROUGH = 1 << 4;
        /// Cache disabled
        const CACHE_DISABLE = 1 << 5;
    }
}

/// Error type for page table mapping operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// Failed to allocate a frame for an intermediate table
    FrameAllocationFailed,
    /// Address is already mapped to a different frame or with
    /// different flags
    AlreadyMapped,
    /// Misaligned address or invalid flags
    InvalidArgument,
}

/// Frame allocator trait
pub trait FrameAlloc {
    /// Allocate one physical frame
    fn alloc_frame(&mut self) -> Option<u64>;

    /// Allocate `count` contiguous physical frames, returning the base
    fn alloc_frames(&mut self, count: usize) -> Option<u64>;

    /// Free one physical frame
    fn free_frame(&mut self, frame: u64);

    /// Free `count` contiguous frames starting at `base`
    fn free_frames(&mut self, base: u64, count: usize);
}

/// Page table abstraction
///
/// Each architecture implements this for its translation format; x86-64
/// uses 4-level paging with optional 1 GiB leaf entries.
pub trait PageTable: Sized {
    /// Map one page. Re-mapping an already-present page is idempotent
    /// when frame and flags match, and fails otherwise.
    fn map<FA: FrameAlloc>(
        &mut self,
        va: u64,
        pa: u64,
        flags: PageFlags,
        frame_alloc: &mut FA,
    ) -> Result<(), MapError>;

    /// Map `length` bytes choosing the largest supported page size for
    /// the aligned middle of the range.
    fn optimized_map<FA: FrameAlloc>(
        &mut self,
        va: u64,
        pa: u64,
        length: u64,
        flags: PageFlags,
        frame_alloc: &mut FA,
    ) -> Result<(), MapError>;

    /// Unmap one page and invalidate it on every online CPU
    fn unmap(&mut self, va: u64);

    /// True iff a present leaf entry covers `va`
    fn is_mapped(&self, va: u64) -> bool;

    /// Translate a virtual address to its physical frame base
    fn translate(&self, va: u64) -> Option<u64>;

    /// Create a new user address space (allocates the root table)
    fn new_user<FA: FrameAlloc>(frame_alloc: &mut FA) -> Option<Self>;

    /// Share the kernel's upper-half mappings into this table
    fn copy_kernel_mappings(&mut self);

    /// Free every lower-half leaf and directory frame owned by this
    /// table, then the root. Kernel-range entries are shared and kept.
    fn destroy<FA: FrameAlloc>(self, frame_alloc: &mut FA);

    /// Physical address of the root table (CR3 on x86-64)
    fn root_table_phys(&self) -> u64;
}

/// CPU control operations
pub trait CpuOps {
    /// Enable interrupts
    fn enable_interrupts();

    /// Disable interrupts
    fn disable_interrupts();

    /// Halt the CPU until the next interrupt
    fn halt();
}

/// CPU halt-forever for panic/error paths
pub trait HaltOps {
    /// Disable interrupts and halt forever
    fn halt_loop() -> !;
}

/// Mock implementations for hosted unit tests
///
/// A page table over a map and a frame allocator over a bump counter,
/// so walkers, the program break and the loaders can be exercised
/// without touching real memory.
#[cfg(test)]
pub(crate) mod mock {
    use super::{FrameAlloc, MapError, PageFlags, PageTable};
    use alloc::collections::BTreeMap;

    pub struct MockPageTable {
        pub mappings: BTreeMap<u64, (u64, PageFlags)>,
        root: u64,
    }

    impl MockPageTable {
        pub fn new() -> Self {
            Self {
                mappings: BTreeMap::new(),
                root: 0x1000,
            }
        }
    }

    impl PageTable for MockPageTable {
        fn map<FA: FrameAlloc>(
            &mut self,
            va: u64,
            pa: u64,
            flags: PageFlags,
            _frame_alloc: &mut FA,
        ) -> Result<(), MapError> {
            if let Some(&(existing_pa, existing_flags)) = self.mappings.get(&va) {
                if existing_pa == pa && existing_flags == flags {
                    return Ok(());
                }
                return Err(MapError::AlreadyMapped);
            }
            self.mappings.insert(va, (pa, flags));
            Ok(())
        }

        fn optimized_map<FA: FrameAlloc>(
            &mut self,
            va: u64,
            pa: u64,
            length: u64,
            flags: PageFlags,
            frame_alloc: &mut FA,
        ) -> Result<(), MapError> {
            let pages = length.div_ceil(super::PAGE_SIZE);
            for i in 0..pages {
                self.map(
                    va + i * super::PAGE_SIZE,
                    pa + i * super::PAGE_SIZE,
                    flags,
                    frame_alloc,
                )?;
            }
            Ok(())
        }

        fn unmap(&mut self, va: u64) {
            self.mappings.remove(&va);
        }

        fn is_mapped(&self, va: u64) -> bool {
            self.mappings.contains_key(&va)
        }

        fn translate(&self, va: u64) -> Option<u64> {
            self.mappings.get(&va).map(|&(pa, _)| pa)
        }

        fn new_user<FA: FrameAlloc>(_frame_alloc: &mut FA) -> Option<Self> {
            Some(Self::new())
        }

        fn copy_kernel_mappings(&mut self) {}

        fn destroy<FA: FrameAlloc>(self, _frame_alloc: &mut FA) {}

        fn root_table_phys(&self) -> u64 {
            self.root
        }
    }

    pub struct MockFrameAlloc {
        next: u64,
    }

    impl MockFrameAlloc {
        pub fn new() -> Self {
            Self { next: 0x10_0000 }
        }
    }

    impl FrameAlloc for MockFrameAlloc {
        fn alloc_frame(&mut self) -> Option<u64> {
            let frame = self.next;
            self.next += super::PAGE_SIZE;
            Some(frame)
        }

        fn alloc_frames(&mut self, count: usize) -> Option<u64> {
            let base = self.next;
            self.next += count as u64 * super::PAGE_SIZE;
            Some(base)
        }

        fn free_frame(&mut self, _frame: u64) {}

        fn free_frames(&mut self, _base: u64, _count: usize) {}
    }
}

/// Per-CPU data access
pub trait PerCpuOps {
    /// Maximum number of CPUs supported by this architecture
    const MAX_CPUS: usize;

    /// Current CPU id (0 on the BSP before SMP bring-up)
    fn current_cpu_id() -> usize;

    /// Number of online CPUs
    fn online_cpus() -> usize;

    /// Current thread id on this CPU (0 = none)
    fn current_tid() -> u64;

    /// Set the current thread id on this CPU
    fn set_current_tid(tid: u64);
}
