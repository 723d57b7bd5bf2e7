//! x86-64 architecture support
//!
//! GDT/IDT programming, APIC and timer setup, and the low-level entry
//! stubs are external collaborators; what lives here is the paging
//! implementation, the IRQ-safe spinlock, the interrupt hook table, the
//! syscall frame, and CPU control primitives.

pub mod cpu;
pub mod interrupts;
pub mod paging;
pub mod percpu;
pub mod spinlock;
pub mod syscall;

use crate::arch::{CpuOps, HaltOps, PerCpuOps};

/// Concrete page table type for this architecture
pub type ArchPageTable = paging::X86_64PageTable;

/// Marker type implementing the architecture traits
pub struct X86_64Arch;

impl CpuOps for X86_64Arch {
    fn enable_interrupts() {
        cpu::enable_interrupts();
    }

    fn disable_interrupts() {
        cpu::disable_interrupts();
    }

    fn halt() {
        cpu::halt();
    }
}

impl HaltOps for X86_64Arch {
    fn halt_loop() -> ! {
        cpu::halt_loop()
    }
}

impl PerCpuOps for X86_64Arch {
    const MAX_CPUS: usize = percpu::MAX_CPUS;

    fn current_cpu_id() -> usize {
        percpu::current_cpu_id()
    }

    fn online_cpus() -> usize {
        percpu::online_cpus()
    }

    fn current_tid() -> u64 {
        percpu::current_tid()
    }

    fn set_current_tid(tid: u64) {
        percpu::set_current_tid(tid);
    }
}
