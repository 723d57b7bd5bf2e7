//! x86-64 paging (4-level page tables)
//!
//! PML4 -> PDPT -> PD -> PT -> physical page, with 1 GiB leaf entries at
//! the PDPT level when the CPU advertises PAGE1GB and PSE.
//!
//! The walker goes through the direct map (`phys_to_virt`), so it can run
//! before and after the kernel table is installed. Directory frames are
//! owned by the table and freed by `destroy`; leaf frames belong to
//! whoever requested the mapping.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::arch::{FrameAlloc, MapError, PageFlags, PageTable};

/// Page size (4 KiB)
pub const PAGE_SIZE: u64 = 4096;

/// 1 GiB super-page size
pub const PAGE_SIZE_1G: u64 = 1 << 30;

/// Page table entry flags
pub const PAGE_PRESENT: u64 = 1 << 0;
pub const PAGE_WRITABLE: u64 = 1 << 1;
pub const PAGE_USER: u64 = 1 << 2;
pub const PAGE_WRITE_THROUGH: u64 = 1 << 3;
pub const PAGE_CACHE_DISABLE: u64 = 1 << 4;
pub const PAGE_ACCESSED: u64 = 1 << 5;
pub const PAGE_HUGE: u64 = 1 << 7;
pub const PAGE_GLOBAL: u64 = 1 << 8;
pub const PAGE_NO_EXECUTE: u64 = 1 << 63;

/// Mask for the physical address in a page table entry
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Number of entries per table
const ENTRIES_PER_TABLE: usize = 512;

/// First PML4 slot of the kernel half
const KERNEL_PML4_START: usize = 256;

/// Direct-map offset: physical 0 maps to this virtual address.
/// Identity for now; becomes a high-half constant when the kernel
/// moves off the identity map.
pub const PAGE_OFFSET: u64 = 0;

/// Convert a physical address to its direct-map virtual address
#[inline]
pub fn phys_to_virt(phys: u64) -> *mut u8 {
    (phys + PAGE_OFFSET) as *mut u8
}

#[inline]
fn phys_to_table(phys: u64) -> *mut RawPageTable {
    phys_to_virt(phys) as *mut RawPageTable
}

/// Whether 1 GiB leaf mappings may be used, probed once at boot
static PAGE_1GB_AVAILABLE: AtomicBool = AtomicBool::new(false);

/// Kernel PML4 physical address, registered when the kernel table is built
static KERNEL_PML4: AtomicU64 = AtomicU64::new(0);

/// Optional remote-TLB-invalidate broadcast installed by the SMP glue
static SHOOTDOWN_FN: AtomicUsize = AtomicUsize::new(0);

/// Probe CPU features and record whether 1 GiB pages may be used
pub fn init_paging_features() {
    let features = super::cpu::cpu_features();
    PAGE_1GB_AVAILABLE.store(features.page_1gb && features.pse, Ordering::Relaxed);
}

/// Whether optimized_map may emit 1 GiB entries
pub fn page_1gb_available() -> bool {
    PAGE_1GB_AVAILABLE.load(Ordering::Relaxed)
}

/// Register the kernel page table so user tables can share its upper half
pub fn set_kernel_table(pml4_phys: u64) {
    KERNEL_PML4.store(pml4_phys, Ordering::Release);
}

/// Install the remote TLB invalidation broadcast (SMP glue)
pub fn set_shootdown_broadcast(f: fn(u64)) {
    SHOOTDOWN_FN.store(f as usize, Ordering::Release);
}

/// Invalidate `va` locally and on every online CPU
fn tlb_shootdown(va: u64) {
    #[cfg(target_os = "none")]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
    }
    #[cfg(not(target_os = "none"))]
    let _ = va;

    // Remote CPUs are reached through the interrupt-controller glue
    let raw = SHOOTDOWN_FN.load(Ordering::Acquire);
    if raw != 0 {
        let f: fn(u64) = unsafe { core::mem::transmute(raw) };
        f(va);
    }
}

/// Read CR3
#[inline]
pub fn current_cr3() -> u64 {
    #[cfg(target_os = "none")]
    {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack));
        }
        cr3 & ADDR_MASK
    }
    #[cfg(not(target_os = "none"))]
    0
}

/// Load CR3, switching address spaces
///
/// # Safety
/// `pml4_phys` must point to a valid PML4 with the kernel half mapped.
pub unsafe fn load_cr3(pml4_phys: u64) {
    #[cfg(target_os = "none")]
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) pml4_phys, options(nostack));
    }
    #[cfg(not(target_os = "none"))]
    let _ = pml4_phys;
}

/// Page table entry
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn is_present(&self) -> bool {
        self.0 & PAGE_PRESENT != 0
    }

    /// Huge leaf (1 GiB in the PDPT, 2 MiB in the PD)
    pub fn is_huge(&self) -> bool {
        self.0 & PAGE_HUGE != 0
    }

    pub fn addr(&self) -> u64 {
        self.0 & ADDR_MASK
    }

    pub fn flags(&self) -> u64 {
        self.0 & !ADDR_MASK
    }

    pub fn set(&mut self, phys_addr: u64, flags: u64) {
        self.0 = (phys_addr & ADDR_MASK) | flags;
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// A raw table at any level (PML4, PDPT, PD or PT)
#[repr(C, align(4096))]
pub struct RawPageTable {
    pub entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

/// Translate kernel-facing flags into entry bits
fn entry_flags(flags: PageFlags) -> u64 {
    let mut bits = PAGE_PRESENT;
    if flags.contains(PageFlags::RW) {
        bits |= PAGE_WRITABLE;
    }
    if flags.contains(PageFlags::US) {
        bits |= PAGE_USER;
    }
    if flags.contains(PageFlags::G) {
        bits |= PAGE_GLOBAL;
    }
    if flags.contains(PageFlags::NX) {
        bits |= PAGE_NO_EXECUTE;
    }
    if flags.contains(PageFlags::WRITE_THROUGH) {
        bits |= PAGE_WRITE_THROUGH;
    }
    if flags.contains(PageFlags::CACHE_DISABLE) {
        bits |= PAGE_CACHE_DISABLE;
    }
    bits
}

/// Split a virtual address into table indices
#[inline]
fn page_indices(va: u64) -> (usize, usize, usize, usize) {
    (
        ((va >> 39) & 0x1FF) as usize,
        ((va >> 30) & 0x1FF) as usize,
        ((va >> 21) & 0x1FF) as usize,
        ((va >> 12) & 0x1FF) as usize,
    )
}

/// x86-64 page table
pub struct X86_64PageTable {
    /// Physical address of the PML4
    pml4_phys: u64,
}

impl X86_64PageTable {
    /// Wrap an existing PML4
    pub fn from_phys(pml4_phys: u64) -> Self {
        Self { pml4_phys }
    }

    /// The currently loaded table (CR3)
    pub fn kernel_identity() -> Self {
        Self::from_phys(current_cr3())
    }

    /// Get or create the next-level table behind `entry`
    ///
    /// Intermediate entries carry PRESENT|WRITABLE|USER so that leaf
    /// flags alone decide the final access rights.
    unsafe fn descend<FA: FrameAlloc>(
        entry: &mut PageTableEntry,
        frame_alloc: &mut FA,
    ) -> Result<*mut RawPageTable, MapError> {
        if !entry.is_present() {
            let table_phys = frame_alloc
                .alloc_frame()
                .ok_or(MapError::FrameAllocationFailed)?;
            unsafe {
                core::ptr::write_bytes(phys_to_virt(table_phys), 0, PAGE_SIZE as usize);
            }
            entry.set(table_phys, PAGE_PRESENT | PAGE_WRITABLE | PAGE_USER);
        }
        Ok(phys_to_table(entry.addr()))
    }

    /// Install a 1 GiB leaf at the PDPT level
    fn map_1g<FA: FrameAlloc>(
        &mut self,
        va: u64,
        pa: u64,
        flags: PageFlags,
        frame_alloc: &mut FA,
    ) -> Result<(), MapError> {
        if va % PAGE_SIZE_1G != 0 || pa % PAGE_SIZE_1G != 0 {
            return Err(MapError::InvalidArgument);
        }
        let bits = entry_flags(flags) | PAGE_HUGE;
        let (pml4_idx, pdpt_idx, _, _) = page_indices(va);

        unsafe {
            let pml4 = phys_to_table(self.pml4_phys);
            let pdpt = Self::descend(&mut (*pml4).entries[pml4_idx], frame_alloc)?;

            let entry = &mut (*pdpt).entries[pdpt_idx];
            if entry.is_present() {
                if entry.addr() == pa && entry.flags() == bits {
                    return Ok(());
                }
                return Err(MapError::AlreadyMapped);
            }
            entry.set(pa, bits);
        }

        tlb_shootdown(va);
        Ok(())
    }
}

impl PageTable for X86_64PageTable {
    fn map<FA: FrameAlloc>(
        &mut self,
        va: u64,
        pa: u64,
        flags: PageFlags,
        frame_alloc: &mut FA,
    ) -> Result<(), MapError> {
        if va % PAGE_SIZE != 0 || pa % PAGE_SIZE != 0 {
            return Err(MapError::InvalidArgument);
        }

        let bits = entry_flags(flags);
        let (pml4_idx, pdpt_idx, pd_idx, pt_idx) = page_indices(va);

        unsafe {
            let pml4 = phys_to_table(self.pml4_phys);
            let pdpt = Self::descend(&mut (*pml4).entries[pml4_idx], frame_alloc)?;
            let pd = Self::descend(&mut (*pdpt).entries[pdpt_idx], frame_alloc)?;
            let pt = Self::descend(&mut (*pd).entries[pd_idx], frame_alloc)?;

            let entry = &mut (*pt).entries[pt_idx];
            if entry.is_present() {
                // Idempotent only for an identical mapping
                if entry.addr() == pa && entry.flags() == bits {
                    return Ok(());
                }
                return Err(MapError::AlreadyMapped);
            }
            entry.set(pa, bits);
        }

        tlb_shootdown(va);
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
        if va % PAGE_SIZE != 0 || pa % PAGE_SIZE != 0 {
            return Err(MapError::InvalidArgument);
        }

        let end = va
            .checked_add(length)
            .ok_or(MapError::InvalidArgument)?
            .next_multiple_of(PAGE_SIZE);
        let mut cur_va = va;
        let mut cur_pa = pa;

        // 4 KiB prefix up to the first 1 GiB boundary, 1 GiB middle,
        // 4 KiB suffix. Virtual and physical must share 1 GiB phase for
        // the middle to be usable at all.
        let use_1g = page_1gb_available()
            && (va % PAGE_SIZE_1G) == (pa % PAGE_SIZE_1G)
            && end.saturating_sub(va) >= PAGE_SIZE_1G;

        while cur_va < end {
            let remaining = end - cur_va;
            if use_1g && cur_va % PAGE_SIZE_1G == 0 && remaining >= PAGE_SIZE_1G {
                self.map_1g(cur_va, cur_pa, flags, frame_alloc)?;
                cur_va += PAGE_SIZE_1G;
                cur_pa += PAGE_SIZE_1G;
            } else {
                self.map(cur_va, cur_pa, flags, frame_alloc)?;
                cur_va += PAGE_SIZE;
                cur_pa += PAGE_SIZE;
            }
        }

        Ok(())
    }

    fn unmap(&mut self, va: u64) {
        let (pml4_idx, pdpt_idx, pd_idx, pt_idx) = page_indices(va);

        unsafe {
            let pml4 = phys_to_table(self.pml4_phys);
            let pml4_entry = &(*pml4).entries[pml4_idx];
            if !pml4_entry.is_present() {
                return;
            }

            let pdpt = phys_to_table(pml4_entry.addr());
            let pdpt_entry = &mut (*pdpt).entries[pdpt_idx];
            if !pdpt_entry.is_present() {
                return;
            }
            if pdpt_entry.is_huge() {
                pdpt_entry.clear();
                tlb_shootdown(va);
                return;
            }

            let pd = phys_to_table(pdpt_entry.addr());
            let pd_entry = &mut (*pd).entries[pd_idx];
            if !pd_entry.is_present() {
                return;
            }
            if pd_entry.is_huge() {
                pd_entry.clear();
                tlb_shootdown(va);
                return;
            }

            let pt = phys_to_table(pd_entry.addr());
            let pt_entry = &mut (*pt).entries[pt_idx];
            if !pt_entry.is_present() {
                return;
            }
            pt_entry.clear();
        }

        tlb_shootdown(va);
    }

    fn is_mapped(&self, va: u64) -> bool {
        self.translate(va).is_some()
    }

    fn translate(&self, va: u64) -> Option<u64> {
        let (pml4_idx, pdpt_idx, pd_idx, pt_idx) = page_indices(va);

        unsafe {
            let pml4 = phys_to_table(self.pml4_phys);
            let pml4_entry = &(*pml4).entries[pml4_idx];
            if !pml4_entry.is_present() {
                return None;
            }

            let pdpt = phys_to_table(pml4_entry.addr());
            let pdpt_entry = &(*pdpt).entries[pdpt_idx];
            if !pdpt_entry.is_present() {
                return None;
            }
            if pdpt_entry.is_huge() {
                return Some(pdpt_entry.addr() + (va & (PAGE_SIZE_1G - 1)));
            }

            let pd = phys_to_table(pdpt_entry.addr());
            let pd_entry = &(*pd).entries[pd_idx];
            if !pd_entry.is_present() {
                return None;
            }
            if pd_entry.is_huge() {
                const PAGE_SIZE_2M: u64 = 2 * 1024 * 1024;
                return Some(pd_entry.addr() + (va & (PAGE_SIZE_2M - 1)));
            }

            let pt = phys_to_table(pd_entry.addr());
            let pt_entry = &(*pt).entries[pt_idx];
            if !pt_entry.is_present() {
                return None;
            }
            Some(pt_entry.addr())
        }
    }

    fn new_user<FA: FrameAlloc>(frame_alloc: &mut FA) -> Option<Self> {
        let pml4_phys = frame_alloc.alloc_frame()?;
        unsafe {
            core::ptr::write_bytes(phys_to_virt(pml4_phys), 0, PAGE_SIZE as usize);
        }
        Some(Self::from_phys(pml4_phys))
    }

    fn copy_kernel_mappings(&mut self) {
        let kernel_pml4 = KERNEL_PML4.load(Ordering::Acquire);
        let source = if kernel_pml4 != 0 {
            kernel_pml4
        } else {
            current_cr3()
        };
        if source == 0 {
            return;
        }

        unsafe {
            let src = phys_to_table(source);
            let dst = phys_to_table(self.pml4_phys);
            for i in KERNEL_PML4_START..ENTRIES_PER_TABLE {
                (*dst).entries[i] = (*src).entries[i];
            }
        }
    }

    fn destroy<FA: FrameAlloc>(self, frame_alloc: &mut FA) {
        // Only the lower half belongs to this table; the upper half is
        // the shared kernel mapping.
        unsafe {
            let pml4 = phys_to_table(self.pml4_phys);
            for pml4_idx in 0..KERNEL_PML4_START {
                let pml4_entry = &(*pml4).entries[pml4_idx];
                if !pml4_entry.is_present() {
                    continue;
                }

                let pdpt = phys_to_table(pml4_entry.addr());
                for pdpt_idx in 0..ENTRIES_PER_TABLE {
                    let pdpt_entry = &(*pdpt).entries[pdpt_idx];
                    if !pdpt_entry.is_present() || pdpt_entry.is_huge() {
                        continue;
                    }

                    let pd = phys_to_table(pdpt_entry.addr());
                    for pd_idx in 0..ENTRIES_PER_TABLE {
                        let pd_entry = &(*pd).entries[pd_idx];
                        if !pd_entry.is_present() || pd_entry.is_huge() {
                            continue;
                        }
                        frame_alloc.free_frame(pd_entry.addr());
                    }
                    frame_alloc.free_frame(pdpt_entry.addr());
                }
                frame_alloc.free_frame(pml4_entry.addr());
            }
        }

        frame_alloc.free_frame(self.pml4_phys);
    }

    fn root_table_phys(&self) -> u64 {
        self.pml4_phys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_indices() {
        // 0x400000 = PD index 2 in the first PDPT slot
        assert_eq!(page_indices(0x40_0000), (0, 0, 2, 0));
        // One past the first PT
        assert_eq!(page_indices(0x20_0000), (0, 0, 1, 0));
        assert_eq!(page_indices(0x1000), (0, 0, 0, 1));
    }

    #[test]
    fn test_entry_flags_translation() {
        let bits = entry_flags(PageFlags::RW | PageFlags::US);
        assert_eq!(bits & PAGE_PRESENT, PAGE_PRESENT);
        assert_eq!(bits & PAGE_WRITABLE, PAGE_WRITABLE);
        assert_eq!(bits & PAGE_USER, PAGE_USER);
        assert_eq!(bits & PAGE_NO_EXECUTE, 0);

        let ro = entry_flags(PageFlags::NX);
        assert_eq!(ro & PAGE_WRITABLE, 0);
        assert_eq!(ro & PAGE_NO_EXECUTE, PAGE_NO_EXECUTE);
    }

    #[test]
    fn test_entry_set_and_mask() {
        let mut entry = PageTableEntry::empty();
        entry.set(0x1234_5000, PAGE_PRESENT | PAGE_WRITABLE);
        assert!(entry.is_present());
        assert!(!entry.is_huge());
        assert_eq!(entry.addr(), 0x1234_5000);
        entry.clear();
        assert!(!entry.is_present());
    }
}
